//! Seeded train/test splitters.

use std::collections::{BTreeMap, BTreeSet};

use doa_core::{Dataset, DomainError, DomainResult, Split, Splitter};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// K-fold partitioning reshuffled on every repeat.
///
/// Fold ids run `repeat * n_splits + k`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatedKFold {
    pub n_splits: usize,
    pub n_repeats: usize,
    pub seed: u64,
}

impl RepeatedKFold {
    pub fn new(n_splits: usize, n_repeats: usize, seed: u64) -> Self {
        Self {
            n_splits,
            n_repeats,
            seed,
        }
    }
}

impl Splitter for RepeatedKFold {
    fn split(&self, data: &Dataset) -> DomainResult<Vec<Split>> {
        let n = data.len();
        if self.n_splits < 2 || self.n_repeats == 0 {
            return Err(DomainError::InvalidConfig(format!(
                "k-fold needs n_splits >= 2 and n_repeats >= 1, got {} and {}",
                self.n_splits, self.n_repeats
            )));
        }
        if n < self.n_splits {
            return Err(DomainError::DegenerateSplit(format!(
                "n_samples ({}) must be >= n_splits ({})",
                n, self.n_splits
            )));
        }

        let fold_sizes: Vec<usize> = (0..self.n_splits)
            .map(|i| {
                let base = n / self.n_splits;
                if i < n % self.n_splits {
                    base + 1
                } else {
                    base
                }
            })
            .collect();

        let mut splits = Vec::with_capacity(self.n_splits * self.n_repeats);
        for repeat in 0..self.n_repeats {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(repeat as u64));
            let mut indices: Vec<usize> = (0..n).collect();
            indices.shuffle(&mut rng);

            let mut current = 0;
            for (k, &size) in fold_sizes.iter().enumerate() {
                let test = indices[current..current + size].to_vec();
                let train = indices[..current]
                    .iter()
                    .chain(&indices[current + size..])
                    .copied()
                    .collect();
                splits.push(Split::new(train, test, repeat * self.n_splits + k));
                current += size;
            }
        }
        Ok(splits)
    }
}

/// Independent random train/test partitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleSplit {
    pub n_splits: usize,
    pub test_fraction: f64,
    pub seed: u64,
}

impl ShuffleSplit {
    pub fn new(n_splits: usize, test_fraction: f64, seed: u64) -> Self {
        Self {
            n_splits,
            test_fraction,
            seed,
        }
    }
}

impl Splitter for ShuffleSplit {
    fn split(&self, data: &Dataset) -> DomainResult<Vec<Split>> {
        let n = data.len();
        if self.n_splits == 0 || !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(DomainError::InvalidConfig(format!(
                "shuffle split needs n_splits >= 1 and 0 < test_fraction < 1, got {} and {}",
                self.n_splits, self.test_fraction
            )));
        }
        if n < 2 {
            return Err(DomainError::DegenerateSplit(format!(
                "cannot shuffle-split {} samples",
                n
            )));
        }

        let n_test = ((n as f64 * self.test_fraction).ceil() as usize).clamp(1, n - 1);
        let mut rng = StdRng::seed_from_u64(self.seed);
        Ok((0..self.n_splits)
            .map(|fold_id| {
                let mut indices: Vec<usize> = (0..n).collect();
                indices.shuffle(&mut rng);
                let train = indices.split_off(n_test);
                Split::new(train, indices, fold_id)
            })
            .collect())
    }
}

/// Leave one group out, training on a bootstrap resample of the remaining groups.
///
/// Every repeat holds out each group in turn. The training partition is the
/// deduplicated set of rows drawn with replacement from the other groups, so
/// repeats differ in which neighbouring rows the model sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrappedLeaveGroupOut {
    pub n_repeats: usize,
    pub seed: u64,
}

impl BootstrappedLeaveGroupOut {
    pub fn new(n_repeats: usize, seed: u64) -> Self {
        Self { n_repeats, seed }
    }
}

impl Splitter for BootstrappedLeaveGroupOut {
    fn split(&self, data: &Dataset) -> DomainResult<Vec<Split>> {
        if self.n_repeats == 0 {
            return Err(DomainError::InvalidConfig(
                "leave-group-out needs n_repeats >= 1".to_string(),
            ));
        }

        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, g) in data.g().iter().enumerate() {
            groups.entry(g.as_str()).or_default().push(i);
        }
        if groups.len() < 2 {
            return Err(DomainError::DegenerateSplit(format!(
                "leave-group-out needs at least 2 groups, found {}",
                groups.len()
            )));
        }

        let mut splits = Vec::with_capacity(self.n_repeats * groups.len());
        for repeat in 0..self.n_repeats {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(repeat as u64));
            for (held_out, test) in &groups {
                let pool: Vec<usize> = groups
                    .iter()
                    .filter(|(name, _)| *name != held_out)
                    .flat_map(|(_, rows)| rows.iter().copied())
                    .collect();
                let train: BTreeSet<usize> = (0..pool.len())
                    .map(|_| pool[rng.gen_range(0..pool.len())])
                    .collect();

                splits.push(Split::new(
                    train.into_iter().collect(),
                    test.clone(),
                    splits.len(),
                ));
            }
        }
        Ok(splits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dataset(n: usize, groups: usize) -> Dataset {
        Dataset::new(
            (0..n).map(|i| vec![i as f64]).collect(),
            (0..n).map(|i| i as f64).collect(),
            Some((0..n).map(|i| format!("g{}", i % groups)).collect()),
        )
        .unwrap()
    }

    #[test]
    fn test_kfold_covers_every_index_once_per_repeat() {
        let data = dataset(23, 1);
        let splits = RepeatedKFold::new(5, 2, 42).split(&data).unwrap();
        assert_eq!(splits.len(), 10);

        for repeat in 0..2 {
            let mut seen: Vec<usize> = splits[repeat * 5..(repeat + 1) * 5]
                .iter()
                .flat_map(|s| s.test.iter().copied())
                .collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..23).collect::<Vec<_>>());
        }
        let sizes: Vec<usize> = splits[..5].iter().map(|s| s.test.len()).collect();
        assert_eq!(sizes, vec![5, 5, 5, 4, 4]);
        assert_eq!(splits[7].fold_id, 7);
    }

    #[test]
    fn test_kfold_is_deterministic_and_repeats_differ() {
        let data = dataset(30, 1);
        let a = RepeatedKFold::new(3, 2, 9).split(&data).unwrap();
        let b = RepeatedKFold::new(3, 2, 9).split(&data).unwrap();
        assert_eq!(a, b);
        assert_ne!(a[0].test, a[3].test);
    }

    #[test]
    fn test_kfold_rejects_too_few_samples() {
        let data = dataset(3, 1);
        assert!(RepeatedKFold::new(5, 1, 0).split(&data).is_err());
        assert!(RepeatedKFold::new(1, 1, 0).split(&data).is_err());
    }

    #[test]
    fn test_shuffle_split_sizes() {
        let data = dataset(10, 1);
        let splits = ShuffleSplit::new(4, 0.25, 1).split(&data).unwrap();
        assert_eq!(splits.len(), 4);
        for s in &splits {
            assert_eq!(s.test.len(), 3);
            assert_eq!(s.train.len(), 7);
            s.validate(10).unwrap();
        }
    }

    #[test]
    fn test_leave_group_out_holds_out_whole_groups() {
        let data = dataset(30, 3);
        let splits = BootstrappedLeaveGroupOut::new(2, 5).split(&data).unwrap();
        assert_eq!(splits.len(), 6);

        for s in &splits {
            s.validate(30).unwrap();
            let held: BTreeSet<&String> = s.test.iter().map(|&i| &data.g()[i]).collect();
            assert_eq!(held.len(), 1);
            assert!(s.train.iter().all(|&i| !held.contains(&data.g()[i])));
        }
    }

    #[test]
    fn test_leave_group_out_needs_two_groups() {
        let data = dataset(10, 1);
        let err = BootstrappedLeaveGroupOut::new(1, 0).split(&data).unwrap_err();
        assert!(matches!(err, DomainError::DegenerateSplit(_)));
    }

    proptest! {
        #[test]
        fn prop_kfold_splits_are_disjoint_partitions(
            n in 4usize..60,
            k in 2usize..5,
            seed in any::<u64>(),
        ) {
            prop_assume!(n >= k);
            let data = dataset(n, 1);
            for s in RepeatedKFold::new(k, 2, seed).split(&data).unwrap() {
                prop_assert!(s.validate(n).is_ok());
                prop_assert_eq!(s.train.len() + s.test.len(), n);
            }
        }

        #[test]
        fn prop_shuffle_splits_are_disjoint(
            n in 2usize..60,
            fraction in 0.05f64..0.95,
            seed in any::<u64>(),
        ) {
            let data = dataset(n, 1);
            for s in ShuffleSplit::new(3, fraction, seed).split(&data).unwrap() {
                prop_assert!(s.validate(n).is_ok());
                prop_assert_eq!(s.train.len() + s.test.len(), n);
            }
        }
    }
}
