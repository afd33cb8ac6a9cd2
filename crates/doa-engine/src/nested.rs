//! Outer nested cross-validation.
//!
//! Each outer fold moves through `Created -> Fitted -> Predicted -> Recorded`.
//! Folds share only the read-only dataset and run on a rayon pool; results are
//! ordered by `fold_id`, never by completion order.

use doa_core::{AssessmentRecord, Dataset, DomainError, DomainResult, NamedSplitter, Split};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::builder::{FittedModel, ModelBuilder};
use crate::config::TestAugmentation;

/// Fold holding only its index partition.
#[derive(Debug)]
pub struct Created;

/// Fold whose model has been fit on its training partition.
#[derive(Debug)]
pub struct Fitted {
    model: FittedModel,
    cv: Vec<AssessmentRecord>,
}

/// Fold whose model has been applied to its test partition.
#[derive(Debug)]
pub struct Predicted {
    model: FittedModel,
    cv: Vec<AssessmentRecord>,
    test: Vec<AssessmentRecord>,
}

/// One outer fold in state `S`.
#[derive(Debug)]
pub struct Fold<S> {
    fold_id: usize,
    train: Vec<usize>,
    test: Vec<usize>,
    state: S,
}

impl<S> Fold<S> {
    pub fn fold_id(&self) -> usize {
        self.fold_id
    }

    pub fn train(&self) -> &[usize] {
        &self.train
    }

    pub fn test(&self) -> &[usize] {
        &self.test
    }
}

impl Fold<Created> {
    pub fn new(split: Split) -> Self {
        Self {
            fold_id: split.fold_id,
            train: split.train,
            test: split.test,
            state: Created,
        }
    }

    /// Move a seeded random share of the training partition into the test partition.
    ///
    /// The draw is seeded with [`TestAugmentation::fold_seed`], independent of
    /// the outer splitter. At least one training sample is always kept.
    pub fn augment(mut self, augmentation: &TestAugmentation) -> Self {
        let n_move = ((self.train.len() as f64 * augmentation.fraction).round() as usize)
            .min(self.train.len().saturating_sub(1));
        if n_move == 0 {
            return self;
        }

        let mut rng = StdRng::seed_from_u64(augmentation.fold_seed(self.fold_id));
        let mut moved: Vec<usize> = self.train.choose_multiple(&mut rng, n_move).copied().collect();
        moved.sort_unstable();

        self.train.retain(|i| moved.binary_search(i).is_err());
        self.test.extend(moved);
        self
    }

    /// Fit the fold's model on its training partition.
    ///
    /// Cv records are re-indexed from the training subset to the full dataset.
    pub fn fit(self, data: &Dataset, builder: &ModelBuilder) -> DomainResult<Fold<Fitted>> {
        let subset = data.subset(&self.train)?;
        let (model, mut cv) = builder.fit(&subset)?;
        for record in cv.iter_mut() {
            record.index = self.train[record.index];
            record.fold_id = self.fold_id;
        }

        tracing::info!(
            "Fold {} fitted on {} samples ({} cv records)",
            self.fold_id,
            self.train.len(),
            cv.len()
        );
        Ok(Fold {
            fold_id: self.fold_id,
            train: self.train,
            test: self.test,
            state: Fitted { model, cv },
        })
    }
}

impl Fold<Fitted> {
    pub fn model(&self) -> &FittedModel {
        &self.state.model
    }

    /// Apply the frozen model to the fold's test partition.
    pub fn predict(self, data: &Dataset, splitter: &str) -> DomainResult<Fold<Predicted>> {
        let test = self
            .state
            .model
            .assess(data, &self.test, self.fold_id, splitter)?;

        tracing::info!("Fold {} predicted {} test samples", self.fold_id, test.len());
        Ok(Fold {
            fold_id: self.fold_id,
            train: self.train,
            test: self.test,
            state: Predicted {
                model: self.state.model,
                cv: self.state.cv,
                test,
            },
        })
    }
}

impl Fold<Predicted> {
    /// Concatenate cv-role then test-role records.
    pub fn record(self) -> RecordedFold {
        let mut records = self.state.cv;
        records.extend(self.state.test);
        tracing::info!("Fold {} recorded {} rows", self.fold_id, records.len());
        RecordedFold {
            fold_id: self.fold_id,
            records,
            model: self.state.model,
        }
    }
}

/// Terminal state of an outer fold.
#[derive(Debug)]
pub struct RecordedFold {
    pub fold_id: usize,
    pub records: Vec<AssessmentRecord>,
    pub model: FittedModel,
}

/// Records of every outer fold and, optionally, their models.
#[derive(Debug, Default)]
pub struct NestedCvOutput {
    pub records: Vec<AssessmentRecord>,
    pub models: Vec<(usize, FittedModel)>,
}

/// Outer splitter plus the builder run inside every fold.
pub struct NestedCv {
    builder: ModelBuilder,
    outer: NamedSplitter,
}

impl NestedCv {
    pub fn new(builder: ModelBuilder, outer: NamedSplitter) -> Self {
        Self { builder, outer }
    }

    pub fn builder(&self) -> &ModelBuilder {
        &self.builder
    }

    /// Generate outer folds, applying test augmentation when configured.
    pub fn folds(&self, data: &Dataset) -> DomainResult<Vec<Fold<Created>>> {
        let splits = self.outer.splitter.split(data)?;
        if splits.is_empty() {
            return Err(DomainError::DegenerateSplit(format!(
                "outer splitter '{}' produced no folds",
                self.outer.name
            )));
        }

        splits
            .into_iter()
            .map(|split| -> DomainResult<Fold<Created>> {
                split
                    .validate(data.len())
                    .map_err(|e| e.in_fold(split.fold_id))?;
                let fold = Fold::new(split);
                Ok(match &self.builder.config().test_augmentation {
                    Some(aug) => fold.augment(aug),
                    None => fold,
                })
            })
            .collect()
    }

    fn run_fold(&self, fold: Fold<Created>, data: &Dataset) -> DomainResult<RecordedFold> {
        let fold_id = fold.fold_id;
        let recorded = fold
            .fit(data, &self.builder)
            .and_then(|f| f.predict(data, &self.outer.name))
            .map(|f| f.record())
            .map_err(|e| e.in_fold(fold_id))?;
        Ok(recorded)
    }

    /// Run every outer fold and collect their records ordered by `fold_id`.
    ///
    /// A failing fold aborts the run; no fold is silently dropped.
    pub fn run(&self, data: &Dataset, keep_models: bool) -> DomainResult<NestedCvOutput> {
        let folds = self.folds(data)?;
        tracing::info!(
            "Running {} outer folds of '{}' over {} samples",
            folds.len(),
            self.outer.name,
            data.len()
        );

        let work = || -> DomainResult<Vec<RecordedFold>> {
            folds
                .into_par_iter()
                .map(|fold| self.run_fold(fold, data))
                .collect()
        };
        let mut recorded = match self.builder.config().threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| DomainError::InvalidConfig(format!("cannot build worker pool: {}", e)))?
                .install(work)?,
            None => work()?,
        };
        recorded.sort_by_key(|f| f.fold_id);

        let mut output = NestedCvOutput::default();
        for fold in recorded {
            output.records.extend(fold.records);
            if keep_models {
                output.models.push((fold.fold_id, fold.model));
            }
        }
        Ok(output)
    }

    /// Fit the deployable model on the whole dataset.
    ///
    /// Its cv records describe training-set fit quality, tagged `fold_id = 0`.
    pub fn fit_final(&self, data: &Dataset) -> DomainResult<(FittedModel, Vec<AssessmentRecord>)> {
        let (model, records) = self.builder.fit(data)?;
        tracing::info!(
            "Final model fitted on {} samples ({} cv records)",
            data.len(),
            records.len()
        );
        Ok((model, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(train: Vec<usize>, test: Vec<usize>, fold_id: usize) -> Fold<Created> {
        Fold::new(Split::new(train, test, fold_id))
    }

    #[test]
    fn test_augmentation_moves_seeded_share() {
        let aug = TestAugmentation {
            fraction: 0.25,
            seed: 10,
        };
        let a = fold((0..20).collect(), vec![20, 21], 3).augment(&aug);
        let b = fold((0..20).collect(), vec![20, 21], 3).augment(&aug);

        assert_eq!(a.train().len(), 15);
        assert_eq!(a.test().len(), 7);
        assert_eq!(a.train(), b.train());
        assert_eq!(a.test(), b.test());
        assert!(a.test().iter().all(|i| !a.train().contains(i)));
        assert_eq!(&a.test()[..2], &[20, 21]);
    }

    #[test]
    fn test_augmentation_seed_depends_on_fold() {
        let aug = TestAugmentation {
            fraction: 0.5,
            seed: 1,
        };
        let a = fold((0..40).collect(), vec![40], 0).augment(&aug);
        let b = fold((0..40).collect(), vec![40], 1).augment(&aug);
        assert_ne!(a.test(), b.test());
    }

    #[test]
    fn test_augmentation_stream_differs_from_splitter_stream() {
        for seed in 0..50u64 {
            let aug = TestAugmentation { fraction: 0.2, seed };
            for fold_id in 0..10 {
                // Splitters seed repeat r with `seed + r`.
                for repeat in 0..10u64 {
                    assert_ne!(aug.fold_seed(fold_id), seed.wrapping_add(repeat));
                }
            }
        }

        let aug = TestAugmentation { fraction: 0.2, seed: 7 };
        let mut outer: Vec<usize> = (0..40).collect();
        outer.shuffle(&mut StdRng::seed_from_u64(7));
        let mut drawn: Vec<usize> = (0..40).collect();
        drawn.shuffle(&mut StdRng::seed_from_u64(aug.fold_seed(0)));
        assert_ne!(outer, drawn);
    }

    #[test]
    fn test_augmentation_keeps_one_training_sample() {
        let aug = TestAugmentation {
            fraction: 0.99,
            seed: 0,
        };
        let f = fold(vec![0, 1], vec![2], 0).augment(&aug);
        assert_eq!(f.train().len(), 1);
        assert_eq!(f.test().len(), 2);
    }
}
