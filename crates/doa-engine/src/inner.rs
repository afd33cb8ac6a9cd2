//! Inner resampling loop.
//!
//! Every sub-split gets freshly built collaborators fit only on its own
//! sub-train partition, so each cv record is an out-of-sample prediction.

use doa_core::{
    ensure_len, ground_truth_in_domain, AssessmentRecord, Dataset, DistanceFactory, DomainResult,
    EstimatorFactory, NamedSplitter, Split, SplitRole,
};
use rayon::prelude::*;

use crate::stats::population_std;

/// Predictions for one sub-split's test portion, indexed locally to `data`.
fn run_sub_split(
    data: &Dataset,
    split: &Split,
    splitter: &str,
    estimator_factory: &dyn EstimatorFactory,
    distance_factory: &dyn DistanceFactory,
) -> DomainResult<Vec<AssessmentRecord>> {
    split.validate(data.len())?;

    let x_train = data.rows(&split.train);
    let y_train = data.targets(&split.train);
    let x_test = data.rows(&split.test);
    let y_test = data.targets(&split.test);

    let mut estimator = estimator_factory.build();
    estimator.fit(&x_train, &y_train)?;

    let mut distance = distance_factory.build();
    let t_train = estimator.transform(&x_train)?;
    ensure_len(estimator.name(), "transform", t_train.len(), x_train.len())?;
    distance.fit(&t_train, &y_train)?;

    let n = x_test.len();
    let y_pred = estimator.predict(&x_test)?;
    ensure_len(estimator.name(), "prediction", y_pred.len(), n)?;
    let y_std = estimator.ensemble_spread(&x_test)?;
    ensure_len(estimator.name(), "spread", y_std.len(), n)?;
    let t_test = estimator.transform(&x_test)?;
    ensure_len(estimator.name(), "transform", t_test.len(), n)?;
    let dissimilarity = distance.predict(&t_test)?;
    ensure_len(distance.name(), "dissimilarity", dissimilarity.len(), n)?;
    let sigma_y = population_std(&y_train);

    Ok(split
        .test
        .iter()
        .enumerate()
        .map(|(k, &index)| AssessmentRecord {
            index,
            y: y_test[k],
            y_pred: y_pred[k],
            y_std_raw: y_std[k],
            y_std_calibrated: y_std[k],
            dissimilarity: dissimilarity[k],
            sigma_y,
            fold_id: 0,
            split_role: SplitRole::Cv,
            splitter: splitter.to_string(),
            ground_truth_in_domain: ground_truth_in_domain(y_test[k], y_pred[k], sigma_y),
            domain_predictions: Vec::new(),
        })
        .collect())
}

/// Collect cv-role records over every sub-split of every named splitter.
///
/// Record indices are positions in `data`; `y_std_calibrated` holds the raw
/// spread until a calibration model is applied. Sub-splits with an empty test
/// partition are skipped; any other failing sub-split fails the whole loop,
/// tagged with its splitter name and position.
pub fn run_inner_loop(
    data: &Dataset,
    splitters: &[NamedSplitter],
    estimator_factory: &dyn EstimatorFactory,
    distance_factory: &dyn DistanceFactory,
) -> DomainResult<Vec<AssessmentRecord>> {
    let mut records = Vec::new();

    for named in splitters {
        let splits = named.splitter.split(data)?;
        tracing::debug!(
            "Splitter '{}' produced {} sub-splits over {} samples",
            named.name,
            splits.len(),
            data.len()
        );

        let usable: Vec<(usize, &Split)> = splits
            .iter()
            .enumerate()
            .filter(|(i, split)| {
                if split.test.is_empty() {
                    tracing::warn!(
                        "Skipping sub-split {} of splitter '{}': empty test partition",
                        i,
                        named.name
                    );
                    false
                } else {
                    true
                }
            })
            .collect();

        let per_split: Vec<Vec<AssessmentRecord>> = usable
            .par_iter()
            .map(|&(i, split)| {
                run_sub_split(data, split, &named.name, estimator_factory, distance_factory)
                    .map_err(|e| e.in_sub_split(&named.name, i))
            })
            .collect::<DomainResult<_>>()?;

        records.extend(per_split.into_iter().flatten());
    }

    Ok(records)
}
