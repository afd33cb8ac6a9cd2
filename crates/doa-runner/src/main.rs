//! doa-runner: domain-of-applicability assessment of a regression dataset.
//!
//! Runs nested cross-validation with a bagged ridge ensemble, fits the final
//! model on all data and writes the run directory. A second mode pools the
//! assessment tables of earlier runs.
//!
//! Usage:
//!   cargo run -p doa-runner -- --data set.csv --target y --save runs/a
//!   cargo run -p doa-runner -- --data set.csv --group site --augment 0.1
//!   cargo run -p doa-runner -- --aggregate runs/a runs/b --save runs/pooled

use anyhow::{Context, Result};
use doa_core::{Dataset, DistanceModel, NamedSplitter};
use doa_engine::persist::{read_table, write_json};
use doa_engine::{aggregate_runs, save_run, ModelBuilder, NestedCv, RunArtifacts};
use doa_models::{
    BaggedRidge, BaggedRidgeConfig, BootstrappedLeaveGroupOut, KdeDistance, KnnDistance,
    RepeatedKFold, UncertaintyCalibrator,
};

mod config;

use config::{DistanceKind, RunConfig};

const AGGREGATE_FILE: &str = "aggregate.json";

fn init_tracing() {
    let json_logging = std::env::var("DOA_LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "doa_runner=info,doa_engine=info".into())
    };
    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  doa-runner --data PATH [options]        Assess a CSV dataset");
    eprintln!("  doa-runner --aggregate DIR... [--save DIR]  Pool earlier runs");
    eprintln!();
    eprintln!("Options (environment variable in brackets):");
    eprintln!("  --target NAME        Target column (DOA_TARGET, default: y)");
    eprintln!("  --group NAME         Group column for leave-group-out (DOA_GROUP)");
    eprintln!("  --save DIR           Output directory (DOA_SAVE, default: doa_run)");
    eprintln!("  --folds N            Outer folds (DOA_FOLDS, default: 5)");
    eprintln!("  --inner-folds N      Inner folds (DOA_INNER_FOLDS, default: 5)");
    eprintln!("  --repeats N          Inner repeats (DOA_REPEATS, default: 1)");
    eprintln!("  --seed N             Seed for every splitter (DOA_SEED, default: 0)");
    eprintln!("  --estimators N       Ensemble members (DOA_ESTIMATORS, default: 20)");
    eprintln!("  --distance KIND      kde | knn | knn:K (DOA_DISTANCE, default: kde)");
    eprintln!("  --calibration KIND   polynomial | scale | identity (DOA_CALIBRATION)");
    eprintln!("  --bins N             Quantile bins (DOA_BINS, default: 10)");
    eprintln!("  --precision LIST     Precision targets, comma separated (DOA_PRECISION_TARGETS)");
    eprintln!("  --augment FRACTION   Move a share of each outer training fold to test (DOA_AUGMENT)");
    eprintln!("  --augment-seed N     Seed of the augmentation draws (DOA_AUGMENT_SEED, default: --seed)");
    eprintln!("  --threads N          Worker threads for outer folds (DOA_THREADS)");
}

fn build_assessment(config: &RunConfig) -> NestedCv {
    let mut splitters = vec![NamedSplitter::new(
        config.assessment.calibration_role.clone(),
        RepeatedKFold::new(config.inner_folds, config.repeats, config.seed),
    )];
    if config.group.is_some() {
        splitters.push(NamedSplitter::new(
            "groups",
            BootstrappedLeaveGroupOut::new(config.repeats, config.seed),
        ));
    }

    let distance = config.distance;
    let builder = ModelBuilder::new(
        BaggedRidge::factory(BaggedRidgeConfig {
            n_estimators: config.estimators,
            alpha: config.alpha,
            seed: config.seed,
        }),
        move || -> Box<dyn DistanceModel> {
            match distance {
                DistanceKind::Kde => Box::new(KdeDistance::new()),
                DistanceKind::Knn(k) => Box::new(KnnDistance::new(k)),
            }
        },
        UncertaintyCalibrator::factory(config.calibration.clone()),
        splitters,
        config.assessment.clone(),
    );

    NestedCv::new(
        builder,
        NamedSplitter::new("outer", RepeatedKFold::new(config.folds, 1, config.seed)),
    )
}

fn run_assessment(config: &RunConfig, data: &Dataset) -> Result<()> {
    let cv = build_assessment(config);

    let output = cv.run(data, false).context("nested cross-validation failed")?;
    let (model, train_records) = cv.fit_final(data).context("final model fit failed")?;

    let sub_splitters: Vec<String> = cv.builder().splitters().iter().map(|s| s.name.clone()).collect();
    let manifest = save_run(
        &config.save,
        &RunArtifacts {
            data,
            model: &model,
            train_records: &train_records,
            assessment: &output.records,
            config: &config.assessment,
            outer_splitter: "outer",
            sub_splitters,
        },
    )
    .with_context(|| format!("cannot write run to {}", config.save.display()))?;

    for entry in model.thresholds().entries() {
        tracing::info!(
            "  {}: threshold={:.4} precision={:.3} recall={:.3}",
            entry.key,
            entry.threshold,
            entry.precision,
            entry.recall
        );
    }
    tracing::info!(
        "Done! {} folds, {} assessment rows written to {}",
        manifest.folds,
        output.records.len(),
        config.save.display()
    );
    Ok(())
}

fn run_aggregate(config: &RunConfig) -> Result<()> {
    let aggregated = aggregate_runs(&config.aggregate, &config.assessment)
        .context("cannot aggregate runs")?;

    std::fs::create_dir_all(&config.save)
        .with_context(|| format!("cannot create {}", config.save.display()))?;
    let path = config.save.join(AGGREGATE_FILE);
    write_json(&path, &aggregated).with_context(|| format!("cannot write {}", path.display()))?;

    for role in &aggregated.summary.roles {
        tracing::info!(
            "  {}: RMSE/sigma = {:.3} +/- {:.3} over {} folds",
            role.split_role,
            role.rmse_over_sigma.mean,
            role.rmse_over_sigma.sem,
            role.per_fold.len()
        );
    }
    tracing::info!(
        "Done! Pooled {} runs ({} records) into {}",
        aggregated.runs.len(),
        aggregated.summary.records,
        path.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let config = RunConfig::from_env()?.with_args(&args)?;

    if !config.aggregate.is_empty() {
        tracing::info!("doa-runner: aggregating {} runs", config.aggregate.len());
        return run_aggregate(&config);
    }

    let Some(data_path) = config.data.as_ref() else {
        print_usage();
        std::process::exit(1);
    };

    let data = read_table(data_path, &config.target, config.group.as_deref())
        .with_context(|| format!("cannot load dataset from {}", data_path.display()))?;
    tracing::info!(
        "doa-runner: {} samples, {} features, {} outer folds, {} inner folds x {} repeats, save={}",
        data.len(),
        data.n_features(),
        config.folds,
        config.inner_folds,
        config.repeats,
        config.save.display()
    );

    run_assessment(&config, &data)
}
