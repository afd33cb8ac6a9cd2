use anyhow::{bail, Context, Result};
use doa_engine::{AssessmentConfig, TestAugmentation};
use doa_models::CalibrationMethod;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Dissimilarity model fit on the estimator's transformed features.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DistanceKind {
    Kde,
    Knn(usize),
}

impl FromStr for DistanceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kde" => Ok(DistanceKind::Kde),
            other => match other.strip_prefix("knn") {
                Some("") => Ok(DistanceKind::Knn(5)),
                Some(k) => Ok(DistanceKind::Knn(
                    k.trim_start_matches(':')
                        .parse()
                        .with_context(|| format!("bad neighbour count in '{}'", s))?,
                )),
                None => bail!("unknown distance model '{}' (expected kde, knn or knn:K)", s),
            },
        }
    }
}

fn parse_calibration(s: &str) -> Result<CalibrationMethod> {
    match s.trim().to_lowercase().as_str() {
        "polynomial" | "llh" => Ok(CalibrationMethod::default()),
        "scale" => Ok(CalibrationMethod::Scale),
        "identity" | "none" => Ok(CalibrationMethod::Identity),
        other => bail!(
            "unknown calibration '{}' (expected polynomial, scale or identity)",
            other
        ),
    }
}

fn parse_targets(s: &str) -> Result<Vec<f64>> {
    s.split(',')
        .filter(|t| !t.trim().is_empty())
        .map(|t| {
            t.trim()
                .parse()
                .with_context(|| format!("bad precision target '{}'", t))
        })
        .collect()
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

/// Settings of one runner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    // Input
    pub data: Option<PathBuf>,
    pub target: String,
    pub group: Option<String>,

    // Output
    pub save: PathBuf,

    // Resampling
    pub folds: usize,
    pub repeats: usize,
    pub inner_folds: usize,
    pub seed: u64,

    // Collaborators
    pub estimators: usize,
    pub alpha: f64,
    pub distance: DistanceKind,
    pub calibration: CalibrationMethod,

    pub assessment: AssessmentConfig,

    /// Run directories to pool instead of running an assessment.
    pub aggregate: Vec<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data: None,
            target: "y".to_string(),
            group: None,
            save: PathBuf::from("doa_run"),
            folds: 5,
            repeats: 1,
            inner_folds: 5,
            seed: 0,
            estimators: 20,
            alpha: 1e-3,
            distance: DistanceKind::Kde,
            calibration: CalibrationMethod::default(),
            assessment: AssessmentConfig::default(),
            aggregate: Vec::new(),
        }
    }
}

impl RunConfig {
    /// Read `DOA_*` variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let mut assessment = defaults.assessment.clone();

        assessment.bins = env::var("DOA_BINS")
            .unwrap_or_else(|_| assessment.bins.to_string())
            .parse()
            .context("DOA_BINS must be an integer")?;
        assessment.bin_area_cutoff = env::var("DOA_BIN_AREA_CUTOFF")
            .unwrap_or_else(|_| assessment.bin_area_cutoff.to_string())
            .parse()
            .context("DOA_BIN_AREA_CUTOFF must be a number")?;
        if let Ok(targets) = env::var("DOA_PRECISION_TARGETS") {
            assessment.precision_targets = parse_targets(&targets)?;
        }
        if let Ok(role) = env::var("DOA_CALIBRATION_ROLE") {
            assessment.calibration_role = role;
        }
        if let Ok(threads) = env::var("DOA_THREADS") {
            assessment.threads = Some(threads.parse().context("DOA_THREADS must be an integer")?);
        }

        let seed: u64 = env::var("DOA_SEED")
            .unwrap_or_else(|_| defaults.seed.to_string())
            .parse()
            .context("DOA_SEED must be an integer")?;
        if let Ok(fraction) = env::var("DOA_AUGMENT") {
            assessment.test_augmentation = Some(TestAugmentation {
                fraction: fraction.parse().context("DOA_AUGMENT must be a fraction")?,
                seed: env::var("DOA_AUGMENT_SEED")
                    .unwrap_or_else(|_| seed.to_string())
                    .parse()
                    .context("DOA_AUGMENT_SEED must be an integer")?,
            });
        }

        Ok(Self {
            data: env::var("DOA_DATA").ok().map(PathBuf::from),
            target: env::var("DOA_TARGET").unwrap_or(defaults.target),
            group: env::var("DOA_GROUP").ok(),
            save: env::var("DOA_SAVE").map(PathBuf::from).unwrap_or(defaults.save),
            folds: env::var("DOA_FOLDS")
                .unwrap_or_else(|_| defaults.folds.to_string())
                .parse()
                .context("DOA_FOLDS must be an integer")?,
            repeats: env::var("DOA_REPEATS")
                .unwrap_or_else(|_| defaults.repeats.to_string())
                .parse()
                .context("DOA_REPEATS must be an integer")?,
            inner_folds: env::var("DOA_INNER_FOLDS")
                .unwrap_or_else(|_| defaults.inner_folds.to_string())
                .parse()
                .context("DOA_INNER_FOLDS must be an integer")?,
            seed,
            estimators: env::var("DOA_ESTIMATORS")
                .unwrap_or_else(|_| defaults.estimators.to_string())
                .parse()
                .context("DOA_ESTIMATORS must be an integer")?,
            alpha: env::var("DOA_ALPHA")
                .unwrap_or_else(|_| defaults.alpha.to_string())
                .parse()
                .context("DOA_ALPHA must be a number")?,
            distance: match env::var("DOA_DISTANCE") {
                Ok(kind) => kind.parse()?,
                Err(_) => defaults.distance,
            },
            calibration: match env::var("DOA_CALIBRATION") {
                Ok(method) => parse_calibration(&method)?,
                Err(_) => defaults.calibration,
            },
            assessment,
            aggregate: Vec::new(),
        })
    }

    /// Apply command-line flags over the current values.
    pub fn with_args(mut self, args: &[String]) -> Result<Self> {
        let flag = |name: &str| flag_value(args, name);
        fn parsed<T: FromStr>(value: Option<&str>, name: &str) -> Result<Option<T>> {
            match value {
                Some(v) => match v.parse() {
                    Ok(parsed) => Ok(Some(parsed)),
                    Err(_) => bail!("invalid value '{}' for {}", v, name),
                },
                None => Ok(None),
            }
        }

        if let Some(v) = flag("--data") {
            self.data = Some(PathBuf::from(v));
        }
        if let Some(v) = flag("--target") {
            self.target = v.to_string();
        }
        if let Some(v) = flag("--group") {
            self.group = Some(v.to_string());
        }
        if let Some(v) = flag("--save") {
            self.save = PathBuf::from(v);
        }
        if let Some(v) = parsed(flag("--folds"), "--folds")? {
            self.folds = v;
        }
        if let Some(v) = parsed(flag("--repeats"), "--repeats")? {
            self.repeats = v;
        }
        if let Some(v) = parsed(flag("--inner-folds"), "--inner-folds")? {
            self.inner_folds = v;
        }
        if let Some(v) = parsed(flag("--seed"), "--seed")? {
            // An augmentation seed that only followed the old splitter seed follows the new one.
            if let Some(aug) = self.assessment.test_augmentation.as_mut() {
                if aug.seed == self.seed {
                    aug.seed = v;
                }
            }
            self.seed = v;
        }
        if let Some(v) = parsed(flag("--estimators"), "--estimators")? {
            self.estimators = v;
        }
        if let Some(v) = flag("--distance") {
            self.distance = v.parse()?;
        }
        if let Some(v) = flag("--calibration") {
            self.calibration = parse_calibration(v)?;
        }
        if let Some(v) = parsed(flag("--bins"), "--bins")? {
            self.assessment.bins = v;
        }
        if let Some(v) = flag("--precision") {
            self.assessment.precision_targets = parse_targets(v)?;
        }
        if let Some(v) = parsed(flag("--threads"), "--threads")? {
            self.assessment.threads = Some(v);
        }
        if let Some(fraction) = parsed(flag("--augment"), "--augment")? {
            let seed = self
                .assessment
                .test_augmentation
                .map_or(self.seed, |aug| aug.seed);
            self.assessment.test_augmentation = Some(TestAugmentation { fraction, seed });
        }
        if let Some(seed) = parsed(flag("--augment-seed"), "--augment-seed")? {
            match self.assessment.test_augmentation.as_mut() {
                Some(aug) => aug.seed = seed,
                None => bail!("--augment-seed needs --augment"),
            }
        }
        if let Some(idx) = args.iter().position(|a| a == "--aggregate") {
            self.aggregate = args[idx + 1..]
                .iter()
                .take_while(|a| !a.starts_with("--"))
                .map(PathBuf::from)
                .collect();
            if self.aggregate.is_empty() {
                bail!("--aggregate needs at least one run directory");
            }
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.folds < 2 {
            bail!("folds must be at least 2, got {}", self.folds);
        }
        if self.inner_folds < 2 {
            bail!("inner folds must be at least 2, got {}", self.inner_folds);
        }
        if self.repeats < 1 {
            bail!("repeats must be at least 1");
        }
        if self.estimators < 2 {
            bail!("at least 2 ensemble members are needed for a spread");
        }
        self.assessment
            .validate()
            .context("invalid assessment configuration")?;
        Ok(())
    }
}
