//! Reference Collaborators
//!
//! Concrete estimators, dissimilarity models, calibration models and
//! splitters that plug into the assessment engine, plus a restorer that
//! rebuilds them from persisted artifacts.

pub mod calibration;
pub mod distance;
pub mod ensemble;
pub mod restore;
pub mod scaler;
pub mod splitters;

pub use calibration::{CalibrationMethod, CalibrationStats, UncertaintyCalibrator};
pub use distance::{KdeDistance, KnnDistance};
pub use ensemble::{BaggedRidge, BaggedRidgeConfig};
pub use restore::ReferenceRestorer;
pub use scaler::StandardScaler;
pub use splitters::{BootstrappedLeaveGroupOut, RepeatedKFold, ShuffleSplit};
