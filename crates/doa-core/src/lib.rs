//! Shared data model, capability traits and error taxonomy for
//! domain-of-applicability assessment.

pub mod error;
pub mod nan_as_null;
pub mod traits;
pub mod types;

pub use error::*;
pub use traits::*;
pub use types::*;
