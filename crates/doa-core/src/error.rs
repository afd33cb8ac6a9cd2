use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Data shape error: {0}")]
    DataShape(String),

    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("Degenerate split: {0}")]
    DegenerateSplit(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Model not fitted: {0}")]
    NotFitted(String),

    #[error("Numeric error: {0}")]
    Numeric(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Fold {fold_id} failed: {source}")]
    Fold {
        fold_id: usize,
        #[source]
        source: Box<DomainError>,
    },

    #[error("Sub-split {split} of splitter '{splitter}' failed: {source}")]
    SubSplit {
        splitter: String,
        split: usize,
        #[source]
        source: Box<DomainError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DomainError {
    /// Attach the outer fold that produced this error.
    pub fn in_fold(self, fold_id: usize) -> Self {
        DomainError::Fold {
            fold_id,
            source: Box::new(self),
        }
    }

    /// Attach the named sub-splitter and split ordinal that produced this error.
    pub fn in_sub_split(self, splitter: &str, split: usize) -> Self {
        DomainError::SubSplit {
            splitter: splitter.to_string(),
            split,
            source: Box::new(self),
        }
    }
}

/// Fail unless a collaborator returned one value per input row.
pub fn ensure_len(collaborator: &str, output: &str, got: usize, expected: usize) -> DomainResult<()> {
    if got != expected {
        return Err(DomainError::DataShape(format!(
            "{} returned {} {} values for {} rows",
            collaborator, got, output, expected
        )));
    }
    Ok(())
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_names_fold_and_split() {
        let err = DomainError::UnsupportedCapability("no spread".to_string())
            .in_sub_split("calibration", 3)
            .in_fold(2);

        let msg = err.to_string();
        assert!(msg.contains("Fold 2"));
        assert!(msg.contains("calibration"));
        assert!(msg.contains("Sub-split 3"));
        assert!(msg.contains("no spread"));
    }

    #[test]
    fn test_length_mismatch_names_collaborator() {
        assert!(ensure_len("ridge", "prediction", 4, 4).is_ok());

        let err = ensure_len("ridge", "prediction", 3, 4).unwrap_err();
        assert!(matches!(err, DomainError::DataShape(_)));
        assert!(err.to_string().contains("ridge returned 3 prediction values for 4 rows"));
    }
}
