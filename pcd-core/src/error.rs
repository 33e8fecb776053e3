use thiserror::Error;

/// The master error type for the conversion pipeline.
///
/// `Reader` failures abandon the current source but leave the run alive as
/// long as other sources remain. `Persistence` and `Configuration` are fatal.
/// `Sampling` marks numeric degeneracy in a single point; the point is
/// rejected and counted, never the run.
#[derive(Debug, Error)]
pub enum TilerError {
    #[error("reader error in \"{source_name}\": {message}")]
    Reader { source_name: String, message: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("sampling degeneracy: {0}")]
    Sampling(String),
}

impl TilerError {
    pub fn reader<S: Into<String>, M: Into<String>>(source_name: S, message: M) -> Self {
        TilerError::Reader {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Fatal errors abort the run; the rest are recoverable at the driver.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TilerError::Persistence(_) | TilerError::Configuration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TilerError>;
