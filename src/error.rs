use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Coordination error: {0}")]
    Coordination(#[from] coord::Error),

    #[error("Hash ring has no members to map {resource:?} to")]
    EmptyRing { resource: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Only coordination failures can be fatal; everything else is retried on
    /// the next check.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Coordination(e) if e.is_fatal())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
