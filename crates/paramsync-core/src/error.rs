use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ParamsyncError {
    /// Rejected at construction/init time: bad descriptors, zero capacities,
    /// mismatched vector lengths.
    #[error("configuration error: {0}")]
    Config(String),

    /// A state the communicator must never reach: empty merge input,
    /// reassembly size mismatch, use of an unstarted communicator.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A wait-handle reported failure. The affected pass is abandoned and
    /// retried from scratch on the next dispatcher iteration.
    #[error("rpc failure: {0}")]
    Rpc(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Serialize for ParamsyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
