/// Errors produced by the core model types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unknown process template: {0}")]
    UnknownTemplate(String),

    #[error("stage index {index} out of range for process {process_id}")]
    StageOutOfRange { process_id: String, index: usize },

    #[error("unsafe path rejected: {0}")]
    UnsafePath(String),

    #[error("malformed runtime message: {0}")]
    MalformedMessage(String),
}
