use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("invalid data: {0}")]
    InvalidData(String),
}
