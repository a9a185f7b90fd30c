use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty datagram")]
    Empty,
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),
    #[error("invalid player number: {0}")]
    InvalidPlayer(u8),
    #[error("blob too large: {0} bytes")]
    BlobTooLarge(u32),
    #[error("video settings are not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
