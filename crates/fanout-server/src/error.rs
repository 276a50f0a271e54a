use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Webrtc(#[from] webrtc::Error),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("signaling channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, RelayError>;
