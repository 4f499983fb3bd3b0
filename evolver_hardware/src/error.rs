use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("sensor read timeout")]
    Timeout,
    #[error("channel {channel} out of range (device has {channels} channels)")]
    ChannelOutOfRange { channel: usize, channels: usize },
    #[error("device fault: {0}")]
    Fault(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
