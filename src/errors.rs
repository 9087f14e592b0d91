use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RtpError {
    #[error("packet too short")]
    PacketTooShort,
    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
    #[error("length field {declared} exceeds {available} available bytes")]
    Length { declared: usize, available: usize },
}

pub type RtpResult<T> = Result<T, RtpError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SrtpError {
    #[error("packet too short")]
    PacketTooShort,
    #[error("unsupported SRTP profile")]
    UnsupportedProfile,
    #[error("authentication tag mismatch")]
    AuthenticationFailed,
    #[error("no crypto context for ssrc {0:#010x}")]
    MissingContext(u32),
    #[error(transparent)]
    Rtp(#[from] RtpError),
}

pub type SrtpResult<T> = Result<T, SrtpError>;

#[derive(Debug, Error)]
pub enum SfuError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unknown peer {0}")]
    UnknownPeer(u64),
    #[error("unknown producer {0}")]
    UnknownProducer(u64),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Srtp(#[from] SrtpError),
    #[error(transparent)]
    Rtp(#[from] RtpError),
}

pub type SfuResult<T> = Result<T, SfuError>;
