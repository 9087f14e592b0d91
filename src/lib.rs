//! Media core of a WebRTC selective forwarding unit.
//!
//! One UDP socket carries every peer's traffic. The [`Dispatcher`] splits it
//! per remote address and routes STUN to the ICE-lite agent, DTLS to the
//! association that derives SRTP keys, and SRTP/SRTCP through the [`Sfu`],
//! which re-times and re-encrypts media for each subscriber.

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod rtp;
pub mod server;
pub mod sfu;
pub mod srtp;
pub mod time;
pub mod transports;

pub use config::{SfuConfig, SfuConfigBuilder};
pub use dispatcher::{Dispatcher, SecureTransport};
pub use errors::{RtpError, SfuError, SfuResult, SrtpError};
pub use rtp::{RtcpPacket, RtpHeader, RtpPacket};
pub use server::SfuServer;
pub use sfu::consumer::{ClockState, Consumer, ConsumerId, TimeAnchor};
pub use sfu::producer::{MediaKind, MediaLineInfo, Producer, ProducerId};
pub use sfu::{MediaTransport, Peer, PeerId, Sfu, SfuEvent};
pub use srtp::{SrtpProfile, SrtpSession};
pub use transports::ice::IceCredentialPair;
