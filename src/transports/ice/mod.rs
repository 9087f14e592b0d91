pub mod stun;

use anyhow::{Context, Result, bail};
use rand::Rng;
use std::net::SocketAddr;
use tracing::trace;

use self::stun::{StunAttribute, StunClass, StunMessage, StunMethod};

/// Characters allowed in ICE ufrag and password (RFC 8839 ice-char).
const ICE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
const UFRAG_LEN: usize = 16;
const PASSWORD_LEN: usize = 32;

/// Local ICE credentials of one logical node. Many remote endpoints may check
/// against the same pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCredentialPair {
    pub username_fragment: String,
    pub password: String,
}

impl IceCredentialPair {
    pub fn new(username_fragment: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username_fragment: username_fragment.into(),
            password: password.into(),
        }
    }

    pub fn generate() -> Self {
        Self {
            username_fragment: random_ice_string(UFRAG_LEN),
            password: random_ice_string(PASSWORD_LEN),
        }
    }
}

fn random_ice_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ICE_CHARS[rng.gen_range(0..ICE_CHARS.len())] as char)
        .collect()
}

/// Resolves the local credential pair that owns a ufrag.
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, username_fragment: &str) -> Option<IceCredentialPair>;
}

impl<F> CredentialStore for F
where
    F: Fn(&str) -> Option<IceCredentialPair> + Send + Sync,
{
    fn lookup(&self, username_fragment: &str) -> Option<IceCredentialPair> {
        self(username_fragment)
    }
}

/// An authenticated connectivity check and the response to send back.
#[derive(Debug, Clone)]
pub struct BindingAnswer {
    pub response: Vec<u8>,
    pub credentials: IceCredentialPair,
    pub remote_username_fragment: String,
    pub use_candidate: bool,
}

/// ICE-lite responder: answers binding requests, never sends checks itself.
#[derive(Debug, Clone)]
pub struct IceAgent {
    software: String,
}

impl IceAgent {
    pub fn new(software: impl Into<String>) -> Self {
        Self {
            software: software.into(),
        }
    }

    /// Validates a binding request and builds the success response.
    ///
    /// Returns `Ok(None)` for STUN traffic that is not a binding request.
    /// Requests that fail USERNAME, MESSAGE-INTEGRITY or FINGERPRINT checks
    /// return an error; the caller drops them without answering.
    pub fn handle_binding_request(
        &self,
        raw: &[u8],
        remote: SocketAddr,
        store: &dyn CredentialStore,
    ) -> Result<Option<BindingAnswer>> {
        if !stun::is_stun(raw) {
            bail!("not a STUN message");
        }
        let decoded = StunMessage::decode(raw).context("malformed STUN message")?;
        let msg = &decoded.message;
        if msg.class != StunClass::Request || msg.method != StunMethod::Binding {
            trace!("ignoring STUN {:?} {:?} from {}", msg.class, msg.method, remote);
            return Ok(None);
        }

        let Some(username) = msg.username() else {
            bail!("binding request without USERNAME");
        };
        let Some((local_ufrag, remote_ufrag)) = username.split_once(':') else {
            bail!("USERNAME {username:?} is not ufrag:ufrag");
        };
        let Some(credentials) = store.lookup(local_ufrag) else {
            bail!("unknown ufrag {local_ufrag:?}");
        };
        if !decoded.verify_message_integrity(raw, credentials.password.as_bytes()) {
            bail!("MESSAGE-INTEGRITY check failed");
        }
        if !decoded.verify_fingerprint(raw) {
            bail!("FINGERPRINT check failed");
        }

        let mut response = StunMessage::binding_success_response(msg.transaction_id, remote);
        response
            .attributes
            .push(StunAttribute::Username(username.to_string()));
        response
            .attributes
            .push(StunAttribute::Software(self.software.clone()));
        let bytes = response.encode(Some(credentials.password.as_bytes()), true)?;

        Ok(Some(BindingAnswer {
            response: bytes,
            remote_username_fragment: remote_ufrag.to_string(),
            credentials,
            use_candidate: msg.use_candidate(),
        }))
    }
}

/// Builds the connectivity check a controlling browser agent sends to a
/// server owning `server` credentials.
pub fn connectivity_check(
    server: &IceCredentialPair,
    client_ufrag: &str,
    transaction_id: [u8; 12],
    use_candidate: bool,
) -> Result<Vec<u8>> {
    let mut attributes = vec![
        StunAttribute::Username(format!("{}:{}", server.username_fragment, client_ufrag)),
        StunAttribute::Priority(0x6E00_01FF),
        StunAttribute::IceControlling(rand::random()),
    ];
    if use_candidate {
        attributes.push(StunAttribute::UseCandidate);
    }
    StunMessage::binding_request(transaction_id, attributes)
        .encode(Some(server.password.as_bytes()), true)
}
