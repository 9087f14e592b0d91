#[cfg(test)]
mod tests;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use core::fmt;
use dtls::config::{ClientAuthType, Config, ExtendedMasterSecretType};
use dtls::conn::DTLSConn;
use dtls::crypto::Certificate;
use dtls::extension::extension_use_srtp::SrtpProtectionProfile;
use sha2::{Digest, Sha256};
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use webrtc_util::KeyingMaterialExporter;
use webrtc_util::conn::Conn;

use crate::srtp::{SrtpProfile, SrtpSession};
use crate::transports::{DatagramSink, PacketReceiver};

const SRTP_EXPORTER_LABEL: &str = "EXTRACTOR-dtls_srtp";

pub fn generate_certificate() -> Result<Certificate> {
    Ok(Certificate::generate_self_signed(vec!["rustsfu".to_string()])?)
}

/// SHA-256 fingerprint of the leaf certificate in SDP `a=fingerprint` form.
pub fn fingerprint(cert: &Certificate) -> String {
    let Some(der) = cert.certificate.first() else {
        return String::new();
    };
    let mut hasher = Sha256::new();
    hasher.update(der.as_ref());
    let result = hasher.finalize();
    result
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<String>>()
        .join(":")
}

#[derive(Clone)]
pub struct DtlsConfig {
    pub certificate: Certificate,
    pub srtp_profiles: Vec<SrtpProfile>,
    pub handshake_timeout: Duration,
    pub receive_timeout: Duration,
    pub inbound_queue: usize,
}

impl fmt::Debug for DtlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsConfig")
            .field("fingerprint", &fingerprint(&self.certificate))
            .field("srtp_profiles", &self.srtp_profiles)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("receive_timeout", &self.receive_timeout)
            .field("inbound_queue", &self.inbound_queue)
            .finish()
    }
}

impl DtlsConfig {
    pub fn new(certificate: Certificate) -> Self {
        Self {
            certificate,
            srtp_profiles: vec![SrtpProfile::Aes128CmHmacSha1_80],
            handshake_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(10),
            inbound_queue: 256,
        }
    }

    fn engine_config(&self) -> Config {
        Config {
            certificates: vec![self.certificate.clone()],
            srtp_protection_profiles: self
                .srtp_profiles
                .iter()
                .map(|p| match p {
                    SrtpProfile::Aes128CmHmacSha1_80 => {
                        SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80
                    }
                    SrtpProfile::Aes128CmHmacSha1_32 => {
                        SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_32
                    }
                })
                .collect(),
            client_auth: ClientAuthType::RequireAnyClientCert,
            extended_master_secret: ExtendedMasterSecretType::Require,
            // Peer certificates are pinned by the SDP fingerprint, not a CA chain.
            insecure_skip_verify: true,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub enum DtlsState {
    New,
    Handshaking,
    Connected(Arc<SrtpSession>),
    Failed,
    Closed,
}

impl PartialEq for DtlsState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DtlsState::Connected(a), DtlsState::Connected(b)) => Arc::ptr_eq(a, b),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl fmt::Debug for DtlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for DtlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DtlsState::New => write!(f, "New"),
            DtlsState::Handshaking => write!(f, "Handshaking"),
            DtlsState::Connected(session) => write!(f, "Connected (SRTP: {:?})", session.profile()),
            DtlsState::Failed => write!(f, "Failed"),
            DtlsState::Closed => write!(f, "Closed"),
        }
    }
}

enum ShimMessage {
    Datagram(Bytes),
    Close,
}

/// Datagram transport handed to the DTLS engine. Inbound records arrive
/// through a bounded queue fed by the dispatcher; outbound records go
/// straight to the shared socket.
pub struct DatagramShim {
    local: SocketAddr,
    remote: SocketAddr,
    inbound: tokio::sync::Mutex<mpsc::Receiver<ShimMessage>>,
    feeder: mpsc::Sender<ShimMessage>,
    sink: Arc<dyn DatagramSink>,
    receive_timeout: Duration,
    handshake_done: AtomicBool,
    closed: AtomicBool,
}

impl DatagramShim {
    fn new(
        local: SocketAddr,
        remote: SocketAddr,
        sink: Arc<dyn DatagramSink>,
        queue: usize,
        receive_timeout: Duration,
    ) -> Self {
        let (feeder, inbound) = mpsc::channel(queue.max(1));
        Self {
            local,
            remote,
            inbound: tokio::sync::Mutex::new(inbound),
            feeder,
            sink,
            receive_timeout,
            handshake_done: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Queues an inbound record. Never blocks; a full queue drops the record
    /// and DTLS retransmission recovers it.
    fn offer(&self, data: Bytes) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.feeder.try_send(ShimMessage::Datagram(data)).is_ok()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.feeder.try_send(ShimMessage::Close);
    }

    async fn next_datagram(&self) -> io::Result<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        let mut inbound = self.inbound.lock().await;
        let message = if self.handshake_done.load(Ordering::Acquire) {
            inbound.recv().await
        } else {
            timeout(self.receive_timeout, inbound.recv())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "DTLS receive timed out"))?
        };
        match message {
            Some(ShimMessage::Datagram(data)) => Ok(data),
            Some(ShimMessage::Close) | None => Err(closed_error()),
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "DTLS transport closed")
}

#[async_trait]
impl Conn for DatagramShim {
    async fn connect(&self, _addr: SocketAddr) -> webrtc_util::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "shim is already connected").into())
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        let data = self.next_datagram().await?;
        if data.len() > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("DTLS record of {} bytes exceeds {} byte buffer", data.len(), buf.len()),
            )
            .into());
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc_util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, self.remote))
    }

    async fn send(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error().into());
        }
        Ok(self.sink.send_to(buf, self.remote).await?)
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc_util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> webrtc_util::Result<SocketAddr> {
        Ok(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn close(&self) -> webrtc_util::Result<()> {
        DatagramShim::close(self);
        Ok(())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

struct DtlsInner {
    config: DtlsConfig,
    is_client: bool,
    shim: Arc<DatagramShim>,
    state_tx: watch::Sender<DtlsState>,
    started: AtomicBool,
    conn: Mutex<Option<Arc<DTLSConn>>>,
}

/// DTLS-SRTP association with one remote endpoint.
///
/// `New` until the first record arrives, then the handshake runs on its own
/// task. On success the exported keying material becomes an
/// [`SrtpSession`] published through `Connected`. Any failure is final.
#[derive(Clone)]
pub struct DtlsAssociation {
    inner: Arc<DtlsInner>,
}

impl fmt::Debug for DtlsAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsAssociation")
            .field("remote", &self.inner.shim.remote)
            .field("is_client", &self.inner.is_client)
            .field("state", &*self.inner.state_tx.borrow())
            .finish()
    }
}

impl DtlsAssociation {
    pub fn new(
        config: DtlsConfig,
        sink: Arc<dyn DatagramSink>,
        local: SocketAddr,
        remote: SocketAddr,
        is_client: bool,
    ) -> Self {
        let shim = Arc::new(DatagramShim::new(
            local,
            remote,
            sink,
            config.inbound_queue,
            config.receive_timeout,
        ));
        let (state_tx, _) = watch::channel(DtlsState::New);
        Self {
            inner: Arc::new(DtlsInner {
                config,
                is_client,
                shim,
                state_tx,
                started: AtomicBool::new(false),
                conn: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> DtlsState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DtlsState> {
        self.inner.state_tx.subscribe()
    }

    pub fn srtp_session(&self) -> Option<Arc<SrtpSession>> {
        match &*self.inner.state_tx.borrow() {
            DtlsState::Connected(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Feeds one inbound record. The first record starts the handshake.
    pub fn offer(&self, data: Bytes) {
        let state = self.state();
        if matches!(state, DtlsState::Failed | DtlsState::Closed) {
            trace!("dropping DTLS record for {} association", state);
            return;
        }
        if !self.inner.shim.offer(data) {
            debug!("DTLS inbound queue full for {}", self.inner.shim.remote);
        }
        self.start();
    }

    /// Starts the handshake driver. Servers start on the first inbound
    /// record; clients call this directly to send the ClientHello.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.state_tx.send_replace(DtlsState::Handshaking);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.handshake().await {
                warn!("DTLS handshake with {} failed: {}", inner.shim.remote, e);
                inner.fail().await;
            }
        });
    }

    pub async fn close(&self) {
        self.inner.shim.close();
        let conn = self.inner.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            let _ = conn.close().await;
        }
        if let DtlsState::Connected(session) = self.state() {
            session.close();
        }
        self.inner.state_tx.send_replace(DtlsState::Closed);
    }
}

impl DtlsInner {
    async fn handshake(self: &Arc<Self>) -> Result<()> {
        let conn = timeout(
            self.config.handshake_timeout,
            DTLSConn::new(
                self.shim.clone(),
                self.config.engine_config(),
                self.is_client,
                None,
            ),
        )
        .await
        .map_err(|_| anyhow!("handshake timed out"))??;
        self.shim.handshake_done.store(true, Ordering::Release);
        let conn = Arc::new(conn);
        *self.conn.lock().unwrap() = Some(conn.clone());

        let session = export_srtp_session(&conn, self.is_client).await?;
        debug!(
            "DTLS connected with {} ({:?})",
            self.shim.remote,
            session.profile()
        );
        // close() may have raced with the handshake
        if self.shim.closed.load(Ordering::Acquire) {
            session.close();
            bail!("association closed during handshake");
        }
        self.state_tx
            .send_replace(DtlsState::Connected(Arc::new(session)));
        Ok(())
    }

    async fn fail(&self) {
        self.shim.close();
        let conn = self.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            let _ = conn.close().await;
        }
        self.state_tx.send_if_modified(|state| {
            if matches!(state, DtlsState::Closed) {
                return false;
            }
            *state = DtlsState::Failed;
            true
        });
    }
}

async fn export_srtp_session(conn: &DTLSConn, is_client: bool) -> Result<SrtpSession> {
    let profile = match conn.selected_srtpprotection_profile() {
        SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80 => SrtpProfile::Aes128CmHmacSha1_80,
        SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_32 => SrtpProfile::Aes128CmHmacSha1_32,
        other => bail!("unsupported SRTP protection profile {:?}", other),
    };
    let state = conn.connection_state().await;
    let material = state
        .export_keying_material(SRTP_EXPORTER_LABEL, &[], profile.keying_material_len())
        .await
        .map_err(|e| anyhow!("keying material export failed: {e}"))?;
    Ok(SrtpSession::from_exported(profile, &material, is_client)?)
}

#[async_trait]
impl PacketReceiver for DtlsAssociation {
    async fn receive(&self, packet: Bytes, _addr: SocketAddr) {
        self.offer(packet);
    }
}
