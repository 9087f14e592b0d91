use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, trace};

use crate::config::SfuConfig;
use crate::errors::{SfuError, SfuResult};
use crate::rtp::{RtcpPacket, RtpPacket, marshal_compound};
use crate::sfu::{MediaTransport, PeerId, Sfu};
use crate::srtp::SrtpSession;
use crate::time::duration_ns;
use crate::transports::dtls::{DtlsAssociation, DtlsConfig, DtlsState};
use crate::transports::ice::IceAgent;
use crate::transports::{DatagramSink, PacketKind, classify, log_send_error};

/// Secured outbound path to one endpoint: protects with the endpoint's SRTP
/// session and writes to the shared socket.
pub struct SecureTransport {
    remote: SocketAddr,
    srtp: Arc<SrtpSession>,
    sink: Arc<dyn DatagramSink>,
}

impl SecureTransport {
    pub fn new(remote: SocketAddr, srtp: Arc<SrtpSession>, sink: Arc<dyn DatagramSink>) -> Self {
        Self { remote, srtp, sink }
    }

    async fn send(&self, what: &str, data: &[u8]) -> SfuResult<()> {
        match self.sink.send_to(data, self.remote).await {
            Ok(_) => Ok(()),
            Err(e) => {
                log_send_error(what, self.remote, &e);
                Err(SfuError::Transport(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl MediaTransport for SecureTransport {
    async fn send_rtp_packet(&self, packet: &RtpPacket) -> SfuResult<()> {
        let mut buf = packet.marshal()?;
        self.srtp.protect_rtp(&mut buf)?;
        self.send("SRTP", &buf).await
    }

    async fn send_rtcp_packets(&self, packets: &[RtcpPacket]) -> SfuResult<()> {
        if packets.is_empty() {
            return Ok(());
        }
        let mut buf = marshal_compound(packets)?;
        self.srtp.protect_rtcp(&mut buf)?;
        self.send("SRTCP", &buf).await
    }

    async fn write_raw_datagram(&self, data: &[u8]) -> SfuResult<()> {
        self.send("datagram", data).await
    }

    fn release_ssrc(&self, ssrc: u32) {
        self.srtp.remove_ssrc(ssrc);
    }
}

#[derive(Default)]
struct SessionState {
    peer: Option<PeerId>,
    dtls: Option<DtlsAssociation>,
    srtp: Option<Arc<SrtpSession>>,
    watcher: Option<JoinHandle<()>>,
}

/// Everything the dispatcher knows about one remote address.
pub struct EndpointSession {
    remote: SocketAddr,
    queue: Mutex<VecDeque<Bytes>>,
    processing: AtomicBool,
    closed: AtomicBool,
    last_activity_ns: AtomicU64,
    state: Mutex<SessionState>,
}

impl EndpointSession {
    fn new(remote: SocketAddr, now_ns: u64) -> Self {
        Self {
            remote,
            queue: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_activity_ns: AtomicU64::new(now_ns),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn peer(&self) -> Option<PeerId> {
        self.state.lock().unwrap().peer
    }

    pub fn srtp_session(&self) -> Option<Arc<SrtpSession>> {
        self.state.lock().unwrap().srtp.clone()
    }

    pub fn dtls(&self) -> Option<DtlsAssociation> {
        self.state.lock().unwrap().dtls.clone()
    }

    pub fn last_activity_ns(&self) -> u64 {
        self.last_activity_ns.load(Ordering::Relaxed)
    }

    fn pop(&self) -> Option<Bytes> {
        self.queue.lock().unwrap().pop_front()
    }

    fn has_queued(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }
}

struct DispatcherInner {
    sfu: Arc<Sfu>,
    sink: Arc<dyn DatagramSink>,
    local_addr: SocketAddr,
    ice: IceAgent,
    dtls: DtlsConfig,
    idle_timeout_ns: u64,
    sessions: DashMap<SocketAddr, Arc<EndpointSession>>,
    workers: Arc<Semaphore>,
}

/// Demultiplexes datagrams from the shared media socket into per-endpoint
/// sessions. Datagrams from one address are processed strictly in order by
/// at most one task at a time; different addresses proceed in parallel.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        config: &SfuConfig,
        sfu: Arc<Sfu>,
        sink: Arc<dyn DatagramSink>,
        dtls: DtlsConfig,
    ) -> Result<Self> {
        let local_addr = sink.local_addr()?;
        Ok(Self {
            inner: Arc::new(DispatcherInner {
                sfu,
                sink,
                local_addr,
                ice: IceAgent::new(config.software.clone()),
                dtls,
                idle_timeout_ns: duration_ns(config.idle_timeout),
                sessions: DashMap::new(),
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
            }),
        })
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn session(&self, remote: SocketAddr) -> Option<Arc<EndpointSession>> {
        self.inner.sessions.get(&remote).map(|e| e.value().clone())
    }

    /// Queues one datagram from `remote` for in-order processing.
    pub fn submit(&self, remote: SocketAddr, datagram: Bytes) {
        let now = self.inner.sfu.clock().now_ns();
        let session = self
            .inner
            .sessions
            .entry(remote)
            .or_insert_with(|| {
                trace!("new endpoint session for {}", remote);
                Arc::new(EndpointSession::new(remote, now))
            })
            .clone();
        session.last_activity_ns.store(now, Ordering::Relaxed);
        session.queue.lock().unwrap().push_back(datagram);
        self.schedule(session);
    }

    fn schedule(&self, session: Arc<EndpointSession>) {
        if session
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // the active drainer will pick it up
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let Ok(_permit) = inner.workers.clone().acquire_owned().await else {
                session.processing.store(false, Ordering::Release);
                return;
            };
            loop {
                while let Some(datagram) = session.pop() {
                    if session.closed.load(Ordering::Acquire) {
                        break;
                    }
                    inner.handle(&session, datagram).await;
                }
                session.processing.store(false, Ordering::Release);
                // a submit may have raced with releasing the flag
                if session.closed.load(Ordering::Acquire)
                    || !session.has_queued()
                    || session
                        .processing
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                {
                    break;
                }
            }
        });
    }

    /// Tears down the session for `remote`. Returns false if there was none.
    pub async fn close(&self, remote: SocketAddr) -> bool {
        DispatcherInner::close(&self.inner, remote).await
    }

    /// Closes every session idle for at least the idle timeout.
    pub async fn sweep(&self, now_ns: u64) -> usize {
        let idle: Vec<SocketAddr> = self
            .inner
            .sessions
            .iter()
            .filter(|e| now_ns.saturating_sub(e.last_activity_ns()) >= self.inner.idle_timeout_ns)
            .map(|e| *e.key())
            .collect();
        let mut closed = 0;
        for remote in idle {
            debug!("evicting idle endpoint {}", remote);
            if self.close(remote).await {
                closed += 1;
            }
        }
        closed
    }

    /// Runs [`Dispatcher::sweep`] every `period`.
    pub fn start_sweeper(&self, period: std::time::Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = interval(period.max(std::time::Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let dispatcher = Dispatcher { inner };
                let now = dispatcher.inner.sfu.clock().now_ns();
                let evicted = dispatcher.sweep(now).await;
                if evicted > 0 {
                    debug!("idle sweep evicted {} endpoints", evicted);
                }
            }
        })
    }
}

impl DispatcherInner {
    async fn handle(self: &Arc<Self>, session: &Arc<EndpointSession>, datagram: Bytes) {
        let remote = session.remote;
        match classify(&datagram) {
            PacketKind::Stun => self.handle_stun(session, &datagram).await,
            PacketKind::Dtls => match session.dtls() {
                Some(dtls) => dtls.offer(datagram),
                None => debug!("DTLS from {} before ICE, dropping", remote),
            },
            PacketKind::Srtp => self.handle_srtp(session, datagram),
            PacketKind::Srtcp => self.handle_srtcp(session, datagram),
            PacketKind::Unknown => {
                debug!(
                    "dropping unclassifiable datagram from {} ({} bytes)",
                    remote,
                    datagram.len()
                );
            }
        }
    }

    async fn handle_stun(self: &Arc<Self>, session: &Arc<EndpointSession>, datagram: &[u8]) {
        let remote = session.remote;
        let answer = match self
            .ice
            .handle_binding_request(datagram, remote, self.sfu.as_ref())
        {
            Ok(Some(answer)) => answer,
            Ok(None) => return,
            Err(e) => {
                debug!("dropping STUN from {}: {:#}", remote, e);
                return;
            }
        };
        if let Err(e) = self.sink.send_to(&answer.response, remote).await {
            log_send_error("STUN response", remote, &e);
        }

        let Some(peer) = self.sfu.peer_for_ufrag(&answer.credentials.username_fragment) else {
            return;
        };
        let mut state = session.state.lock().unwrap();
        if state.peer.is_some() {
            return;
        }
        debug!(
            "ICE connected: {} is peer {} (use-candidate {})",
            remote,
            peer.id(),
            answer.use_candidate
        );
        let dtls = DtlsAssociation::new(
            self.dtls.clone(),
            self.sink.clone(),
            self.local_addr,
            remote,
            false,
        );
        state.peer = Some(peer.id());
        state.dtls = Some(dtls.clone());
        state.watcher = Some(self.watch_dtls(remote, peer.id(), dtls));
    }

    fn watch_dtls(
        self: &Arc<Self>,
        remote: SocketAddr,
        peer: PeerId,
        dtls: DtlsAssociation,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut rx = dtls.subscribe_state();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match state {
                    DtlsState::Connected(srtp) => {
                        let Some(session) = inner.sessions.get(&remote).map(|e| e.value().clone())
                        else {
                            return;
                        };
                        session.state.lock().unwrap().srtp = Some(srtp.clone());
                        let transport =
                            Arc::new(SecureTransport::new(remote, srtp, inner.sink.clone()));
                        if let Err(e) = inner.sfu.attach_transport(peer, transport) {
                            debug!("peer {} gone before DTLS completed: {}", peer, e);
                        }
                    }
                    DtlsState::Failed | DtlsState::Closed => {
                        debug!("DTLS with {} ended ({}), closing session", remote, state);
                        // close() aborts this watcher, so run it detached
                        tokio::spawn(async move {
                            DispatcherInner::close(&inner, remote).await;
                        });
                        return;
                    }
                    DtlsState::New | DtlsState::Handshaking => {}
                }
            }
        })
    }

    fn handle_srtp(&self, session: &EndpointSession, datagram: Bytes) {
        let remote = session.remote;
        let (Some(peer), Some(srtp)) = (session.peer(), session.srtp_session()) else {
            trace!("SRTP from {} before DTLS, dropping", remote);
            return;
        };
        let mut buf = datagram.to_vec();
        if let Err(e) = srtp.unprotect_rtp(&mut buf) {
            debug!("dropping SRTP from {}: {}", remote, e);
            return;
        }
        match RtpPacket::from_bytes(Bytes::from(buf)) {
            Ok(packet) => self.sfu.on_rtp(peer, packet, self.sfu.clock().now_ns()),
            Err(e) => debug!("dropping RTP from {}: {}", remote, e),
        }
    }

    fn handle_srtcp(&self, session: &EndpointSession, datagram: Bytes) {
        let remote = session.remote;
        let (Some(peer), Some(srtp)) = (session.peer(), session.srtp_session()) else {
            trace!("SRTCP from {} before DTLS, dropping", remote);
            return;
        };
        let mut buf = datagram.to_vec();
        if let Err(e) = srtp.unprotect_rtcp(&mut buf) {
            debug!("dropping SRTCP from {}: {}", remote, e);
            return;
        }
        match RtcpPacket::parse_compound(&buf) {
            Ok(packets) => self.sfu.on_rtcp(peer, &packets, self.sfu.clock().now_ns()),
            Err(e) => debug!("dropping RTCP from {}: {}", remote, e),
        }
    }

    async fn close(this: &Arc<Self>, remote: SocketAddr) -> bool {
        let Some((_, session)) = this.sessions.remove(&remote) else {
            return false;
        };
        session.closed.store(true, Ordering::Release);
        session.queue.lock().unwrap().clear();
        let state = std::mem::take(&mut *session.state.lock().unwrap());
        if let Some(watcher) = state.watcher {
            watcher.abort();
        }
        if let Some(dtls) = state.dtls {
            dtls.close().await;
        }
        if let Some(srtp) = state.srtp {
            srtp.close();
        }
        if let Some(peer) = state.peer {
            this.sfu.detach_transport(peer);
        }
        debug!("endpoint session {} closed", remote);
        true
    }
}
