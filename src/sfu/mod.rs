pub mod consumer;
pub mod pacer;
pub mod producer;
pub mod router;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::SfuConfig;
use crate::errors::{SfuError, SfuResult};
use crate::rtp::{PayloadFeedback, ReceiverReport, RtcpPacket, RtpPacket};
use crate::time::MediaClock;
use crate::transports::ice::{CredentialStore, IceCredentialPair};

use self::consumer::{Consumer, ConsumerId, ConsumerParams};
use self::producer::{MediaLineInfo, Producer, ProducerId};
use self::router::MediaRouter;

pub type PeerId = u64;

/// Outbound path to one connected peer.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn send_rtp_packet(&self, packet: &RtpPacket) -> SfuResult<()>;
    async fn send_rtcp_packets(&self, packets: &[RtcpPacket]) -> SfuResult<()>;
    async fn write_raw_datagram(&self, data: &[u8]) -> SfuResult<()>;

    /// Drops any per-stream state kept for `ssrc`, such as crypto contexts.
    fn release_ssrc(&self, _ssrc: u32) {}
}

/// Topology and connectivity changes for the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SfuEvent {
    ProducerAdded { peer: PeerId, producer: ProducerId },
    /// The peer's consumer set changed; a new offer is due.
    RenegotiationNeeded { peer: PeerId },
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SsrcOwner {
    Peer(PeerId),
    Producer(ProducerId),
    Consumer(ConsumerId),
}

/// A logical node: one ICE credential pair, its published producers and the
/// consumers it subscribes to.
pub struct Peer {
    id: PeerId,
    credentials: IceCredentialPair,
    rtcp_ssrc: u32,
    transport: RwLock<Option<Arc<dyn MediaTransport>>>,
    producers: DashMap<ProducerId, Arc<Producer>>,
    consumers: DashMap<ConsumerId, Arc<Consumer>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("ufrag", &self.credentials.username_fragment)
            .field("connected", &self.is_connected())
            .field("producers", &self.producers.len())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn credentials(&self) -> &IceCredentialPair {
        &self.credentials
    }

    /// SSRC used as the sender of this node's receiver reports and PLIs.
    pub fn rtcp_ssrc(&self) -> u32 {
        self.rtcp_ssrc
    }

    pub fn transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.transport.read().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.read().unwrap().is_some()
    }

    pub fn producers(&self) -> Vec<Arc<Producer>> {
        self.producers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn consumers(&self) -> Vec<Arc<Consumer>> {
        self.consumers.iter().map(|e| e.value().clone()).collect()
    }
}

/// Selective forwarding core: routes decrypted media between peers and
/// regenerates RTCP on both sides.
pub struct Sfu {
    config: SfuConfig,
    clock: MediaClock,
    next_id: AtomicU64,
    peers: DashMap<PeerId, Arc<Peer>>,
    peers_by_ufrag: DashMap<String, PeerId>,
    producers: DashMap<ProducerId, Arc<Producer>>,
    consumers: DashMap<ConsumerId, Arc<Consumer>>,
    ssrcs: DashMap<u32, SsrcOwner>,
    router: MediaRouter,
    events: mpsc::UnboundedSender<SfuEvent>,
}

impl Sfu {
    pub fn new(config: SfuConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<SfuEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let sfu = Arc::new(Self {
            config,
            clock: MediaClock::new(),
            next_id: AtomicU64::new(1),
            peers: DashMap::new(),
            peers_by_ufrag: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
            ssrcs: DashMap::new(),
            router: MediaRouter::new(),
            events,
        });
        (sfu, rx)
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub fn clock(&self) -> &MediaClock {
        &self.clock
    }

    pub fn router(&self) -> &MediaRouter {
        &self.router
    }

    fn emit(&self, event: SfuEvent) {
        trace!("sfu event {:?}", event);
        let _ = self.events.send(event);
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate_ssrc(&self, owner: SsrcOwner) -> u32 {
        loop {
            let ssrc: u32 = rand::random();
            if ssrc == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.ssrcs.entry(ssrc) {
                slot.insert(owner);
                return ssrc;
            }
        }
    }

    fn claim_ssrc(&self, ssrc: u32, owner: SsrcOwner) -> SfuResult<()> {
        match self.ssrcs.entry(ssrc) {
            Entry::Vacant(slot) => {
                slot.insert(owner);
                Ok(())
            }
            Entry::Occupied(_) => Err(SfuError::InvalidState(format!(
                "ssrc {ssrc:#010x} is already in use"
            ))),
        }
    }

    fn release_ssrc(&self, ssrc: u32, owner: SsrcOwner) {
        self.ssrcs.remove_if(&ssrc, |_, o| *o == owner);
    }

    pub fn add_peer(&self, credentials: IceCredentialPair) -> SfuResult<Arc<Peer>> {
        let id = self.allocate_id();
        match self.peers_by_ufrag.entry(credentials.username_fragment.clone()) {
            Entry::Occupied(_) => {
                return Err(SfuError::InvalidState(format!(
                    "ufrag {} is already registered",
                    credentials.username_fragment
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        let peer = Arc::new(Peer {
            id,
            credentials,
            rtcp_ssrc: self.allocate_ssrc(SsrcOwner::Peer(id)),
            transport: RwLock::new(None),
            producers: DashMap::new(),
            consumers: DashMap::new(),
        });
        self.peers.insert(id, peer.clone());
        debug!("peer {} added", id);
        Ok(peer)
    }

    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.get(&id).map(|e| e.value().clone())
    }

    pub fn peer_for_ufrag(&self, ufrag: &str) -> Option<Arc<Peer>> {
        let id = *self.peers_by_ufrag.get(ufrag)?;
        self.peer(id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Tears down a peer with everything it publishes and consumes.
    pub async fn remove_peer(&self, id: PeerId) -> SfuResult<()> {
        let (_, peer) = self.peers.remove(&id).ok_or(SfuError::UnknownPeer(id))?;
        self.peers_by_ufrag
            .remove_if(&peer.credentials.username_fragment, |_, v| *v == id);
        self.release_ssrc(peer.rtcp_ssrc, SsrcOwner::Peer(id));

        for consumer in peer.consumers() {
            self.detach_consumer(&consumer);
        }
        for producer in peer.producers() {
            self.remove_producer(producer.id()).await?;
        }
        let was_connected = peer.transport.write().unwrap().take().is_some();
        if was_connected {
            self.emit(SfuEvent::PeerDisconnected { peer: id });
        }
        debug!("peer {} removed", id);
        Ok(())
    }

    /// Binds the secured transport of a peer once its DTLS handshake is done.
    pub fn attach_transport(
        &self,
        id: PeerId,
        transport: Arc<dyn MediaTransport>,
    ) -> SfuResult<()> {
        let peer = self.peer(id).ok_or(SfuError::UnknownPeer(id))?;
        *peer.transport.write().unwrap() = Some(transport);
        // subscriptions made before the transport existed need a fresh keyframe
        for consumer in peer.consumers() {
            if let Some(producer) = self.producer(consumer.producer_id()) {
                producer.request_keyframe();
            }
        }
        debug!("peer {} connected", id);
        self.emit(SfuEvent::PeerConnected { peer: id });
        Ok(())
    }

    pub fn detach_transport(&self, id: PeerId) {
        let Some(peer) = self.peer(id) else {
            return;
        };
        if peer.transport.write().unwrap().take().is_some() {
            debug!("peer {} disconnected", id);
            self.emit(SfuEvent::PeerDisconnected { peer: id });
        }
    }

    pub fn producer(&self, id: ProducerId) -> Option<Arc<Producer>> {
        self.producers.get(&id).map(|e| e.value().clone())
    }

    pub fn consumer(&self, id: ConsumerId) -> Option<Arc<Consumer>> {
        self.consumers.get(&id).map(|e| e.value().clone())
    }

    /// Registers a media line announced by `peer` as a producer.
    pub fn add_producer(
        &self,
        peer_id: PeerId,
        info: MediaLineInfo,
    ) -> SfuResult<Arc<Producer>> {
        let peer = self.peer(peer_id).ok_or(SfuError::UnknownPeer(peer_id))?;
        let id = self.allocate_id();
        self.claim_ssrc(info.ssrc, SsrcOwner::Producer(id))?;
        if let Some(rtx) = info.rtx_ssrc
            && let Err(e) = self.claim_ssrc(rtx, SsrcOwner::Producer(id))
        {
            self.release_ssrc(info.ssrc, SsrcOwner::Producer(id));
            return Err(e);
        }
        let producer = Arc::new(Producer::new(id, peer_id, info));
        self.producers.insert(id, producer.clone());
        peer.producers.insert(id, producer.clone());
        debug!(
            "peer {} produces {:?} ssrc {:#010x} as producer {}",
            peer_id,
            producer.info().kind,
            producer.ssrc(),
            id
        );
        self.emit(SfuEvent::ProducerAdded {
            peer: peer_id,
            producer: id,
        });
        Ok(producer)
    }

    /// Removes a producer and every consumer it feeds.
    pub async fn remove_producer(&self, id: ProducerId) -> SfuResult<()> {
        let (_, producer) = self
            .producers
            .remove(&id)
            .ok_or(SfuError::UnknownProducer(id))?;
        if let Some(peer) = self.peer(producer.peer_id()) {
            peer.producers.remove(&id);
            if let Some(transport) = peer.transport() {
                transport.release_ssrc(producer.ssrc());
                if let Some(rtx) = producer.info().rtx_ssrc {
                    transport.release_ssrc(rtx);
                }
            }
        }
        self.release_ssrc(producer.ssrc(), SsrcOwner::Producer(id));
        if let Some(rtx) = producer.info().rtx_ssrc {
            self.release_ssrc(rtx, SsrcOwner::Producer(id));
        }
        for consumer in self.router.remove_producer(id) {
            self.consumers.remove(&consumer.id());
            self.finish_consumer(consumer).await;
        }
        debug!("producer {} removed", id);
        Ok(())
    }

    /// Subscribes `peer_id` to a producer of another peer.
    pub fn create_consumer(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> SfuResult<Arc<Consumer>> {
        let peer = self.peer(peer_id).ok_or(SfuError::UnknownPeer(peer_id))?;
        let producer = self
            .producer(producer_id)
            .ok_or(SfuError::UnknownProducer(producer_id))?;
        if producer.peer_id() == peer_id {
            return Err(SfuError::InvalidState(format!(
                "peer {peer_id} cannot consume its own producer {producer_id}"
            )));
        }

        let id = self.allocate_id();
        let owner = SsrcOwner::Consumer(id);
        let info = producer.info();
        let consumer = Arc::new(Consumer::new(
            ConsumerParams {
                id,
                producer_id,
                peer_id,
                ssrc: self.allocate_ssrc(owner),
                rtx_ssrc: info.rtx_ssrc.map(|_| self.allocate_ssrc(owner)),
                payload_type: info.payload_type,
                clock_rate: info.clock_rate,
                cname: info.cname.clone(),
                source_ready: producer.has_source_clock(),
                initial_sequence: rand::random(),
            },
            self.config.consumer_timing(),
        ));

        self.consumers.insert(id, consumer.clone());
        peer.consumers.insert(id, consumer.clone());
        self.router.add(consumer.clone());
        producer.request_keyframe();
        debug!(
            "consumer {} (ssrc {:#010x}) of producer {} for peer {}",
            id,
            consumer.ssrc(),
            producer_id,
            peer_id
        );
        self.emit(SfuEvent::RenegotiationNeeded { peer: peer_id });
        Ok(consumer)
    }

    /// Stops forwarding to a consumer. Returns false when it is unknown.
    pub async fn remove_consumer(&self, id: ConsumerId) -> bool {
        let Some((_, consumer)) = self.consumers.remove(&id) else {
            return false;
        };
        self.router.remove(consumer.producer_id(), id);
        self.finish_consumer(consumer).await;
        true
    }

    /// Drops a consumer from its subscriber without notifying the remote.
    fn detach_consumer(&self, consumer: &Arc<Consumer>) {
        self.consumers.remove(&consumer.id());
        self.router.remove(consumer.producer_id(), consumer.id());
        self.release_consumer_ssrcs(consumer);
        consumer.clear();
    }

    fn release_consumer_ssrcs(&self, consumer: &Consumer) {
        let owner = SsrcOwner::Consumer(consumer.id());
        self.release_ssrc(consumer.ssrc(), owner);
        if let Some(rtx) = consumer.rtx_ssrc() {
            self.release_ssrc(rtx, owner);
        }
    }

    async fn finish_consumer(&self, consumer: Arc<Consumer>) {
        self.release_consumer_ssrcs(&consumer);
        consumer.clear();
        let Some(peer) = self.peer(consumer.peer_id()) else {
            return;
        };
        peer.consumers.remove(&consumer.id());
        if let Some(transport) = peer.transport() {
            let bye = [RtcpPacket::Goodbye(consumer.goodbye())];
            if let Err(e) = transport.send_rtcp_packets(&bye).await {
                debug!("BYE for consumer {} not sent: {}", consumer.id(), e);
            }
            transport.release_ssrc(consumer.ssrc());
            if let Some(rtx) = consumer.rtx_ssrc() {
                transport.release_ssrc(rtx);
            }
        }
        debug!("consumer {} removed", consumer.id());
        self.emit(SfuEvent::RenegotiationNeeded { peer: peer.id });
    }

    fn owner_of(&self, ssrc: u32) -> Option<SsrcOwner> {
        self.ssrcs.get(&ssrc).map(|e| *e.value())
    }

    fn producer_of(&self, peer_id: PeerId, ssrc: u32) -> Option<Arc<Producer>> {
        let Some(SsrcOwner::Producer(id)) = self.owner_of(ssrc) else {
            return None;
        };
        self.producer(id).filter(|p| p.peer_id() == peer_id)
    }

    /// Ingests one decrypted RTP packet from `peer_id`.
    pub fn on_rtp(&self, peer_id: PeerId, packet: RtpPacket, arrival_ns: u64) {
        let ssrc = packet.header.ssrc;
        let Some(producer) = self.producer_of(peer_id, ssrc) else {
            trace!("peer {} sent RTP for unknown ssrc {:#010x}", peer_id, ssrc);
            return;
        };
        if producer.is_rtx(ssrc) {
            producer.note_rtx_dropped();
            return;
        }
        let source_ns = producer.on_rtp(&packet, arrival_ns);
        for consumer in self.router.consumers(producer.id()).iter() {
            consumer.enqueue(packet.clone(), source_ns, arrival_ns);
        }
    }

    /// Ingests a decrypted compound RTCP packet from `peer_id`.
    pub fn on_rtcp(&self, peer_id: PeerId, packets: &[RtcpPacket], arrival_ns: u64) {
        for packet in packets {
            match packet {
                RtcpPacket::SenderReport(sr) => {
                    let Some(producer) = self.producer_of(peer_id, sr.ssrc) else {
                        trace!("SR for unknown ssrc {:#010x}", sr.ssrc);
                        continue;
                    };
                    if producer.on_sender_report(sr, arrival_ns) {
                        for consumer in self.router.consumers(producer.id()).iter() {
                            consumer.source_clock_ready();
                        }
                    }
                }
                RtcpPacket::PayloadFeedback(fb) if fb.is_pli() => {
                    let Some(SsrcOwner::Consumer(id)) = self.owner_of(fb.media_ssrc) else {
                        trace!("PLI for unknown ssrc {:#010x}", fb.media_ssrc);
                        continue;
                    };
                    if let Some(consumer) = self.consumer(id)
                        && consumer.peer_id() == peer_id
                        && let Some(producer) = self.producer(consumer.producer_id())
                    {
                        trace!("PLI from peer {} relayed to producer {}", peer_id, producer.id());
                        producer.request_keyframe();
                    }
                }
                RtcpPacket::ReceiverReport(rr) => {
                    for block in &rr.reports {
                        trace!(
                            "peer {} reports ssrc {:#010x}: lost {} jitter {}",
                            peer_id, block.ssrc, block.cumulative_lost, block.jitter
                        );
                    }
                }
                RtcpPacket::Goodbye(bye) => {
                    debug!("peer {} said goodbye for {:?}", peer_id, bye.sources);
                }
                other => trace!(
                    "ignoring RTCP {:?} from peer {} (sender {:?})",
                    other,
                    peer_id,
                    other.sender_ssrc()
                ),
            }
        }
    }

    /// Sends every consumer's due packets, at most `pacing_batch` each.
    pub async fn pace(&self, now_ns: u64) {
        let batch = self.config.pacing_batch.max(1);
        let mut work = Vec::new();
        for peer in self.peers.iter() {
            let Some(transport) = peer.transport() else {
                continue;
            };
            let packets: Vec<RtpPacket> = peer
                .consumers
                .iter()
                .flat_map(|c| c.poll_ready(now_ns, batch))
                .collect();
            if !packets.is_empty() {
                work.push((transport, packets));
            }
        }
        join_all(work.into_iter().map(|(transport, packets)| async move {
            for packet in &packets {
                if let Err(e) = transport.send_rtp_packet(packet).await {
                    trace!("forwarding ssrc {:#010x} failed: {}", packet.header.ssrc, e);
                }
            }
        }))
        .await;
    }

    /// Emits SR+SDES for every consumer and RR (+PLI) for every producer.
    pub async fn send_reports(&self, now_ns: u64) {
        let mut work = Vec::new();
        for peer in self.peers.iter() {
            let Some(transport) = peer.transport() else {
                continue;
            };
            let compounds = self.reports_for(&peer, now_ns);
            if !compounds.is_empty() {
                work.push((transport, compounds));
            }
        }
        join_all(work.into_iter().map(|(transport, compounds)| async move {
            for compound in &compounds {
                if let Err(e) = transport.send_rtcp_packets(compound).await {
                    trace!("RTCP send failed: {}", e);
                }
            }
        }))
        .await;
    }

    fn reports_for(&self, peer: &Peer, now_ns: u64) -> Vec<Vec<RtcpPacket>> {
        let mut compounds = Vec::new();
        for consumer in peer.consumers.iter() {
            if let Some(sr) = consumer.sender_report() {
                compounds.push(vec![
                    RtcpPacket::SenderReport(sr),
                    RtcpPacket::SourceDescription(consumer.source_description()),
                ]);
            }
        }
        for producer in peer.producers.iter() {
            let block = producer.report_block(now_ns);
            let keyframe = producer.take_keyframe_request();
            if block.is_none() && !keyframe {
                continue;
            }
            let mut compound = vec![RtcpPacket::ReceiverReport(ReceiverReport {
                ssrc: peer.rtcp_ssrc,
                reports: block.into_iter().collect(),
            })];
            if keyframe {
                compound.push(RtcpPacket::PayloadFeedback(PayloadFeedback::pli(
                    peer.rtcp_ssrc,
                    producer.ssrc(),
                )));
            }
            compounds.push(compound);
        }
        compounds
    }
}

impl CredentialStore for Sfu {
    fn lookup(&self, username_fragment: &str) -> Option<IceCredentialPair> {
        self.peer_for_ufrag(username_fragment)
            .map(|peer| peer.credentials.clone())
    }
}
