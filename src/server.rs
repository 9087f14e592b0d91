use anyhow::{Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::dispatcher::Dispatcher;
use crate::sfu::pacer::Scheduler;
use crate::sfu::{Sfu, SfuEvent};
use crate::transports::dtls::{DtlsConfig, fingerprint, generate_certificate};

/// A running SFU node on one UDP port.
pub struct SfuServer {
    sfu: Arc<Sfu>,
    dispatcher: Dispatcher,
    local_addr: SocketAddr,
    fingerprint: String,
    scheduler: Scheduler,
    tasks: Vec<JoinHandle<()>>,
}

impl SfuServer {
    /// Binds the media socket and starts the receive loop, the pacing and
    /// RTCP ticks and the idle sweep.
    pub async fn bind(config: SfuConfig) -> Result<(Self, mpsc::UnboundedReceiver<SfuEvent>)> {
        let socket = Arc::new(
            UdpSocket::bind(config.bind_addr)
                .await
                .with_context(|| format!("binding media socket on {}", config.bind_addr))?,
        );
        let local_addr = socket.local_addr()?;

        let certificate = generate_certificate().context("generating DTLS certificate")?;
        let fingerprint = fingerprint(&certificate);
        let mut dtls = DtlsConfig::new(certificate);
        dtls.srtp_profiles = config.srtp_profiles.clone();
        dtls.handshake_timeout = config.dtls_handshake_timeout;
        dtls.receive_timeout = config.dtls_receive_timeout;
        dtls.inbound_queue = config.dtls_inbound_queue;

        let (sfu, events) = Sfu::new(config.clone());
        let dispatcher = Dispatcher::new(&config, sfu.clone(), socket.clone(), dtls)?;
        let scheduler = Scheduler::start(&sfu);
        let sweeper = dispatcher.start_sweeper(config.sweep_interval);
        let receiver = tokio::spawn(receive_loop(
            socket,
            dispatcher.clone(),
            config.max_datagram_size,
        ));

        info!("SFU listening on {} (fingerprint {})", local_addr, fingerprint);
        Ok((
            Self {
                sfu,
                dispatcher,
                local_addr,
                fingerprint,
                scheduler,
                tasks: vec![receiver, sweeper],
            },
            events,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sfu(&self) -> &Arc<Sfu> {
        &self.sfu
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// SHA-256 fingerprint of the DTLS certificate, for `a=fingerprint`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        for task in &self.tasks {
            task.abort();
        }
        debug!("SFU on {} shut down", self.local_addr);
    }
}

impl Drop for SfuServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, dispatcher: Dispatcher, max_datagram: usize) {
    // one spare byte tells a full-size datagram from a truncated one
    let mut buf = vec![0u8; max_datagram + 1];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, addr)) if len > max_datagram => {
                debug!(
                    "dropping oversized datagram from {} (more than {} bytes)",
                    addr, max_datagram
                );
            }
            Ok((len, addr)) => {
                dispatcher.submit(addr, Bytes::copy_from_slice(&buf[..len]));
            }
            Err(e) => {
                // ICMP port unreachable surfaces here on some platforms
                if e.kind() == std::io::ErrorKind::ConnectionReset {
                    debug!("media socket recv: {}", e);
                    continue;
                }
                warn!("media socket recv failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfigBuilder;
    use std::time::Duration;

    #[tokio::test]
    async fn oversized_datagrams_are_dropped_whole() -> Result<()> {
        let config = SfuConfigBuilder::new()
            .bind_addr("127.0.0.1:0".parse()?)
            .max_datagram_size(64)
            .build();
        let (server, _events) = SfuServer::bind(config).await?;
        let client = UdpSocket::bind("127.0.0.1:0").await?;
        let client_addr = client.local_addr()?;

        client.send_to(&[0xC0; 65], server.local_addr()).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.dispatcher().session(client_addr).is_none());

        client.send_to(&[0xC0; 64], server.local_addr()).await?;
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.dispatcher().session(client_addr).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        Ok(())
    }
}
