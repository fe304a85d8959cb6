//! UDP ingress: one socket, one reader task.
//!
//! A single reader keeps datagram order stable per exporter; ordering is
//! then preserved down the pipeline by sharding exporters onto workers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::packet::{BufferPool, Datagram, MAX_DATAGRAM};
use crate::stats::Stats;

/// Bind the ingress socket and request the configured receive buffer.
pub async fn bind(port: u16, buffer_size: usize) -> Result<UdpSocket> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("binding UDP {addr}"))?;

    if let Err(err) = SockRef::from(&socket).set_recv_buffer_size(buffer_size) {
        // The kernel clamps to rmem_max; a refusal is not fatal.
        warn!(%err, buffer_size, "could not set SO_RCVBUF");
    }

    info!(port, "flow ingress listening");
    Ok(socket)
}

/// Worker shard for an exporter address. All datagrams from one exporter
/// land on the same worker so templates are applied before their data.
pub fn shard_for(ip: IpAddr, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    ip.hash(&mut hasher);
    hasher.finish() as usize % workers
}

/// Receive loop. Returns when shutdown is signalled or every worker is gone.
pub async fn run(
    socket: UdpSocket,
    queues: Vec<mpsc::Sender<Datagram>>,
    pool: Arc<BufferPool>,
    stats: Arc<Stats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut buf = pool.get();
        buf.resize(MAX_DATAGRAM, 0);

        let (len, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "UDP receive error");
                    pool.put(buf);
                    continue;
                }
            },
        };

        buf.truncate(len);
        stats.counters.note_packet_in(len);

        let shard = shard_for(peer.ip(), queues.len());
        match queues[shard].try_send(Datagram::new(buf, peer)) {
            Ok(()) => {
                stats.counters.in_flight.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(datagram)) => {
                // Ingress never blocks: a full worker queue drops the
                // incoming datagram.
                stats
                    .counters
                    .pkts_dropped_queue
                    .fetch_add(1, Ordering::Relaxed);
                pool.put(datagram.data);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("worker queues closed, stopping ingress");
                break;
            }
        }
    }

    info!("ingress stopped");
}
