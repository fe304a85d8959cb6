//! Egress: bounded drop-head queue and the forwarder task.
//!
//! The queue keeps the newest telemetry under pressure: when full, the
//! oldest queued datagram is discarded. The forwarder fans every datagram
//! out to all collectors; a failed send is counted per collector and the
//! fan-out continues. UDP semantics, no retries.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::packet::{BufferPool, Datagram};
use crate::stats::Stats;

/// Bounded queue between workers and the forwarder. Drop-head on overflow.
pub struct EgressQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    stats: Arc<Stats>,
    pool: Arc<BufferPool>,
}

struct QueueInner {
    items: VecDeque<Datagram>,
    closed: bool,
}

impl EgressQueue {
    pub fn new(capacity: usize, stats: Arc<Stats>, pool: Arc<BufferPool>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            stats,
            pool,
        }
    }

    /// Enqueue, discarding the oldest entry when full.
    pub fn push(&self, datagram: Datagram) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                self.stats
                    .counters
                    .pkts_dropped_queue
                    .fetch_add(1, Ordering::Relaxed);
                self.stats.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
                self.pool.put(datagram.data);
                return;
            }
            if inner.items.len() == self.capacity {
                if let Some(old) = inner.items.pop_front() {
                    self.stats
                        .counters
                        .pkts_dropped_queue
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
                    self.pool.put(old.data);
                }
            }
            inner.items.push_back(datagram);
        }
        self.notify.notify_one();
    }

    /// Dequeue the oldest entry; `None` once closed and drained.
    pub async fn pop(&self) -> Option<Datagram> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(datagram) = inner.items.pop_front() {
                    return Some(datagram);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// No more pushes; wake the forwarder so it can drain and exit.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns one egress socket per destination address family.
pub struct Forwarder {
    collectors: Vec<SocketAddr>,
    socket_v4: Option<UdpSocket>,
    socket_v6: Option<UdpSocket>,
    max_packet_size: usize,
    oversized_warned: std::sync::atomic::AtomicBool,
}

impl Forwarder {
    /// Bind the egress sockets the collector list requires.
    pub async fn bind(
        collectors: Vec<SocketAddr>,
        buffer_size: usize,
        max_packet_size: usize,
    ) -> Result<Self> {
        let mut socket_v4 = None;
        let mut socket_v6 = None;

        for addr in &collectors {
            match addr {
                SocketAddr::V4(_) if socket_v4.is_none() => {
                    let socket =
                        UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
                            .await
                            .context("binding IPv4 egress socket")?;
                    if let Err(err) = SockRef::from(&socket).set_send_buffer_size(buffer_size) {
                        warn!(%err, buffer_size, "could not set SO_SNDBUF");
                    }
                    socket_v4 = Some(socket);
                }
                SocketAddr::V6(_) if socket_v6.is_none() => {
                    let socket =
                        UdpSocket::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0))
                            .await
                            .context("binding IPv6 egress socket")?;
                    if let Err(err) = SockRef::from(&socket).set_send_buffer_size(buffer_size) {
                        warn!(%err, buffer_size, "could not set SO_SNDBUF");
                    }
                    socket_v6 = Some(socket);
                }
                _ => {}
            }
        }

        info!(collectors = collectors.len(), "forwarder ready");
        Ok(Self {
            collectors,
            socket_v4,
            socket_v6,
            max_packet_size,
            oversized_warned: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn socket_for(&self, addr: &SocketAddr) -> Option<&UdpSocket> {
        match addr {
            SocketAddr::V4(_) => self.socket_v4.as_ref(),
            SocketAddr::V6(_) => self.socket_v6.as_ref(),
        }
    }

    /// Send one datagram to every collector.
    async fn dispatch(&self, datagram: &Datagram, stats: &Stats) {
        if self.max_packet_size > 0 && datagram.data.len() > self.max_packet_size {
            stats
                .counters
                .pkts_dropped_oversized
                .fetch_add(1, Ordering::Relaxed);
            if !self.oversized_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    len = datagram.data.len(),
                    max = self.max_packet_size,
                    "dropping oversized datagrams to avoid fragmentation"
                );
            }
            return;
        }

        let mut sent = false;
        for addr in &self.collectors {
            let Some(socket) = self.socket_for(addr) else {
                continue;
            };
            match socket.send_to(&datagram.data, addr).await {
                Ok(len) => {
                    if !sent {
                        stats.counters.note_packet_out(len);
                        sent = true;
                    }
                }
                Err(err) => {
                    stats
                        .counters
                        .pkts_dropped_forward
                        .fetch_add(1, Ordering::Relaxed);
                    stats.record_error(format!("send to {addr} failed: {err}"));
                    warn!(collector = %addr, %err, "forward failed");
                }
            }
        }
    }

    /// Forwarder task: drain the egress queue until it closes.
    pub async fn run(self, queue: Arc<EgressQueue>, stats: Arc<Stats>, pool: Arc<BufferPool>) {
        while let Some(datagram) = queue.pop().await {
            self.dispatch(&datagram, &stats).await;
            stats.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
            pool.put(datagram.data);
        }
        info!("forwarder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> (Arc<EgressQueue>, Arc<Stats>) {
        let stats = Arc::new(Stats::new());
        let pool = Arc::new(BufferPool::new(4));
        (
            Arc::new(EgressQueue::new(capacity, stats.clone(), pool)),
            stats,
        )
    }

    fn datagram(tag: u8) -> Datagram {
        Datagram::new(vec![tag], "10.0.0.1:2055".parse().unwrap())
    }

    #[tokio::test]
    async fn test_queue_fifo() {
        let (queue, _) = queue(4);
        queue.push(datagram(1));
        queue.push(datagram(2));
        assert_eq!(queue.pop().await.unwrap().data, vec![1]);
        assert_eq!(queue.pop().await.unwrap().data, vec![2]);
    }

    #[tokio::test]
    async fn test_queue_drops_head_on_overflow() {
        let (queue, stats) = queue(2);
        queue.push(datagram(1));
        queue.push(datagram(2));
        queue.push(datagram(3));

        assert_eq!(
            stats.counters.pkts_dropped_queue.load(Ordering::Relaxed),
            1
        );
        // Oldest is gone; newer telemetry survives.
        assert_eq!(queue.pop().await.unwrap().data, vec![2]);
        assert_eq!(queue.pop().await.unwrap().data, vec![3]);
    }

    #[tokio::test]
    async fn test_queue_close_drains_then_ends() {
        let (queue, _) = queue(4);
        queue.push(datagram(1));
        queue.close();
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_queue_pop_wakes_on_push() {
        let (queue, _) = queue(4);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(datagram(9));
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.data, vec![9]);
    }

    #[tokio::test]
    async fn test_forwarder_fans_out_and_counts() {
        let receiver_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let collectors = vec![
            receiver_a.local_addr().unwrap(),
            receiver_b.local_addr().unwrap(),
        ];

        let forwarder = Forwarder::bind(collectors, 65535, 0).await.unwrap();
        let stats = Stats::new();
        forwarder
            .dispatch(&Datagram::new(vec![0xAA; 20], "10.0.0.1:9".parse().unwrap()), &stats)
            .await;

        let mut buf = [0u8; 64];
        let (len, _) = receiver_a.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 20);
        let (len, _) = receiver_b.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 20);

        // One datagram out, regardless of collector count.
        assert_eq!(stats.counters.pkts_out.load(Ordering::Relaxed), 1);
        assert_eq!(stats.counters.bytes_out.load(Ordering::Relaxed), 20);
    }

    #[tokio::test]
    async fn test_forwarder_oversized_drop() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let forwarder = Forwarder::bind(vec![receiver.local_addr().unwrap()], 65535, 100)
            .await
            .unwrap();
        let stats = Stats::new();

        forwarder
            .dispatch(&Datagram::new(vec![0; 200], "10.0.0.1:9".parse().unwrap()), &stats)
            .await;

        assert_eq!(
            stats.counters.pkts_dropped_oversized.load(Ordering::Relaxed),
            1
        );
        assert_eq!(stats.counters.pkts_out.load(Ordering::Relaxed), 0);
    }
}
