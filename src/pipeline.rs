//! Pipeline wiring: worker tasks, the janitor and shutdown sequencing.
//!
//! Task graph: one ingress reader fans datagrams out to shard-affined
//! workers over bounded queues; workers decode, enrich and push to the
//! egress queue; one forwarder drains it. The janitor ticks the EWMA
//! rates, sweeps idle templates and logs a periodic summary.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::decode;
use crate::enrich::Enricher;
use crate::forward::{EgressQueue, Forwarder};
use crate::ingress;
use crate::packet::{BufferPool, Datagram, ExporterKey};
use crate::stats::{LogGate, Stats};
use crate::template::TemplateCache;

/// Interval between template cache sweeps.
const SWEEP_INTERVAL_SECS: u64 = 60;

/// A running relay pipeline.
pub struct Pipeline {
    shutdown_tx: watch::Sender<bool>,
    ingress_handle: JoinHandle<()>,
    worker_handles: Vec<JoinHandle<()>>,
    forwarder_handle: JoinHandle<()>,
    janitor_handle: JoinHandle<()>,
    egress: Arc<EgressQueue>,
    stats: Arc<Stats>,
}

impl Pipeline {
    /// Spawn every pipeline task. The sockets must already be bound so
    /// bind failures surface before anything is running.
    pub fn start(
        config: &AppConfig,
        stats: Arc<Stats>,
        cache: Arc<TemplateCache>,
        enricher: Arc<Enricher>,
        ingress_socket: UdpSocket,
        forwarder: Forwarder,
    ) -> Self {
        let workers = config.performance.workers;
        let queue_size = config.performance.queue_size;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pool = Arc::new(BufferPool::new(queue_size + workers + 1));
        let egress = Arc::new(EgressQueue::new(queue_size, stats.clone(), pool.clone()));
        let orphan_gate = Arc::new(LogGate::new(Duration::from_secs(60)));
        let decode_gate = Arc::new(LogGate::new(Duration::from_secs(60)));

        let mut queues = Vec::with_capacity(workers);
        let mut worker_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel(queue_size);
            queues.push(tx);
            worker_handles.push(tokio::spawn(worker_loop(
                worker_id,
                rx,
                cache.clone(),
                enricher.clone(),
                stats.clone(),
                egress.clone(),
                orphan_gate.clone(),
                decode_gate.clone(),
            )));
        }

        let ingress_handle = tokio::spawn(ingress::run(
            ingress_socket,
            queues,
            pool.clone(),
            stats.clone(),
            shutdown_rx.clone(),
        ));

        let forwarder_handle =
            tokio::spawn(forwarder.run(egress.clone(), stats.clone(), pool));

        let janitor_handle = tokio::spawn(janitor_loop(
            cache,
            stats.clone(),
            Duration::from_secs(config.performance.template_idle_timeout),
            config.performance.stats_interval,
            shutdown_rx,
        ));

        info!(workers, queue_size, "pipeline started");

        Self {
            shutdown_tx,
            ingress_handle,
            worker_handles,
            forwarder_handle,
            janitor_handle,
            egress,
            stats,
        }
    }

    /// Graceful stop: halt ingress, drain queues, then close. Items still
    /// queued when `deadline` expires are dropped and counted.
    pub async fn shutdown(self, deadline: Duration) {
        info!("shutting down, draining queues");
        let _ = self.shutdown_tx.send(true);

        let abort_handles: Vec<_> = self
            .worker_handles
            .iter()
            .map(|h| h.abort_handle())
            .chain([self.forwarder_handle.abort_handle()])
            .collect();

        let egress = self.egress.clone();
        let drain = async move {
            let _ = self.ingress_handle.await;
            // Ingress dropped its queue senders; workers drain and exit.
            for handle in self.worker_handles {
                let _ = handle.await;
            }
            egress.close();
            let _ = self.forwarder_handle.await;
        };

        if tokio::time::timeout(deadline, drain).await.is_err() {
            let leftover = self.stats.counters.in_flight.swap(0, Ordering::Relaxed);
            warn!(leftover, "shutdown deadline exceeded, dropping queued datagrams");
            self.stats
                .counters
                .pkts_dropped_queue
                .fetch_add(leftover, Ordering::Relaxed);
            for handle in abort_handles {
                handle.abort();
            }
        }

        self.janitor_handle.abort();
        info!("pipeline stopped");
    }
}

/// Decode, enrich, forward. One task per exporter shard.
#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<Datagram>,
    cache: Arc<TemplateCache>,
    enricher: Arc<Enricher>,
    stats: Arc<Stats>,
    egress: Arc<EgressQueue>,
    orphan_gate: Arc<LogGate>,
    decode_gate: Arc<LogGate>,
) {
    while let Some(mut datagram) = rx.recv().await {
        let peer_ip = datagram.peer.ip();
        match decode::decode_datagram(&datagram.data, peer_ip, &cache) {
            Ok(decoded) => {
                if decoded.templates_installed > 0 {
                    stats
                        .counters
                        .templates_seen
                        .fetch_add(u64::from(decoded.templates_installed), Ordering::Relaxed);
                }
                cache.touch(&ExporterKey::new(peer_ip, decoded.source_id));

                if decoded.orphan_sets > 0 {
                    stats
                        .counters
                        .pkts_dropped_orphan_template
                        .fetch_add(u64::from(decoded.orphan_sets), Ordering::Relaxed);
                    if orphan_gate.allow(peer_ip) {
                        warn!(
                            exporter = %peer_ip,
                            source_id = decoded.source_id,
                            sets = decoded.orphan_sets,
                            "data set for unknown template, waiting for refresh"
                        );
                        stats.record_error(format!(
                            "orphan data set from {peer_ip}/{}",
                            decoded.source_id
                        ));
                    }
                }

                stats
                    .counters
                    .records_decoded
                    .fetch_add(decoded.records.len() as u64, Ordering::Relaxed);
                for record in &decoded.records {
                    enricher.process(record, &mut datagram.data, &stats).await;
                }
            }
            Err(err) => {
                // The datagram is opaque to us but still gets forwarded.
                stats
                    .counters
                    .pkts_dropped_decode
                    .fetch_add(1, Ordering::Relaxed);
                if decode_gate.allow(peer_ip) {
                    debug!(exporter = %peer_ip, %err, "undecodable datagram");
                    stats.record_error(format!("decode from {peer_ip}: {err}"));
                }
            }
        }

        egress.push(datagram);
    }

    debug!(worker_id, "worker stopped");
}

/// Once-a-second housekeeping: rates, gauges, sweeps, summary logging.
async fn janitor_loop(
    cache: Arc<TemplateCache>,
    stats: Arc<Stats>,
    idle_timeout: Duration,
    stats_interval: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.tick().await; // immediate first tick
    let mut seconds = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }
        seconds += 1;

        stats.tick_rates();

        if seconds % SWEEP_INTERVAL_SECS == 0 {
            let evicted = cache.sweep(idle_timeout);
            if evicted > 0 {
                info!(evicted, "swept idle exporter templates");
            }
        }

        if stats_interval > 0 && seconds % stats_interval == 0 {
            let rates = stats.rates();
            info!(
                pkts_in = stats.counters.pkts_in.load(Ordering::Relaxed),
                pkts_out = stats.counters.pkts_out.load(Ordering::Relaxed),
                dropped_queue = stats.counters.pkts_dropped_queue.load(Ordering::Relaxed),
                dropped_decode = stats.counters.pkts_dropped_decode.load(Ordering::Relaxed),
                records = stats.counters.records_decoded.load(Ordering::Relaxed),
                with_as = stats.counters.records_with_as.load(Ordering::Relaxed),
                in_pps = format_args!("{:.1}", rates.in_pps),
                out_pps = format_args!("{:.1}", rates.out_pps),
                "relay stats"
            );
        }
    }
}
