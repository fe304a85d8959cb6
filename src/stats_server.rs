//! Line-protocol statistics interface.
//!
//! TCP on loopback only; one case-insensitive command per line, every
//! response terminated by a blank line. Connections are stateless and
//! closed after 60 seconds of silence. Binding to loopback is the whole
//! security model, so no authentication.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::stats::{Direction, Stats};
use crate::template::{TemplateCache, TemplateKind};

/// Longest accepted command line, terminator included.
const MAX_LINE: usize = 256;

/// Close connections idle longer than this.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared read-only view the command handlers render from.
pub struct StatsContext {
    pub stats: Arc<Stats>,
    pub cache: Arc<TemplateCache>,
    pub config: AppConfig,
}

/// Bind the stats listener on loopback.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding TCP {addr}"))?;
    info!(port, "stats interface listening");
    Ok(listener)
}

/// Accept loop. Runs until the task is aborted at shutdown.
pub async fn run(listener: TcpListener, ctx: Arc<StatsContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "stats client connected");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, ctx).await {
                        debug!(%peer, %err, "stats client error");
                    }
                });
            }
            Err(err) => {
                warn!(%err, "stats accept failed");
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, ctx: Arc<StatsContext>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    // The take cap bounds what one command line may read into memory; it is
    // reset for every line.
    let mut reader = BufReader::new(reader).take(0);
    let mut line = String::new();

    loop {
        line.clear();
        reader.set_limit(MAX_LINE as u64);
        let read = match tokio::time::timeout(IDLE_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("closing idle stats connection");
                return Ok(());
            }
        };
        if read == 0 {
            return Ok(()); // client closed
        }

        if !line.ends_with('\n') && reader.limit() == 0 {
            // The cap cut the line short mid-stream; drop the client rather
            // than misparse the tail of an over-long line as commands.
            writer.write_all(b"ERR line too long\n\n").await?;
            return Ok(());
        }

        let command = line.trim().to_ascii_lowercase();
        match render_command(&command, &ctx) {
            Some(response) => {
                writer.write_all(response.as_bytes()).await?;
                writer.write_all(b"\n").await?; // blank line terminator
            }
            None => return Ok(()), // quit
        }
    }
}

/// Render one command. `None` means the connection should close.
fn render_command(command: &str, ctx: &StatsContext) -> Option<String> {
    let response = match command {
        "stats" => render_stats(ctx),
        "as_stats" => render_as_stats(ctx),
        "templates" => render_templates(ctx),
        "errors" => render_errors(ctx),
        "config" => render_config(ctx),
        "help" => {
            "commands: stats as_stats templates errors config help quit\n".to_string()
        }
        "quit" => return None,
        _ => "ERR unknown command\n".to_string(),
    };
    Some(response)
}

fn render_stats(ctx: &StatsContext) -> String {
    let c = &ctx.stats.counters;
    let rates = ctx.stats.rates();
    let mut out = String::with_capacity(512);
    let mut line = |key: &str, value: String| {
        out.push_str(key);
        out.push(' ');
        out.push_str(&value);
        out.push('\n');
    };

    line("uptime_s", ctx.stats.uptime().as_secs().to_string());
    line(
        "started_at",
        ctx.stats.started_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    );
    line("pkts_in", c.pkts_in.load(Ordering::Relaxed).to_string());
    line("bytes_in", c.bytes_in.load(Ordering::Relaxed).to_string());
    line("pkts_out", c.pkts_out.load(Ordering::Relaxed).to_string());
    line("bytes_out", c.bytes_out.load(Ordering::Relaxed).to_string());
    line(
        "pkts_dropped_queue",
        c.pkts_dropped_queue.load(Ordering::Relaxed).to_string(),
    );
    line(
        "pkts_dropped_decode",
        c.pkts_dropped_decode.load(Ordering::Relaxed).to_string(),
    );
    line(
        "pkts_dropped_orphan_template",
        c.pkts_dropped_orphan_template
            .load(Ordering::Relaxed)
            .to_string(),
    );
    line(
        "pkts_dropped_forward",
        c.pkts_dropped_forward.load(Ordering::Relaxed).to_string(),
    );
    line(
        "pkts_dropped_oversized",
        c.pkts_dropped_oversized.load(Ordering::Relaxed).to_string(),
    );
    line(
        "templates_seen",
        c.templates_seen.load(Ordering::Relaxed).to_string(),
    );
    line("templates_current", ctx.cache.len().to_string());
    line(
        "records_decoded",
        c.records_decoded.load(Ordering::Relaxed).to_string(),
    );
    line(
        "records_with_as",
        c.records_with_as.load(Ordering::Relaxed).to_string(),
    );
    line(
        "records_enriched",
        c.records_enriched.load(Ordering::Relaxed).to_string(),
    );
    line(
        "max_packet_seen",
        c.max_packet_seen.load(Ordering::Relaxed).to_string(),
    );
    line("queued", c.in_flight.load(Ordering::Relaxed).to_string());
    line("rate_in_pps", format!("{:.1}", rates.in_pps));
    line("rate_out_pps", format!("{:.1}", rates.out_pps));
    out
}

fn render_as_stats(ctx: &StatsContext) -> String {
    let mut out = String::new();
    for direction in [Direction::Src, Direction::Dst] {
        for (asn, count) in ctx.stats.top_as.top(direction) {
            out.push_str(&format!("{} AS{} {}\n", direction.label(), asn, count));
        }
    }
    out
}

fn render_templates(ctx: &StatsContext) -> String {
    let mut out = String::new();
    for info in ctx.cache.snapshot() {
        let kind = match info.kind {
            TemplateKind::Data => "data",
            TemplateKind::Options => "options",
        };
        out.push_str(&format!(
            "{} {} {} fields={} age={}s version={} kind={}\n",
            info.exporter.ip,
            info.exporter.source_id,
            info.template_id,
            info.field_count,
            info.age.as_secs(),
            info.version,
            kind,
        ));
    }
    out
}

fn render_errors(ctx: &StatsContext) -> String {
    let mut out = String::new();
    for event in ctx.stats.recent_errors() {
        out.push_str(&format!(
            "{} {}\n",
            event.at.format("%Y-%m-%dT%H:%M:%SZ"),
            event.message
        ));
    }
    out
}

fn render_config(ctx: &StatsContext) -> String {
    let mut out = String::new();
    for (key, value) in ctx.config.describe() {
        out.push_str(&format!("{key} {value}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ExporterKey;
    use crate::template::Field;
    use tokio::io::AsyncReadExt;

    fn context() -> Arc<StatsContext> {
        let stats = Arc::new(Stats::new());
        let cache = Arc::new(TemplateCache::default());
        Arc::new(StatsContext {
            stats,
            cache,
            config: AppConfig::default(),
        })
    }

    #[test]
    fn test_stats_response_has_all_counters() {
        let ctx = context();
        ctx.stats.counters.note_packet_in(100);
        let out = render_stats(&ctx);
        for key in [
            "uptime_s",
            "pkts_in 1",
            "bytes_in 100",
            "pkts_out 0",
            "pkts_dropped_queue",
            "pkts_dropped_decode",
            "pkts_dropped_orphan_template",
            "pkts_dropped_forward",
            "records_decoded",
            "records_with_as",
            "rate_in_pps",
            "rate_out_pps",
        ] {
            assert!(out.contains(key), "missing {key:?} in {out}");
        }
    }

    #[test]
    fn test_as_stats_sorted_per_direction() {
        let ctx = context();
        for _ in 0..5 {
            ctx.stats.top_as.observe(Direction::Src, 15169);
        }
        ctx.stats.top_as.observe(Direction::Src, 13335);
        ctx.stats.top_as.observe(Direction::Dst, 64512);

        let out = render_as_stats(&ctx);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "src AS15169 5");
        assert_eq!(lines[1], "src AS13335 1");
        assert_eq!(lines[2], "dst AS64512 1");
    }

    #[test]
    fn test_templates_listing() {
        let ctx = context();
        let key = ExporterKey::new("10.0.0.1".parse().unwrap(), 3);
        ctx.cache.put(
            key,
            256,
            TemplateKind::Data,
            0,
            vec![Field::new(1, 8), Field::new(16, 4)],
        );

        let out = render_templates(&ctx);
        assert!(out.starts_with("10.0.0.1 3 256 fields=2 age="));
        assert!(out.contains("version=1"));
        assert!(out.contains("kind=data"));
    }

    #[test]
    fn test_errors_newest_first() {
        let ctx = context();
        ctx.stats.record_error("first");
        ctx.stats.record_error("second");
        let out = render_errors(&ctx);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].ends_with("second"));
        assert!(lines[1].ends_with("first"));
    }

    #[test]
    fn test_unknown_command() {
        let ctx = context();
        let out = render_command("flush", &ctx).unwrap();
        assert_eq!(out, "ERR unknown command\n");
    }

    #[test]
    fn test_commands_case_insensitive_after_normalization() {
        let ctx = context();
        // handle_connection lowercases before dispatch; dispatch sees
        // normalized names only.
        assert!(render_command("help", &ctx).unwrap().contains("quit"));
        assert!(render_command("quit", &ctx).is_none());
    }

    #[tokio::test]
    async fn test_socket_stats_and_quit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = context();
        tokio::spawn(run(listener, ctx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"STATS\r\n").await.unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = client.read(&mut buf).await.unwrap();
            response.extend_from_slice(&buf[..n]);
            if response.ends_with(b"\n\n") {
                break;
            }
        }
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("pkts_in 0"));

        client.write_all(b"quit\n").await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "server closes after quit");
    }

    #[tokio::test]
    async fn test_socket_overlong_line_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run(listener, context()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        // No newline within the 256-byte cap.
        client.write_all(&[b'a'; 300]).await.unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .expect("server neither replied nor closed")
                .unwrap();
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if response.ends_with(b"\n\n") {
                break;
            }
        }
        let text = String::from_utf8(response).unwrap();
        assert_eq!(text, "ERR line too long\n\n");

        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "server drops over-long clients");
    }
}
