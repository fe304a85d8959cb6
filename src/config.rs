use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration loaded from a YAML file or defaults.
///
/// Unknown keys anywhere in the document are rejected so that a typo in a
/// deployment file fails at startup instead of being silently ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Ports, buffers, log level.
    #[serde(default)]
    pub general: GeneralConfig,

    /// AS extraction and rewrite behaviour.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Downstream collectors.
    #[serde(default)]
    pub forwarding: ForwardingConfig,

    /// Worker count, queue bounds, stats cadence.
    #[serde(default)]
    pub performance: PerformanceConfig,
}

/// General section — sockets and logging.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// UDP port flow exporters send to.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Default egress port when a collector entry omits one.
    #[serde(default = "default_output_port")]
    pub output_port: u16,

    /// TCP port of the line-protocol statistics interface (loopback only).
    #[serde(default = "default_stats_port")]
    pub stats_port: u16,

    /// Requested SO_RCVBUF / SO_SNDBUF in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// DEBUG, INFO, WARNING or ERROR.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_port() -> u16 {
    2055
}

fn default_output_port() -> u16 {
    2056
}

fn default_stats_port() -> u16 {
    9999
}

fn default_buffer_size() -> usize {
    65535
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            output_port: default_output_port(),
            stats_port: default_stats_port(),
            buffer_size: default_buffer_size(),
            log_level: default_log_level(),
        }
    }
}

/// Enrichment section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichmentConfig {
    /// Extract AS numbers from decoded flow records.
    #[serde(default = "default_true")]
    pub as_extraction: bool,

    /// Rewrite zero AS fields in the forwarded bytes. Off by default:
    /// downstream collectors see the exact bytes the exporter sent.
    #[serde(default)]
    pub enrich_in_place: bool,

    /// AS number substituted for zero AS fields when an address matches
    /// one of `prefixes`.
    #[serde(default)]
    pub target_as: u32,

    /// CIDR prefixes (IPv4 and IPv6) owned by `target_as`.
    #[serde(default)]
    pub prefixes: Vec<String>,

    /// Budget for one collaborator lookup; slower lookups are skipped.
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,

    /// Toggle for an external GeoIP collaborator (none built in).
    #[serde(default)]
    pub geoip_enabled: bool,

    /// Toggle for an external reverse-DNS collaborator (none built in).
    #[serde(default)]
    pub reverse_dns: bool,
}

fn default_true() -> bool {
    true
}

fn default_lookup_timeout_ms() -> u64 {
    5
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            as_extraction: true,
            enrich_in_place: false,
            target_as: 0,
            prefixes: Vec::new(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            geoip_enabled: false,
            reverse_dns: false,
        }
    }
}

/// Forwarding section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardingConfig {
    /// Destinations, tried in order for every datagram.
    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,

    /// Drop egress datagrams larger than this instead of fragmenting.
    /// 0 disables the check.
    #[serde(default)]
    pub max_packet_size: usize,
}

/// One downstream collector.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    /// Hostname or IP address.
    pub host: String,

    /// UDP port; `general.output_port` when omitted.
    #[serde(default)]
    pub port: Option<u16>,
}

/// Performance section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceConfig {
    /// Decoder worker tasks. Exporters are sharded across workers by
    /// source IP, so per-exporter datagram order is preserved.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bound on each internal queue, in datagrams.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Seconds between periodic stats summaries in the log.
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,

    /// Seconds of exporter silence before its templates are evicted.
    #[serde(default = "default_template_idle_timeout")]
    pub template_idle_timeout: u64,
}

fn default_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    10_000
}

fn default_stats_interval() -> u64 {
    60
}

fn default_template_idle_timeout() -> u64 {
    1800
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_size: default_queue_size(),
            stats_interval: default_stats_interval(),
            template_idle_timeout: default_template_idle_timeout(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        let config: AppConfig =
            serde_yaml::from_str(&contents).with_context(|| format!("parsing {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.general.listen_port == 0 {
            bail!("general.listen_port must not be 0");
        }
        if self.general.stats_port == self.general.listen_port {
            bail!("general.stats_port must differ from general.listen_port");
        }
        match self.general.log_level.to_ascii_uppercase().as_str() {
            "DEBUG" | "INFO" | "WARNING" | "ERROR" => {}
            other => bail!("general.log_level: unknown level {other:?}"),
        }
        if self.performance.workers == 0 {
            bail!("performance.workers must be at least 1");
        }
        if self.performance.queue_size == 0 {
            bail!("performance.queue_size must be at least 1");
        }
        if self.forwarding.collectors.is_empty() {
            bail!("forwarding.collectors must list at least one destination");
        }
        for prefix in &self.enrichment.prefixes {
            crate::enrich::Prefix::parse(prefix)
                .with_context(|| format!("enrichment.prefixes: bad prefix {prefix:?}"))?;
        }
        Ok(())
    }

    /// The `tracing` filter directive derived from `general.log_level`.
    pub fn log_directive(&self) -> String {
        let level = match self.general.log_level.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" => "warn",
            "ERROR" => "error",
            _ => "info",
        };
        format!("flowrelay={level}")
    }

    /// Resolve every collector to a socket address, applying the default
    /// output port where none was given.
    pub fn collector_addrs(&self) -> Result<Vec<SocketAddr>> {
        let mut addrs = Vec::with_capacity(self.forwarding.collectors.len());
        for collector in &self.forwarding.collectors {
            let port = collector.port.unwrap_or(self.general.output_port);
            let target = format!("{}:{}", collector.host, port);
            let addr = target
                .to_socket_addrs()
                .with_context(|| format!("resolving collector {target}"))?
                .next()
                .with_context(|| format!("collector {target} resolved to no addresses"))?;
            addrs.push(addr);
        }
        Ok(addrs)
    }

    /// Key/value lines for the stats interface `config` command.
    pub fn describe(&self) -> Vec<(String, String)> {
        let mut out = vec![
            ("listen_port".into(), self.general.listen_port.to_string()),
            ("output_port".into(), self.general.output_port.to_string()),
            ("stats_port".into(), self.general.stats_port.to_string()),
            ("buffer_size".into(), self.general.buffer_size.to_string()),
            ("log_level".into(), self.general.log_level.clone()),
            (
                "as_extraction".into(),
                self.enrichment.as_extraction.to_string(),
            ),
            (
                "enrich_in_place".into(),
                self.enrichment.enrich_in_place.to_string(),
            ),
            ("target_as".into(), self.enrichment.target_as.to_string()),
            ("prefixes".into(), self.enrichment.prefixes.join(",")),
            (
                "lookup_timeout_ms".into(),
                self.enrichment.lookup_timeout_ms.to_string(),
            ),
            (
                "geoip_enabled".into(),
                self.enrichment.geoip_enabled.to_string(),
            ),
            (
                "reverse_dns".into(),
                self.enrichment.reverse_dns.to_string(),
            ),
            ("workers".into(), self.performance.workers.to_string()),
            (
                "queue_size".into(),
                self.performance.queue_size.to_string(),
            ),
            (
                "stats_interval".into(),
                self.performance.stats_interval.to_string(),
            ),
            (
                "template_idle_timeout".into(),
                self.performance.template_idle_timeout.to_string(),
            ),
            (
                "max_packet_size".into(),
                self.forwarding.max_packet_size.to_string(),
            ),
        ];
        for (i, collector) in self.forwarding.collectors.iter().enumerate() {
            let port = collector.port.unwrap_or(self.general.output_port);
            out.push((format!("collector.{i}"), format!("{}:{}", collector.host, port)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
forwarding:
  collectors:
    - host: 127.0.0.1
      port: 2056
"#
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(config.general.listen_port, 2055);
        assert_eq!(config.general.output_port, 2056);
        assert_eq!(config.general.stats_port, 9999);
        assert_eq!(config.general.buffer_size, 65535);
        assert_eq!(config.general.log_level, "INFO");
        assert!(config.enrichment.as_extraction);
        assert!(!config.enrichment.enrich_in_place);
        assert_eq!(config.performance.workers, 4);
        assert_eq!(config.performance.queue_size, 10_000);
        assert_eq!(config.performance.template_idle_timeout, 1800);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_key_rejected() {
        let yaml = r#"
general:
  listen_prot: 2055
"#;
        let err = serde_yaml::from_str::<AppConfig>(yaml);
        assert!(err.is_err(), "typoed key must be a parse error");
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
general:
  listen_port: 9996
  output_port: 9996
  stats_port: 9099
  buffer_size: 4194304
  log_level: DEBUG
enrichment:
  as_extraction: true
  enrich_in_place: true
  target_as: 202032
  prefixes:
    - 185.54.80.0/22
    - 2a02:4460::/32
forwarding:
  collectors:
    - host: 185.54.81.20
      port: 9996
    - host: 10.0.0.9
  max_packet_size: 1400
performance:
  workers: 8
  queue_size: 20000
  stats_interval: 30
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.general.listen_port, 9996);
        assert_eq!(config.enrichment.target_as, 202032);
        assert_eq!(config.enrichment.prefixes.len(), 2);
        assert_eq!(config.forwarding.collectors.len(), 2);
        assert_eq!(config.forwarding.max_packet_size, 1400);

        let addrs = config.collector_addrs().unwrap();
        assert_eq!(addrs[0].port(), 9996);
        // Second collector falls back to output_port.
        assert_eq!(addrs[1].port(), 9996);
    }

    #[test]
    fn test_validate_requires_collector() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config: AppConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.performance.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let mut config: AppConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.enrichment.prefixes = vec!["185.54.80.0/99".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config: AppConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.general.log_level = "TRACEY".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_directive() {
        let mut config: AppConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.general.log_level = "WARNING".to_string();
        assert_eq!(config.log_directive(), "flowrelay=warn");
    }
}
