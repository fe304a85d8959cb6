//! AS extraction and enrichment.
//!
//! The extractor reads src/dst AS numbers (IE 16/17) out of decoded flow
//! records and feeds the top-AS sketch. When a record carries a zero or
//! missing AS and extraction is enabled, an `AsLookup` collaborator is
//! queried with the record's addresses under a small time budget; a hit
//! fills the decoded view and — only with `enrich_in_place` — is written
//! back into the wire bytes, provided the field is wide enough for a
//! 32-bit AS. Headers and sequence numbers are never touched.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::config::EnrichmentConfig;
use crate::decode::{FlowRecord, IE_DST_AS, IE_SRC_AS};
use crate::stats::{Direction, Stats};

/// ISO 3166-1 alpha-2 country code returned by a GeoIP collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountryCode(pub [u8; 2]);

/// Maps an address to an AS number. The built-in implementation is
/// [`PrefixAsLookup`]; BGP- or MaxMind-backed implementations plug in here.
#[async_trait]
pub trait AsLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Option<u32>;
}

/// Maps an address to a country code. No implementation ships with the
/// relay; the `enrichment.geoip_enabled` toggle is honoured only when a
/// collaborator is supplied by the embedding binary.
#[async_trait]
pub trait GeoIpLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Option<CountryCode>;
}

/// Maps an address to a reverse-DNS name. Same contract as [`GeoIpLookup`].
#[async_trait]
pub trait RdnsLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Option<String>;
}

/// One parsed CIDR prefix, IPv4 or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    network: IpAddr,
    len: u8,
}

impl Prefix {
    /// Parse `"185.54.80.0/22"` or `"2a02:4460::/32"`.
    pub fn parse(s: &str) -> Result<Self> {
        let Some((addr, len)) = s.split_once('/') else {
            bail!("missing /length in {s:?}");
        };
        let network: IpAddr = addr.trim().parse()?;
        let len: u8 = len.trim().parse()?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if len > max {
            bail!("prefix length {len} exceeds {max} for {addr}");
        }
        Ok(Self { network, len })
    }

    /// True when `ip` falls inside this prefix. Families never match
    /// across (no v4-mapped coercion).
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = u32::from(net) ^ u32::from(ip);
                self.len == 0 || bits >> (32 - self.len) == 0
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = u128::from(net) ^ u128::from(ip);
                self.len == 0 || bits >> (128 - self.len) == 0
            }
            _ => false,
        }
    }
}

/// The built-in lookup: addresses inside the configured prefixes belong to
/// the operator's own AS.
pub struct PrefixAsLookup {
    prefixes: Vec<Prefix>,
    target_as: u32,
}

impl PrefixAsLookup {
    pub fn new(prefixes: Vec<Prefix>, target_as: u32) -> Self {
        Self {
            prefixes,
            target_as,
        }
    }
}

#[async_trait]
impl AsLookup for PrefixAsLookup {
    async fn lookup(&self, ip: IpAddr) -> Option<u32> {
        if self.target_as == 0 {
            return None;
        }
        self.prefixes
            .iter()
            .any(|p| p.contains(ip))
            .then_some(self.target_as)
    }
}

/// AS numbers of one record after extraction and enrichment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordAs {
    pub src: Option<u32>,
    pub dst: Option<u32>,
    /// True when a lookup filled in at least one zero field.
    pub enriched: bool,
}

/// Extracts and optionally rewrites AS fields of decoded records.
pub struct Enricher {
    enabled: bool,
    in_place: bool,
    lookup: Option<Arc<dyn AsLookup>>,
    lookup_timeout: Duration,
}

impl Enricher {
    pub fn from_config(config: &EnrichmentConfig) -> Result<Self> {
        let lookup: Option<Arc<dyn AsLookup>> = if config.prefixes.is_empty() {
            None
        } else {
            let prefixes = config
                .prefixes
                .iter()
                .map(|p| Prefix::parse(p))
                .collect::<Result<Vec<_>>>()?;
            Some(Arc::new(PrefixAsLookup::new(prefixes, config.target_as)))
        };
        Ok(Self {
            enabled: config.as_extraction,
            in_place: config.enrich_in_place,
            lookup,
            lookup_timeout: Duration::from_millis(config.lookup_timeout_ms),
        })
    }

    /// Replace the lookup collaborator (tests, embedding binaries).
    pub fn with_lookup(mut self, lookup: Arc<dyn AsLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Process one record: extract AS numbers, consult the lookup for
    /// zero/missing ones, update counters and the sketch, and rewrite the
    /// wire bytes when configured. `data` is the whole datagram.
    pub async fn process(&self, record: &FlowRecord, data: &mut [u8], stats: &Stats) -> RecordAs {
        if !self.enabled {
            return RecordAs::default();
        }

        let mut result = RecordAs {
            src: record.src_as(data).filter(|&asn| asn != 0),
            dst: record.dst_as(data).filter(|&asn| asn != 0),
            enriched: false,
        };

        if result.src.is_none() {
            if let Some(asn) = self.lookup_as(record.src_ip(data)).await {
                result.src = Some(asn);
                result.enriched = true;
                self.rewrite(record, data, IE_SRC_AS, asn);
            }
        }
        if result.dst.is_none() {
            if let Some(asn) = self.lookup_as(record.dst_ip(data)).await {
                result.dst = Some(asn);
                result.enriched = true;
                self.rewrite(record, data, IE_DST_AS, asn);
            }
        }

        if let Some(asn) = result.src {
            stats.top_as.observe(Direction::Src, asn);
        }
        if let Some(asn) = result.dst {
            stats.top_as.observe(Direction::Dst, asn);
        }
        if result.src.is_some() && result.dst.is_some() {
            stats
                .counters
                .records_with_as
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        if result.enriched {
            stats
                .counters
                .records_enriched
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        result
    }

    async fn lookup_as(&self, ip: Option<IpAddr>) -> Option<u32> {
        let lookup = self.lookup.as_ref()?;
        let ip = ip?;
        match tokio::time::timeout(self.lookup_timeout, lookup.lookup(ip)).await {
            Ok(result) => result.filter(|&asn| asn != 0),
            Err(_) => {
                debug!(%ip, "AS lookup exceeded budget, skipped");
                None
            }
        }
    }

    /// Overwrite the AS field bytes when in-place enrichment is on and the
    /// declared field can hold a 32-bit AS.
    fn rewrite(&self, record: &FlowRecord, data: &mut [u8], element_id: u16, asn: u32) {
        if !self.in_place {
            return;
        }
        if let Some(range) = record.field_range(element_id) {
            if range.len() == 4 {
                data[range].copy_from_slice(&asn.to_be_bytes());
            }
        }
    }
}
