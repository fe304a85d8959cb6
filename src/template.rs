//! Per-exporter template cache.
//!
//! NetFlow v9 and IPFIX data records are not self-describing: a data set
//! can only be decoded after its template has been seen from the same
//! exporter and source ID. The cache maps `(exporter, template_id)` to the
//! template definition, sharded to keep worker contention low, bounded by a
//! global template cap (LRU on `received_at`) and by per-exporter idle
//! eviction driven from the janitor task.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::packet::ExporterKey;

/// Default bound on the total number of cached templates.
pub const DEFAULT_MAX_TEMPLATES: usize = 65_536;

const SHARD_COUNT: usize = 16;

/// IPFIX marker for a variable-length field.
pub const VARIABLE_LENGTH: u16 = 0xFFFF;

/// One field of a template definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub element_id: u16,
    pub length: u16,
    pub enterprise: Option<u32>,
}

impl Field {
    pub fn new(element_id: u16, length: u16) -> Self {
        Self {
            element_id,
            length,
            enterprise: None,
        }
    }

    pub fn is_variable_length(&self) -> bool {
        self.length == VARIABLE_LENGTH
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Data,
    Options,
}

/// An exporter's declaration of one data-record layout.
#[derive(Debug)]
pub struct Template {
    pub id: u16,
    pub kind: TemplateKind,
    /// Leading fields that are scope fields (options templates only).
    pub scope_field_count: u16,
    pub fields: Vec<Field>,
    pub received_at: Instant,
    /// Bumped every time the exporter redefines this id with a new layout.
    pub version: u32,
}

impl Template {
    pub fn new(id: u16, kind: TemplateKind, scope_field_count: u16, fields: Vec<Field>) -> Self {
        Self {
            id,
            kind,
            scope_field_count,
            fields,
            received_at: Instant::now(),
            version: 1,
        }
    }

    /// Smallest number of bytes one record of this template can occupy.
    /// A variable-length field contributes its 1-byte length prefix.
    pub fn min_record_len(&self) -> usize {
        self.fields
            .iter()
            .map(|f| {
                if f.is_variable_length() {
                    1
                } else {
                    f.length as usize
                }
            })
            .sum()
    }

    fn same_layout(&self, kind: TemplateKind, scope_field_count: u16, fields: &[Field]) -> bool {
        self.kind == kind && self.scope_field_count == scope_field_count && self.fields == fields
    }
}

/// Result of installing a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// First definition of this id from this exporter.
    New,
    /// Same layout re-announced; `received_at` refreshed.
    Refreshed,
    /// Layout changed; version bumped to the contained value.
    Redefined(u32),
}

/// A template listing entry for the stats interface.
#[derive(Debug, Clone)]
pub struct TemplateInfo {
    pub exporter: ExporterKey,
    pub template_id: u16,
    pub kind: TemplateKind,
    pub field_count: usize,
    pub age: Duration,
    pub version: u32,
}

struct ExporterEntry {
    templates: HashMap<u16, Arc<Template>>,
    last_seen: Instant,
}

impl ExporterEntry {
    fn new() -> Self {
        Self {
            templates: HashMap::new(),
            last_seen: Instant::now(),
        }
    }
}

type Shard = RwLock<HashMap<ExporterKey, ExporterEntry>>;

/// Sharded, bounded template store shared by all workers.
pub struct TemplateCache {
    shards: Vec<Shard>,
    total: AtomicUsize,
    max_templates: usize,
}

impl TemplateCache {
    pub fn new(max_templates: usize) -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        shards.resize_with(SHARD_COUNT, || RwLock::new(HashMap::new()));
        Self {
            shards,
            total: AtomicUsize::new(0),
            max_templates,
        }
    }

    fn shard(&self, key: &ExporterKey) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Look up a template. Read lock only.
    pub fn get(&self, key: &ExporterKey, template_id: u16) -> Option<Arc<Template>> {
        self.shard(key)
            .read()
            .get(key)
            .and_then(|entry| entry.templates.get(&template_id))
            .cloned()
    }

    /// Install or replace a template definition.
    pub fn put(
        &self,
        key: ExporterKey,
        id: u16,
        kind: TemplateKind,
        scope_field_count: u16,
        fields: Vec<Field>,
    ) -> PutOutcome {
        let outcome = {
            let mut shard = self.shard(&key).write();
            let entry = shard.entry(key).or_insert_with(ExporterEntry::new);
            entry.last_seen = Instant::now();

            let prior = entry
                .templates
                .get(&id)
                .map(|t| (t.same_layout(kind, scope_field_count, &fields), t.version));
            match prior {
                Some((true, version)) => {
                    let mut refreshed = Template::new(id, kind, scope_field_count, fields);
                    refreshed.version = version;
                    entry.templates.insert(id, Arc::new(refreshed));
                    PutOutcome::Refreshed
                }
                Some((false, version)) => {
                    let mut replacement = Template::new(id, kind, scope_field_count, fields);
                    replacement.version = version + 1;
                    let version = replacement.version;
                    entry.templates.insert(id, Arc::new(replacement));
                    PutOutcome::Redefined(version)
                }
                None => {
                    entry
                        .templates
                        .insert(id, Arc::new(Template::new(id, kind, scope_field_count, fields)));
                    self.total.fetch_add(1, Ordering::Relaxed);
                    PutOutcome::New
                }
            }
        };

        if outcome == PutOutcome::New && self.total.load(Ordering::Relaxed) > self.max_templates {
            self.evict_oldest();
        }

        outcome
    }

    /// Drop the globally oldest template (LRU by `received_at`).
    fn evict_oldest(&self) {
        let mut oldest: Option<(ExporterKey, u16, Instant)> = None;
        for shard in &self.shards {
            let shard = shard.read();
            for (key, entry) in shard.iter() {
                for (id, template) in &entry.templates {
                    let replace = match oldest {
                        Some((_, _, at)) => template.received_at < at,
                        None => true,
                    };
                    if replace {
                        oldest = Some((*key, *id, template.received_at));
                    }
                }
            }
        }

        if let Some((key, id, _)) = oldest {
            let mut shard = self.shard(&key).write();
            if let Some(entry) = shard.get_mut(&key) {
                if entry.templates.remove(&id).is_some() {
                    self.total.fetch_sub(1, Ordering::Relaxed);
                }
                if entry.templates.is_empty() {
                    shard.remove(&key);
                }
            }
        }
    }

    /// Evict exporters that have been silent longer than `idle_timeout`.
    /// Returns the number of templates removed.
    pub fn sweep(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.write();
            shard.retain(|_, entry| {
                if now.duration_since(entry.last_seen) > idle_timeout {
                    evicted += entry.templates.len();
                    false
                } else {
                    true
                }
            });
        }
        if evicted > 0 {
            self.total.fetch_sub(evicted, Ordering::Relaxed);
        }
        evicted
    }

    /// Mark an exporter as alive without touching its templates. Called for
    /// every datagram so data-only exporters are not swept while active.
    pub fn touch(&self, key: &ExporterKey) {
        if let Some(entry) = self.shard(key).write().get_mut(key) {
            entry.last_seen = Instant::now();
        }
    }

    /// Number of templates currently cached.
    pub fn len(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat listing for the stats interface, ordered by exporter then id.
    pub fn snapshot(&self) -> Vec<TemplateInfo> {
        let now = Instant::now();
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.read();
            for (key, entry) in shard.iter() {
                for template in entry.templates.values() {
                    out.push(TemplateInfo {
                        exporter: *key,
                        template_id: template.id,
                        kind: template.kind,
                        field_count: template.fields.len(),
                        age: now.saturating_duration_since(template.received_at),
                        version: template.version,
                    });
                }
            }
        }
        out.sort_by(|a, b| {
            (a.exporter.ip, a.exporter.source_id, a.template_id).cmp(&(
                b.exporter.ip,
                b.exporter.source_id,
                b.template_id,
            ))
        });
        out
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TEMPLATES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn exporter(ip: &str, source_id: u32) -> ExporterKey {
        ExporterKey::new(ip.parse::<IpAddr>().unwrap(), source_id)
    }

    fn fields(ids: &[(u16, u16)]) -> Vec<Field> {
        ids.iter().map(|&(id, len)| Field::new(id, len)).collect()
    }

    #[test]
    fn test_put_then_get() {
        let cache = TemplateCache::default();
        let key = exporter("10.0.0.1", 0);

        let outcome = cache.put(
            key,
            256,
            TemplateKind::Data,
            0,
            fields(&[(1, 8), (4, 1), (16, 4), (17, 4)]),
        );
        assert_eq!(outcome, PutOutcome::New);

        let template = cache.get(&key, 256).expect("template present");
        assert_eq!(template.fields.len(), 4);
        assert_eq!(template.version, 1);
        assert_eq!(template.min_record_len(), 17);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_missing_template() {
        let cache = TemplateCache::default();
        assert!(cache.get(&exporter("10.0.0.1", 0), 300).is_none());
    }

    #[test]
    fn test_source_ids_are_independent_namespaces() {
        let cache = TemplateCache::default();
        let a = exporter("10.0.0.1", 0);
        let b = exporter("10.0.0.1", 7);

        cache.put(a, 256, TemplateKind::Data, 0, fields(&[(1, 4)]));
        assert!(cache.get(&a, 256).is_some());
        assert!(cache.get(&b, 256).is_none());
    }

    #[test]
    fn test_redefinition_bumps_version() {
        let cache = TemplateCache::default();
        let key = exporter("10.0.0.1", 0);

        cache.put(key, 256, TemplateKind::Data, 0, fields(&[(1, 8), (16, 4)]));
        let outcome = cache.put(key, 256, TemplateKind::Data, 0, fields(&[(1, 4), (16, 2)]));
        assert_eq!(outcome, PutOutcome::Redefined(2));

        let template = cache.get(&key, 256).unwrap();
        assert_eq!(template.version, 2);
        assert_eq!(template.fields[0].length, 4);
        // Replacement is not a new template for the cap accounting.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reannounce_same_layout_keeps_version() {
        let cache = TemplateCache::default();
        let key = exporter("10.0.0.1", 0);
        let layout = fields(&[(1, 8), (16, 4)]);

        cache.put(key, 256, TemplateKind::Data, 0, layout.clone());
        let outcome = cache.put(key, 256, TemplateKind::Data, 0, layout);
        assert_eq!(outcome, PutOutcome::Refreshed);
        assert_eq!(cache.get(&key, 256).unwrap().version, 1);
    }

    #[test]
    fn test_sweep_evicts_idle_exporters() {
        let cache = TemplateCache::default();
        let key = exporter("10.0.0.1", 0);
        cache.put(key, 256, TemplateKind::Data, 0, fields(&[(1, 4)]));

        // Nothing is older than a generous timeout.
        assert_eq!(cache.sweep(Duration::from_secs(3600)), 0);
        assert_eq!(cache.len(), 1);

        // A zero timeout ages everything out.
        assert_eq!(cache.sweep(Duration::ZERO), 1);
        assert_eq!(cache.len(), 0);
        assert!(cache.get(&key, 256).is_none());
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let cache = TemplateCache::new(4);
        for i in 0..6u16 {
            let key = exporter("10.0.0.1", 0);
            cache.put(key, 256 + i, TemplateKind::Data, 0, fields(&[(1, 4)]));
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(cache.len() <= 4);
        // The first-installed ids are the ones evicted.
        let key = exporter("10.0.0.1", 0);
        assert!(cache.get(&key, 256).is_none());
        assert!(cache.get(&key, 261).is_some());
    }

    #[test]
    fn test_options_template_kind() {
        let cache = TemplateCache::default();
        let key = exporter("192.0.2.9", 3);
        cache.put(key, 512, TemplateKind::Options, 1, fields(&[(10, 4), (2, 8)]));

        let template = cache.get(&key, 512).unwrap();
        assert_eq!(template.kind, TemplateKind::Options);
        assert_eq!(template.scope_field_count, 1);
    }

    #[test]
    fn test_snapshot_sorted() {
        let cache = TemplateCache::default();
        cache.put(exporter("10.0.0.2", 0), 300, TemplateKind::Data, 0, fields(&[(1, 4)]));
        cache.put(exporter("10.0.0.1", 0), 257, TemplateKind::Data, 0, fields(&[(1, 4)]));
        cache.put(exporter("10.0.0.1", 0), 256, TemplateKind::Data, 0, fields(&[(1, 4)]));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].template_id, 256);
        assert_eq!(snapshot[1].template_id, 257);
        assert_eq!(snapshot[2].exporter.ip, "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_min_record_len_variable_field() {
        let template = Template::new(
            256,
            TemplateKind::Data,
            0,
            vec![Field::new(1, 4), Field::new(95, VARIABLE_LENGTH)],
        );
        assert_eq!(template.min_record_len(), 5);
    }
}
