//! NetFlow v9 / IPFIX datagram decoder.
//!
//! Both dialects share the same inner frame: a header followed by a
//! sequence of sets, each introduced by a 4-byte `(set_id, set_length)`
//! header. Template sets install layouts into the shared cache; data sets
//! are decoded against previously installed templates. Decoded records
//! reference the datagram by byte range so the enricher can rewrite fields
//! in place without copying.
//!
//! Decode failures are values, never panics: a malformed datagram stops
//! decoding but is still forwarded by the pipeline.

mod ipfix;
mod v9;

use std::net::IpAddr;
use std::ops::Range;

use tracing::debug;

use crate::packet::ExporterKey;
use crate::template::{Field, PutOutcome, TemplateCache, TemplateKind};

// Information element ids the extractor cares about (RFC 7012 / Cisco v9).
pub const IE_OCTET_DELTA_COUNT: u16 = 1;
pub const IE_PACKET_DELTA_COUNT: u16 = 2;
pub const IE_PROTOCOL_IDENTIFIER: u16 = 4;
pub const IE_SOURCE_IPV4: u16 = 8;
pub const IE_INGRESS_INTERFACE: u16 = 10;
pub const IE_DESTINATION_IPV4: u16 = 12;
pub const IE_EGRESS_INTERFACE: u16 = 14;
pub const IE_SRC_AS: u16 = 16;
pub const IE_DST_AS: u16 = 17;
pub const IE_SOURCE_IPV6: u16 = 27;
pub const IE_DESTINATION_IPV6: u16 = 28;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported version {0}")]
    BadVersion(u16),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("IPFIX length field {header} != datagram length {datagram}")]
    LengthMismatch { header: usize, datagram: usize },

    #[error("set {set_id}: bad length {length}")]
    BadSetLength { set_id: u16, length: usize },

    #[error("template {0}: no fields")]
    EmptyTemplate(u16),

    #[error("template {0}: id below 256")]
    ReservedTemplateId(u16),

    #[error("options template {id}: scope count {scope} exceeds field count {fields}")]
    BadScopeCount { id: u16, scope: u16, fields: u16 },
}

/// One decoded field: which element it is and where its value bytes live
/// in the datagram.
#[derive(Debug, Clone)]
pub struct FlowField {
    pub element_id: u16,
    pub range: Range<usize>,
}

/// One decoded data record. Values stay in the datagram buffer; accessors
/// read them on demand.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub template_id: u16,
    pub fields: Vec<FlowField>,
}

impl FlowRecord {
    /// Byte range of the first occurrence of `element_id`.
    pub fn field_range(&self, element_id: u16) -> Option<Range<usize>> {
        self.fields
            .iter()
            .find(|f| f.element_id == element_id)
            .map(|f| f.range.clone())
    }

    /// Big-endian unsigned read of a field up to 8 bytes wide.
    pub fn read_uint(&self, data: &[u8], element_id: u16) -> Option<u64> {
        let range = self.field_range(element_id)?;
        let bytes = data.get(range)?;
        if bytes.is_empty() || bytes.len() > 8 {
            return None;
        }
        let mut value = 0u64;
        for &b in bytes {
            value = value << 8 | u64::from(b);
        }
        Some(value)
    }

    /// Source AS (IE 16), zero-extended from 2- or 4-byte encodings.
    pub fn src_as(&self, data: &[u8]) -> Option<u32> {
        self.read_as(data, IE_SRC_AS)
    }

    /// Destination AS (IE 17).
    pub fn dst_as(&self, data: &[u8]) -> Option<u32> {
        self.read_as(data, IE_DST_AS)
    }

    fn read_as(&self, data: &[u8], element_id: u16) -> Option<u32> {
        let range = self.field_range(element_id)?;
        let width = range.len();
        if width != 2 && width != 4 {
            return None;
        }
        self.read_uint(data, element_id).map(|v| v as u32)
    }

    /// Source address: IPv4 (IE 8) preferred, IPv6 (IE 27) otherwise.
    pub fn src_ip(&self, data: &[u8]) -> Option<IpAddr> {
        self.read_ip(data, IE_SOURCE_IPV4, IE_SOURCE_IPV6)
    }

    /// Destination address: IPv4 (IE 12) preferred, IPv6 (IE 28) otherwise.
    pub fn dst_ip(&self, data: &[u8]) -> Option<IpAddr> {
        self.read_ip(data, IE_DESTINATION_IPV4, IE_DESTINATION_IPV6)
    }

    fn read_ip(&self, data: &[u8], v4_element: u16, v6_element: u16) -> Option<IpAddr> {
        if let Some(range) = self.field_range(v4_element) {
            let bytes = data.get(range)?;
            if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
                return Some(IpAddr::from(octets));
            }
        }
        if let Some(range) = self.field_range(v6_element) {
            let bytes = data.get(range)?;
            if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
                return Some(IpAddr::from(octets));
            }
        }
        None
    }

    pub fn protocol(&self, data: &[u8]) -> Option<u8> {
        self.read_uint(data, IE_PROTOCOL_IDENTIFIER).map(|v| v as u8)
    }

    pub fn octets(&self, data: &[u8]) -> Option<u64> {
        self.read_uint(data, IE_OCTET_DELTA_COUNT)
    }

    pub fn packets(&self, data: &[u8]) -> Option<u64> {
        self.read_uint(data, IE_PACKET_DELTA_COUNT)
    }

    pub fn ingress_interface(&self, data: &[u8]) -> Option<u32> {
        self.read_uint(data, IE_INGRESS_INTERFACE).map(|v| v as u32)
    }

    pub fn egress_interface(&self, data: &[u8]) -> Option<u32> {
        self.read_uint(data, IE_EGRESS_INTERFACE).map(|v| v as u32)
    }
}

/// Outcome of decoding one datagram.
#[derive(Debug)]
pub struct Decoded {
    pub version: u16,
    pub source_id: u32,
    pub sequence_number: u32,
    pub records: Vec<FlowRecord>,
    /// Data sets skipped because their template is unknown.
    pub orphan_sets: u32,
    /// Template definitions seen in this datagram (including refreshes).
    pub templates_installed: u32,
}

/// Decode one datagram, installing templates into `cache` as they appear.
pub fn decode_datagram(
    data: &[u8],
    peer_ip: IpAddr,
    cache: &TemplateCache,
) -> Result<Decoded, DecodeError> {
    if data.len() < 2 {
        return Err(DecodeError::Truncated("version field"));
    }
    let version = u16::from_be_bytes([data[0], data[1]]);
    match version {
        9 => v9::parse(data, peer_ip, cache),
        10 => ipfix::parse(data, peer_ip, cache),
        other => Err(DecodeError::BadVersion(other)),
    }
}

/// Walks the sets of one datagram body and dispatches them.
struct SetWalker<'a> {
    data: &'a [u8],
    version: u16,
    exporter: ExporterKey,
    cache: &'a TemplateCache,
    records: Vec<FlowRecord>,
    orphan_sets: u32,
    templates_installed: u32,
}

impl<'a> SetWalker<'a> {
    fn new(data: &'a [u8], version: u16, exporter: ExporterKey, cache: &'a TemplateCache) -> Self {
        Self {
            data,
            version,
            exporter,
            cache,
            records: Vec::new(),
            orphan_sets: 0,
            templates_installed: 0,
        }
    }

    /// Walk sets from `start` to `end` (absolute offsets) in wire order.
    fn walk(&mut self, start: usize, end: usize) -> Result<(), DecodeError> {
        let mut pos = start;
        while end - pos >= 4 {
            let set_id = u16::from_be_bytes([self.data[pos], self.data[pos + 1]]);
            let set_length =
                u16::from_be_bytes([self.data[pos + 2], self.data[pos + 3]]) as usize;
            if set_length < 4 {
                return Err(DecodeError::BadSetLength {
                    set_id,
                    length: set_length,
                });
            }
            if pos + set_length > end {
                return Err(DecodeError::Truncated("set"));
            }

            let payload = pos + 4..pos + set_length;
            match (self.version, set_id) {
                (9, 0) | (10, 2) => self.parse_template_set(payload)?,
                (9, 1) => self.parse_v9_options_set(payload)?,
                (10, 3) => self.parse_ipfix_options_set(payload)?,
                (_, id) if id >= 256 => self.parse_data_set(id, payload)?,
                (_, id) => {
                    // Reserved set id we do not understand; skip the set.
                    debug!(version = self.version, set_id = id, "skipping reserved set");
                }
            }

            pos += set_length;
        }
        Ok(())
    }

    fn install(
        &mut self,
        id: u16,
        kind: TemplateKind,
        scope_field_count: u16,
        fields: Vec<Field>,
    ) -> Result<(), DecodeError> {
        if id < 256 {
            return Err(DecodeError::ReservedTemplateId(id));
        }
        if fields.is_empty() {
            return Err(DecodeError::EmptyTemplate(id));
        }
        let outcome = self.cache.put(self.exporter, id, kind, scope_field_count, fields);
        self.templates_installed += 1;
        match outcome {
            PutOutcome::New => {
                debug!(exporter = %self.exporter, template = id, "new template");
            }
            PutOutcome::Redefined(version) => {
                debug!(exporter = %self.exporter, template = id, version, "template redefined");
            }
            PutOutcome::Refreshed => {}
        }
        Ok(())
    }

    /// One `(element_id, length[, enterprise])` field spec.
    fn parse_field_spec(&self, pos: &mut usize, end: usize) -> Result<Field, DecodeError> {
        if end - *pos < 4 {
            return Err(DecodeError::Truncated("field spec"));
        }
        let mut element_id = u16::from_be_bytes([self.data[*pos], self.data[*pos + 1]]);
        let length = u16::from_be_bytes([self.data[*pos + 2], self.data[*pos + 3]]);
        *pos += 4;

        let enterprise = if self.version == 10 && element_id & 0x8000 != 0 {
            if end - *pos < 4 {
                return Err(DecodeError::Truncated("enterprise number"));
            }
            element_id &= 0x7FFF;
            let pen = u32::from_be_bytes([
                self.data[*pos],
                self.data[*pos + 1],
                self.data[*pos + 2],
                self.data[*pos + 3],
            ]);
            *pos += 4;
            Some(pen)
        } else {
            None
        };

        Ok(Field {
            element_id,
            length,
            enterprise,
        })
    }

    /// Template set: v9 set id 0, IPFIX set id 2.
    fn parse_template_set(&mut self, payload: Range<usize>) -> Result<(), DecodeError> {
        let end = payload.end;
        let mut pos = payload.start;
        // Trailing padding shorter than a template header terminates the walk.
        while end - pos >= 4 {
            let id = u16::from_be_bytes([self.data[pos], self.data[pos + 1]]);
            let field_count = u16::from_be_bytes([self.data[pos + 2], self.data[pos + 3]]);
            pos += 4;
            if field_count == 0 {
                return Err(DecodeError::EmptyTemplate(id));
            }
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                fields.push(self.parse_field_spec(&mut pos, end)?);
            }
            self.install(id, TemplateKind::Data, 0, fields)?;
        }
        Ok(())
    }

    /// NetFlow v9 options template: scope/option lengths are in bytes.
    fn parse_v9_options_set(&mut self, payload: Range<usize>) -> Result<(), DecodeError> {
        let end = payload.end;
        let mut pos = payload.start;
        while end - pos >= 6 {
            let id = u16::from_be_bytes([self.data[pos], self.data[pos + 1]]);
            let scope_bytes = u16::from_be_bytes([self.data[pos + 2], self.data[pos + 3]]) as usize;
            let option_bytes =
                u16::from_be_bytes([self.data[pos + 4], self.data[pos + 5]]) as usize;
            pos += 6;

            let scope_count = scope_bytes / 4;
            let option_count = option_bytes / 4;
            if scope_count + option_count == 0 {
                return Err(DecodeError::EmptyTemplate(id));
            }
            let mut fields = Vec::with_capacity(scope_count + option_count);
            for _ in 0..scope_count + option_count {
                fields.push(self.parse_field_spec(&mut pos, end)?);
            }
            self.install(id, TemplateKind::Options, scope_count as u16, fields)?;
        }
        Ok(())
    }

    /// IPFIX options template: counts, scope fields listed first.
    fn parse_ipfix_options_set(&mut self, payload: Range<usize>) -> Result<(), DecodeError> {
        let end = payload.end;
        let mut pos = payload.start;
        while end - pos >= 6 {
            let id = u16::from_be_bytes([self.data[pos], self.data[pos + 1]]);
            let field_count = u16::from_be_bytes([self.data[pos + 2], self.data[pos + 3]]);
            let scope_count = u16::from_be_bytes([self.data[pos + 4], self.data[pos + 5]]);
            pos += 6;

            if field_count == 0 {
                return Err(DecodeError::EmptyTemplate(id));
            }
            if scope_count > field_count {
                return Err(DecodeError::BadScopeCount {
                    id,
                    scope: scope_count,
                    fields: field_count,
                });
            }
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                fields.push(self.parse_field_spec(&mut pos, end)?);
            }
            self.install(id, TemplateKind::Options, scope_count, fields)?;
        }
        Ok(())
    }

    /// Data set: decode records against the cached template, or count the
    /// set as orphan when the template is unknown.
    fn parse_data_set(&mut self, set_id: u16, payload: Range<usize>) -> Result<(), DecodeError> {
        let Some(template) = self.cache.get(&self.exporter, set_id) else {
            self.orphan_sets += 1;
            return Ok(());
        };

        let min_len = template.min_record_len();
        if min_len == 0 {
            // Degenerate all-zero-length layout; nothing to decode.
            return Ok(());
        }

        let end = payload.end;
        let mut pos = payload.start;
        while end - pos >= min_len {
            let mut fields = Vec::with_capacity(template.fields.len());
            for field in &template.fields {
                let value_len = if field.is_variable_length() {
                    // RFC 7011 §7: one length byte, 0xFF escapes to u16.
                    if pos >= end {
                        return Err(DecodeError::Truncated("variable length prefix"));
                    }
                    let first = self.data[pos];
                    pos += 1;
                    if first == 0xFF {
                        if end - pos < 2 {
                            return Err(DecodeError::Truncated("variable length prefix"));
                        }
                        let len =
                            u16::from_be_bytes([self.data[pos], self.data[pos + 1]]) as usize;
                        pos += 2;
                        len
                    } else {
                        first as usize
                    }
                } else {
                    field.length as usize
                };

                if end - pos < value_len {
                    return Err(DecodeError::Truncated("field value"));
                }
                fields.push(FlowField {
                    element_id: field.element_id,
                    range: pos..pos + value_len,
                });
                pos += value_len;
            }
            self.records.push(FlowRecord {
                template_id: set_id,
                fields,
            });
        }
        // Up to 3 bytes of trailing padding are expected and ignored.
        Ok(())
    }
}

pub(crate) fn walk_body(
    data: &[u8],
    body_start: usize,
    body_end: usize,
    version: u16,
    source_id: u32,
    sequence_number: u32,
    peer_ip: IpAddr,
    cache: &TemplateCache,
) -> Result<Decoded, DecodeError> {
    let exporter = ExporterKey::new(peer_ip, source_id);
    let mut walker = SetWalker::new(data, version, exporter, cache);
    walker.walk(body_start, body_end)?;
    Ok(Decoded {
        version,
        source_id,
        sequence_number,
        records: walker.records,
        orphan_sets: walker.orphan_sets,
        templates_installed: walker.templates_installed,
    })
}
