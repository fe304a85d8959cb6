//! NetFlow v9 outer frame (Cisco).

use std::net::IpAddr;

use super::{walk_body, DecodeError, Decoded};
use crate::template::TemplateCache;

/// v9 header: version, count, sys_uptime, unix_secs, sequence, source_id.
pub const HEADER_LEN: usize = 20;

pub(super) fn parse(
    data: &[u8],
    peer_ip: IpAddr,
    cache: &TemplateCache,
) -> Result<Decoded, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::Truncated("v9 header"));
    }

    let sequence_number = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
    let source_id = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);

    // The header's count field tallies records, not bytes; the body is
    // walked by set lengths until fewer than a set header remains.
    walk_body(
        data,
        HEADER_LEN,
        data.len(),
        9,
        source_id,
        sequence_number,
        peer_ip,
        cache,
    )
}
