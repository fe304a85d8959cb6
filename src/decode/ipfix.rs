//! IPFIX outer frame (RFC 7011).

use std::net::IpAddr;

use super::{walk_body, DecodeError, Decoded};
use crate::template::TemplateCache;

/// IPFIX header: version, length, export_time, sequence, observation domain.
pub const HEADER_LEN: usize = 16;

pub(super) fn parse(
    data: &[u8],
    peer_ip: IpAddr,
    cache: &TemplateCache,
) -> Result<Decoded, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::Truncated("IPFIX header"));
    }

    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    if length != data.len() {
        return Err(DecodeError::LengthMismatch {
            header: length,
            datagram: data.len(),
        });
    }

    let sequence_number = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let observation_domain_id = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);

    walk_body(
        data,
        HEADER_LEN,
        data.len(),
        10,
        observation_domain_id,
        sequence_number,
        peer_ip,
        cache,
    )
}
