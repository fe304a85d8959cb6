use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// One received flow-export datagram on its way through the pipeline.
///
/// Owned by exactly one task at a time: created by ingress, handed to a
/// worker, then to the forwarder, and dropped after the last send.
#[derive(Debug)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub peer: SocketAddr,
    pub received_at: Instant,
}

impl Datagram {
    pub fn new(data: Vec<u8>, peer: SocketAddr) -> Self {
        Self {
            data,
            peer,
            received_at: Instant::now(),
        }
    }
}

/// Template namespace identifier: exporter address plus the 32-bit
/// Observation Domain ID (IPFIX) or Source ID (NetFlow v9).
///
/// Two source IDs from the same IP are independent namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExporterKey {
    pub ip: IpAddr,
    pub source_id: u32,
}

impl ExporterKey {
    pub fn new(ip: IpAddr, source_id: u32) -> Self {
        Self { ip, source_id }
    }
}

impl std::fmt::Display for ExporterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.source_id)
    }
}

/// Largest UDP payload the relay accepts.
pub const MAX_DATAGRAM: usize = 65_507;

/// Free-list of receive buffers, recycled from the forwarder back to
/// ingress so the steady state does not allocate per packet.
pub struct BufferPool {
    free: parking_lot::Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
}

impl BufferPool {
    pub fn new(max_buffers: usize) -> Self {
        Self {
            free: parking_lot::Mutex::new(Vec::new()),
            max_buffers,
        }
    }

    /// An empty buffer with full datagram capacity.
    pub fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(MAX_DATAGRAM))
    }

    /// Return a spent buffer. Dropped silently once the pool is full.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_buffers {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_recycles() {
        let pool = BufferPool::new(2);
        let mut a = pool.get();
        a.extend_from_slice(b"payload");
        pool.put(a);

        let b = pool.get();
        assert!(b.is_empty(), "recycled buffers come back cleared");
        assert!(b.capacity() >= 7);
    }

    #[test]
    fn test_buffer_pool_bounded() {
        let pool = BufferPool::new(1);
        pool.put(Vec::with_capacity(MAX_DATAGRAM));
        pool.put(Vec::with_capacity(MAX_DATAGRAM));
        assert_eq!(pool.free.lock().len(), 1);
    }
}
