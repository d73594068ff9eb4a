//! RTP port allocation for relay taps
//!
//! Each tap needs four consecutive ports: video RTP/RTCP then audio RTP/RTCP.
//! Blocks are handed out as leases and return to the pool when dropped.

use crate::error::{EgressError, EgressResult};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Ports consumed by one tap
pub const PORTS_PER_BLOCK: u16 = 4;

#[derive(Debug)]
struct Inner {
    start: u16,
    end: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

#[derive(Debug, Clone)]
pub struct PortAllocator {
    inner: Arc<Inner>,
}

impl PortAllocator {
    /// `start` must be even so RTP ports stay even and RTCP odd.
    pub fn new(start: u16, end: u16) -> EgressResult<Self> {
        if start % 2 != 0 {
            return Err(EgressError::Config(format!("RTP port range must start on an even port, got {start}")));
        }
        if end < start || u32::from(end - start) + 1 < u32::from(PORTS_PER_BLOCK) {
            return Err(EgressError::Config(format!(
                "RTP port range {start}-{end} cannot hold a block of {PORTS_PER_BLOCK} ports"
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                start,
                end,
                in_use: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    /// Number of blocks the range can hold
    #[must_use]
    pub fn capacity(&self) -> usize {
        let span = u32::from(self.inner.end) - u32::from(self.inner.start) + 1;
        (span / u32::from(PORTS_PER_BLOCK)) as usize
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.in_use.lock().len()
    }

    /// Lowest free block
    pub fn allocate(&self) -> EgressResult<PortLease> {
        let mut in_use = self.inner.in_use.lock();
        let base = (0..self.capacity())
            .filter_map(|i| u16::try_from(i).ok())
            .map(|i| self.inner.start + i * PORTS_PER_BLOCK)
            .find(|base| !in_use.contains(base))
            .ok_or(EgressError::PortsExhausted {
                start: self.inner.start,
                end: self.inner.end,
            })?;
        in_use.insert(base);

        Ok(PortLease {
            base,
            inner: Arc::clone(&self.inner),
        })
    }
}

/// A reserved block of four ports
#[derive(Debug)]
pub struct PortLease {
    base: u16,
    inner: Arc<Inner>,
}

impl PortLease {
    #[must_use]
    pub const fn video_port(&self) -> u16 {
        self.base
    }

    #[must_use]
    pub const fn audio_port(&self) -> u16 {
        self.base + 2
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.inner.in_use.lock().remove(&self.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_disjoint_and_reclaimed() {
        let ports = PortAllocator::new(20_000, 20_011).unwrap();
        assert_eq!(ports.capacity(), 3);

        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        assert_eq!((a.video_port(), a.audio_port()), (20_000, 20_002));
        assert_eq!((b.video_port(), b.audio_port()), (20_004, 20_006));

        drop(a);
        let c = ports.allocate().unwrap();
        assert_eq!(c.video_port(), 20_000);
        assert_eq!(ports.in_use(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let ports = PortAllocator::new(30_000, 30_003).unwrap();
        let _lease = ports.allocate().unwrap();
        assert!(matches!(ports.allocate(), Err(EgressError::PortsExhausted { .. })));
    }

    #[test]
    fn test_rejects_unusable_ranges() {
        assert!(PortAllocator::new(20_001, 20_100).is_err());
        assert!(PortAllocator::new(20_000, 20_002).is_err());
        assert!(PortAllocator::new(20_010, 20_000).is_err());
    }
}
