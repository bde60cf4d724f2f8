//! Buffers holding packed activation payloads.
//!
//! A [`DeviceBuffer`] stands in for accelerator memory; a [`HostBuffer`] is a
//! host allocation obtained from a [`HostAllocator`](super::host_pool::HostAllocator).
//! Copies between them are only performed by the transfer queues, which own
//! the source buffer until the copy has finished.

use bytes::{Bytes, BytesMut};

use crate::memory::host_pool::HostLease;

/// Packed payload resident in device memory.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    bytes: Bytes,
}

impl DeviceBuffer {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// A zero-length buffer.
    pub fn empty() -> Self {
        Self { bytes: Bytes::new() }
    }

    /// Host → device copy.
    pub fn from_host(host: &HostBuffer) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(host.as_bytes()),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Packed payload parked in host memory.
///
/// Dropping the buffer returns its bytes to the pool it came from.
#[derive(Debug)]
pub struct HostBuffer {
    data: BytesMut,
    pinned: bool,
    _lease: HostLease,
}

impl HostBuffer {
    pub(crate) fn new(len: usize, pinned: bool, lease: HostLease) -> Self {
        Self {
            data: BytesMut::zeroed(len),
            pinned,
            _lease: lease,
        }
    }

    /// Device → host copy into this buffer.
    pub fn copy_from_device(&mut self, src: &DeviceBuffer) {
        debug_assert_eq!(self.data.len(), src.len());
        let n = self.data.len().min(src.len());
        self.data[..n].copy_from_slice(&src.bytes()[..n]);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::host_pool::{HostAllocator, PinnedHostPool};

    #[test]
    fn test_device_host_device_copy() {
        let pool = PinnedHostPool::new(1024);
        let dev = DeviceBuffer::new(Bytes::from_static(&[1, 2, 3, 4]));

        let mut host = pool.allocate(dev.len(), true).unwrap();
        host.copy_from_device(&dev);
        assert_eq!(host.as_bytes(), &[1, 2, 3, 4]);
        assert!(host.is_pinned());

        let back = DeviceBuffer::from_host(&host);
        assert_eq!(back.bytes(), dev.bytes());
    }
}
