// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory shared between the driver and the GSC engine.

use parking_lot::Mutex;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// A DMA-capable buffer. Clones refer to the same memory.
///
/// Accesses outside the buffer panic; callers validate lengths against
/// [`DmaBuffer::len`] first.
#[derive(Clone)]
pub struct DmaBuffer {
    mem: Arc<Mutex<Box<[u8]>>>,
    iova: u64,
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("iova", &format_args!("{:#x}", self.iova))
            .field("len", &self.len())
            .finish()
    }
}

impl DmaBuffer {
    /// Allocates a zeroed buffer of `len` bytes at device address `iova`.
    pub fn new(iova: u64, len: usize) -> Self {
        Self {
            mem: Arc::new(Mutex::new(vec![0; len].into_boxed_slice())),
            iova,
        }
    }

    /// The device address of the buffer.
    pub fn iova(&self) -> u64 {
        self.iova
    }

    /// The buffer length in bytes.
    pub fn len(&self) -> usize {
        self.mem.lock().len()
    }

    /// Reads `data.len()` bytes at `offset`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        data.copy_from_slice(&self.mem.lock()[offset..offset + data.len()]);
    }

    /// Writes `data` at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        self.mem.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Reads an object at `offset`.
    pub fn read_obj<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes());
        obj
    }

    /// Writes an object at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable>(&self, offset: usize, obj: &T) {
        self.write_at(offset, obj.as_bytes());
    }

    /// Fills `len` bytes at `offset` with `val`.
    pub fn fill_at(&self, offset: usize, val: u8, len: usize) {
        self.mem.lock()[offset..offset + len].fill(val);
    }
}

#[cfg(test)]
mod tests {
    use super::DmaBuffer;

    #[test]
    fn clones_share_memory() {
        let buf = DmaBuffer::new(0x1000, 64);
        let alias = buf.clone();
        buf.write_obj(8, &0xdeadbeefu32);
        assert_eq!(alias.read_obj::<u32>(8), 0xdeadbeef);
        alias.fill_at(8, 0, 4);
        assert_eq!(buf.read_obj::<u32>(8), 0);
        assert_eq!(buf.iova(), 0x1000);
    }
}
