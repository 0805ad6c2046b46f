use std::sync::Arc;

use super::{Buffer, BufferHandle, DeviceApi, DeviceError};

/// An owned device allocation released when dropped.
///
/// Entries use this for their temporary reduction buffer: the allocation's
/// lifetime equals the entry's, and retiring the entry frees the memory
/// deterministically.
pub struct TempBuffer {
    handle: BufferHandle,
    size: usize,
    api: Arc<dyn DeviceApi>,
}

impl TempBuffer {
    pub fn alloc(api: &Arc<dyn DeviceApi>, bytes: usize) -> Result<Self, DeviceError> {
        let handle = api.alloc_device(bytes)?;
        Ok(TempBuffer {
            handle,
            size: bytes,
            api: Arc::clone(api),
        })
    }

    #[must_use]
    #[inline]
    pub fn view(&self) -> Buffer {
        Buffer::new(self.handle)
    }

    #[must_use]
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for TempBuffer {
    fn drop(&mut self) {
        self.api.free(self.handle);
    }
}
