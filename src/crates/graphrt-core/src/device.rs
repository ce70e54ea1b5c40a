//! Device backend contract and process-local device handles
//!
//! Pointers and streams are opaque process-local integers; the engine never
//! dereferences them.

use crate::error::Result;
use std::fmt;

/// Address in device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer `bytes` past this one
    pub fn offset(self, bytes: u64) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Ordered device command queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Device driver/runtime as seen by the session.
///
/// Called from Initialize/Finalize/LoadGraph without any session lock held.
pub trait DeviceBackend: Send + Sync {
    /// Bind the calling thread to a device
    fn set_device(&self, device_id: u32) -> Result<()>;

    /// Release the device context
    fn reset_device(&self, device_id: u32) -> Result<()>;

    fn create_stream(&self) -> Result<StreamHandle>;

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Target platform identifier of the bound device
    fn soc_identifier(&self) -> Result<String>;

    fn set_soc_identifier(&self, soc: &str) -> Result<()>;

    /// Drop every allocator instance the runtime created for a session
    fn release_session_allocators(&self, _session_id: u64) -> Result<()> {
        Ok(())
    }
}

/// Device block handed out by an [`ExternalAllocator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBlock {
    pub ptr: DevicePtr,
    pub size: usize,
}

/// Caller-owned allocator used for outputs produced against a stream
pub trait ExternalAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<DeviceBlock>;

    fn free(&self, block: DeviceBlock);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ptr_helpers() {
        assert!(DevicePtr::NULL.is_null());
        let p = DevicePtr(0x1000);
        assert_eq!(p.offset(0x20), DevicePtr(0x1020));
        assert_eq!(p.to_string(), "0x1000");
    }
}
