use std::{io, mem::size_of, ops::Deref};

use rdma_sys::{ibv_access_flags, ibv_mr, ibv_pd, ibv_reg_mr};

/// Registered memory, deregistered on drop. The registered buffer must outlive it.
pub struct MemoryRegion {
    pub(crate) mr: *mut ibv_mr,
}

unsafe impl Send for MemoryRegion {}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe {
            rdma_sys::ibv_dereg_mr(self.mr);
        }
    }
}

impl Deref for MemoryRegion {
    type Target = ibv_mr;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mr }
    }
}

impl MemoryRegion {
    /// # Safety
    /// `pd` must be a live protection domain and `buffer` must not move or shrink while the
    /// region exists.
    pub unsafe fn register<T: Sized + Copy>(pd: *mut ibv_pd, buffer: &mut [T]) -> io::Result<Self> {
        Self::register_with(
            pd,
            buffer,
            ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_READ
                | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC,
        )
    }

    /// # Safety
    /// Same as [`MemoryRegion::register`].
    pub unsafe fn register_with<T: Sized + Copy>(
        pd: *mut ibv_pd,
        buffer: &mut [T],
        access: ibv_access_flags,
    ) -> io::Result<Self> {
        tracing::trace!(
            address = ?buffer.as_ptr(),
            length = buffer.len() * size_of::<T>(),
            "registering memory region"
        );

        let mr = ibv_reg_mr(
            pd,
            buffer.as_mut_ptr().cast(),
            buffer.len() * size_of::<T>(),
            access.0 as i32,
        );

        if mr.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(MemoryRegion { mr })
    }
}
