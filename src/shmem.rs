//! A System-V shared memory coverage channel.
//!
//! The instrumented target writes hit counts into this region at runtime;
//! the fuzzer wires its identifier into the target's environment as
//! `__AFL_SHM_ID` and reads a snapshot after the target exits. There is
//! never overlapping access: the child only ever runs while the parent is
//! blocked in `waitpid`, so no locking is required (§5 of the design).

use crate::error::{Error, Result};

/// An owned System-V shared memory segment sized for the coverage bitmap.
#[derive(Debug)]
pub struct SharedMap {
    id: i32,
    ptr: *mut u8,
    size: usize,
    destroyed: bool,
}

// The segment is exclusively owned by one `SharedMap` at a time and only
// ever touched while the owning process is not concurrently running the
// target (see module docs), so it is safe to move between threads.
unsafe impl Send for SharedMap {}

impl SharedMap {
    /// Allocates a new segment of `size` bytes, zeroed.
    pub fn new(size: usize) -> Result<Self> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
        if id < 0 {
            return Err(Error::SharedMemory(format!(
                "shmget failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if ptr == usize::MAX as *mut libc::c_void {
            unsafe {
                libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
            }
            return Err(Error::SharedMemory(format!(
                "shmat failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let map = Self {
            id,
            ptr: ptr as *mut u8,
            size,
            destroyed: false,
        };
        map.clear();
        Ok(map)
    }

    /// Detaches and removes the segment. Idempotent: a second call is a
    /// no-op. Also run automatically on drop.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        unsafe {
            libc::shmdt(self.ptr as *const libc::c_void);
            libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
        }
        self.destroyed = true;
    }

    /// The System-V identifier, stringified into the target's environment.
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Zeroes the region. Call before every execution.
    pub fn clear(&self) {
        unsafe {
            std::ptr::write_bytes(self.ptr, 0, self.size);
        }
    }

    /// Reads the entire region as an independent snapshot, detached from the
    /// live mapping.
    pub fn read_snapshot(&self) -> Vec<u8> {
        let slice = unsafe { std::slice::from_raw_parts(self.ptr, self.size) };
        slice.to_vec()
    }
}

impl Drop for SharedMap {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_clear_and_snapshot_roundtrip() {
        let map = SharedMap::new(4096).expect("shmget/shmat should succeed in CI sandboxes");
        let snap = map.read_snapshot();
        assert_eq!(snap.len(), 4096);
        assert!(snap.iter().all(|&b| b == 0));

        unsafe {
            *map.ptr.add(10) = 42;
        }
        let snap = map.read_snapshot();
        assert_eq!(snap[10], 42);

        map.clear();
        let snap = map.read_snapshot();
        assert!(snap.iter().all(|&b| b == 0));
    }
}
