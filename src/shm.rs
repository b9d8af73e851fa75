//! System V shared memory segments.
//!
//! Each structure named in the data model (a ring, the packet pool, a key
//! slot, ...) lives in its own independently allocated segment rather than
//! one monolithic block. A worker that detaches a segment it does not need
//! genuinely loses access to it across `fork()` -- `shmdt` only unmaps from
//! the caller's own address space, so siblings and the parent are unaffected.

use std::io;
use std::ptr::NonNull;

use crate::error::ShmError;

/// A single System V shared memory segment sized to hold exactly one `T`.
///
/// The segment is marked `IPC_RMID` immediately after the creator attaches,
/// so the kernel reclaims it automatically once the last attacher detaches
/// or exits -- there is no explicit cleanup path for the happy case.
pub struct Segment<T> {
    id: i32,
    ptr: NonNull<T>,
    attached: bool,
}

unsafe impl<T: Send> Send for Segment<T> {}
unsafe impl<T: Sync> Sync for Segment<T> {}

impl<T> Segment<T> {
    /// Create a new segment and attach to it. The backing memory is
    /// zero-filled by the kernel, matching the `memset(ring, 0, ...)`
    /// the structures in this crate rely on for their initial state.
    pub fn create() -> Result<Self, ShmError> {
        let size = std::mem::size_of::<T>();

        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, 0o600 | libc::IPC_CREAT) };
        if id == -1 {
            return Err(ShmError::Get {
                key: libc::IPC_PRIVATE,
                size,
                source: io::Error::last_os_error(),
            });
        }

        let raw = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if raw == usize::MAX as *mut libc::c_void {
            let source = io::Error::last_os_error();
            unsafe {
                libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
            }
            return Err(ShmError::Attach { id, source });
        }

        if unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
            let source = io::Error::last_os_error();
            unsafe {
                libc::shmdt(raw);
            }
            return Err(ShmError::Remove { id, source });
        }

        Ok(Self {
            id,
            ptr: NonNull::new(raw as *mut T).expect("shmat returned null without error"),
            attached: true,
        })
    }

    /// Raw pointer into the segment. Valid in every process that has not
    /// called `detach()`, including forked children -- `fork()` duplicates
    /// the parent's address space so the same virtual address maps to the
    /// same physical shared pages in the child.
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Detach this segment from the calling process's address space. This
    /// is the isolation primitive privilege separation relies on: once
    /// called, this process can no longer read or write the segment, even
    /// though siblings that never detach still can.
    pub fn detach(&mut self) {
        if self.attached {
            unsafe {
                libc::shmdt(self.ptr.as_ptr() as *const libc::c_void);
            }
            self.attached = false;
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        self.detach();
    }
}
