//! The process supervisor: forks one child per worker role, reaps them,
//! and can signal or shut the whole fleet down.
//!
//! There is no respawn-on-crash logic here, deliberately: a worker dying
//! is treated as fatal for the whole daemon, same as the parent's SIGCHLD
//! handling that sets `running = 0` instead of restarting anything.

use std::collections::HashMap;
use std::ffi::CString;

use crate::error::SetupError;

/// The six roles a worker process can take on. `Keying` and `Status` are
/// additions beyond the four the original daemon's `proc_create` accepted;
/// they get no special treatment here, just more entries in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ProcType {
    Clear = 1,
    Crypto = 2,
    Encrypt = 3,
    Decrypt = 4,
    Keying = 5,
    Status = 6,
}

impl ProcType {
    pub const ALL: [ProcType; 6] = [
        ProcType::Clear,
        ProcType::Crypto,
        ProcType::Encrypt,
        ProcType::Decrypt,
        ProcType::Keying,
        ProcType::Status,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProcType::Clear => "clear",
            ProcType::Crypto => "crypto",
            ProcType::Encrypt => "encrypt",
            ProcType::Decrypt => "decrypt",
            ProcType::Keying => "keying",
            ProcType::Status => "status",
        }
    }

    pub fn from_name(name: &str) -> Option<ProcType> {
        ProcType::ALL.into_iter().find(|p| p.name() == name)
    }
}

/// A single child process under our control. Only meaningful in the
/// parent: `pid` is the child's pid as seen from here.
pub struct Proc {
    pub pid: libc::pid_t,
    pub kind: ProcType,
}

/// Tracks every forked child and the user each should drop privileges to,
/// as parsed out of `run <process> as <user>` configuration lines.
pub struct Supervisor {
    procs: Vec<Proc>,
    runas: HashMap<ProcType, String>,
}

impl Supervisor {
    pub fn new(runas: HashMap<ProcType, String>) -> Supervisor {
        Supervisor {
            procs: Vec::new(),
            runas,
        }
    }

    /// Fork one child per entry in `roles`, running `entry` in each. The
    /// child never returns from `entry`; in the parent, the new pid is
    /// recorded and execution continues to the next role.
    ///
    /// # Safety
    /// Must be called before any threads are spawned: `fork()` in a
    /// multi-threaded process only duplicates the calling thread, which
    /// is unsound for anything holding a lock at fork time.
    pub unsafe fn start_all<F>(&mut self, roles: &[ProcType], mut entry: F) -> Result<(), SetupError>
    where
        F: FnMut(ProcType) -> !,
    {
        for &kind in roles {
            let pid = libc::fork();
            if pid == -1 {
                return Err(SetupError::Fork(std::io::Error::last_os_error()));
            }

            if pid == 0 {
                if let Some(user) = self.runas.get(&kind) {
                    drop_privileges(user)?;
                }
                entry(kind);
            }

            log::info!("proc-{} pid={}", kind.name(), pid);
            self.procs.push(Proc { pid, kind });
        }

        Ok(())
    }

    /// Reap every exited child (non-blocking), removing it from the
    /// tracked set. Mirrors the original supervisor: there is no retry,
    /// no restart, just bookkeeping.
    pub fn reap(&mut self) {
        loop {
            let mut status = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };

            if pid == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ECHILD) {
                    break;
                }
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                panic!("waitpid failed: {err}");
            }

            if pid == 0 {
                break;
            }

            if let Some(idx) = self.procs.iter().position(|p| p.pid == pid) {
                let proc = self.procs.remove(idx);
                log::info!("proc-{} exited (status={})", proc.kind.name(), status);
            }
        }
    }

    pub fn kill_all(&self, sig: libc::c_int) {
        for proc in &self.procs {
            if unsafe { libc::kill(proc.pid, sig) } == -1 {
                log::warn!(
                    "failed to signal proc {} ({})",
                    proc.kind.name(),
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    /// Ask every worker to quit and wait for all of them to exit.
    pub fn shutdown(&mut self) {
        self.kill_all(libc::SIGQUIT);
        while !self.procs.is_empty() {
            self.reap();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

/// Resolve `user` via `getpwnam` and drop to its uid/gid. Groups are set
/// via `initgroups` so supplementary groups are not inherited from the
/// parent's (root) identity.
fn drop_privileges(user: &str) -> Result<(), SetupError> {
    let fail = |uid: u32, gid: u32| SetupError::DropPrivileges {
        uid,
        gid,
        source: std::io::Error::last_os_error(),
    };

    let cname = CString::new(user).expect("configured user name must not contain NUL");

    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        return Err(fail(0, 0));
    }

    let (uid, gid) = unsafe { ((*pw).pw_uid, (*pw).pw_gid) };

    unsafe {
        if libc::initgroups(cname.as_ptr(), gid) == -1 {
            return Err(fail(uid, gid));
        }
        if libc::setgid(gid) == -1 {
            return Err(fail(uid, gid));
        }
        if libc::setuid(uid) == -1 {
            return Err(fail(uid, gid));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_type_name_round_trips() {
        for kind in ProcType::ALL {
            assert_eq!(ProcType::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ProcType::from_name("bogus"), None);
    }
}
