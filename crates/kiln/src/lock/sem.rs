#![allow(unsafe_code)]
//! SysV counting semaphores keyed by filesystem path.
//!
//! Unlike [`super::FileLock`], a semaphore blocks instead of failing, and
//! the kernel reverses a holder's operations when its process dies
//! (`SEM_UNDO`). The semaphore object itself outlives any single process:
//! the first opener initializes it, later openers attach to the existing
//! one.

use std::ffi::CString;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use kiln_common::{KilnError, KilnResult};

/// How long an attaching process waits for the creator to finish
/// initialization before forcing its own.
const BUSY_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// A process-shared counting semaphore identified by a `(path, id)` pair.
#[derive(Debug, Clone, Copy)]
pub struct Semaphore {
    id: libc::c_int,
}

impl Semaphore {
    /// Open (or create) the semaphore keyed by `path` and `project_id`.
    ///
    /// The first creator initializes the counter to `init_val`. A process
    /// racing the creator busy-waits until initialization is visible, and
    /// after [`BUSY_WAIT_TIMEOUT`] re-initializes the semaphore itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be derived from `path` (the path
    /// must exist) or the semaphore cannot be created or attached.
    pub fn open(path: &Path, project_id: u8, init_val: i32) -> KilnResult<Self> {
        let key = file_key(path, project_id)?;

        // SAFETY: plain syscalls on an owned key; no memory is shared.
        let id = unsafe {
            libc::semget(key, 1, 0o600 | libc::IPC_CREAT | libc::IPC_EXCL)
        };
        if id != -1 {
            init_sem(id, init_val)?;
            return Ok(Self { id });
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(KilnError::Io(err));
        }

        // Attach to the existing semaphore and wait out the creator's
        // initialization window.
        let id = unsafe { libc::semget(key, 1, 0o600) };
        if id == -1 {
            return Err(KilnError::Io(io::Error::last_os_error()));
        }
        let deadline = Instant::now() + BUSY_WAIT_TIMEOUT;
        loop {
            let mut ds: libc::semid_ds = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::semctl(id, 0, libc::IPC_STAT, &mut ds as *mut _) };
            if rc == -1 {
                return Err(KilnError::Io(io::Error::last_os_error()));
            }
            if ds.sem_otime != 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    path = %path.display(),
                    project_id,
                    "Semaphore creator never initialized; re-initializing"
                );
                init_sem(id, init_val)?;
                break;
            }
            std::thread::yield_now();
        }
        Ok(Self { id })
    }

    /// Block until the counter can be decremented.
    pub fn wait(&self) -> KilnResult<()> {
        self.op(-1, libc::SEM_UNDO as libc::c_short)
    }

    /// Increment the counter.
    pub fn signal(&self) -> KilnResult<()> {
        self.op(1, libc::SEM_UNDO as libc::c_short)
    }

    /// Decrement the counter without blocking.
    ///
    /// Returns `false` if the counter is zero.
    #[must_use]
    pub fn try_wait(&self) -> bool {
        self.op(-1, (libc::SEM_UNDO | libc::IPC_NOWAIT) as libc::c_short)
            .is_ok()
    }

    /// The current counter value, for status reporting only.
    pub fn value(&self) -> KilnResult<i32> {
        let rc = unsafe { libc::semctl(self.id, 0, libc::GETVAL) };
        if rc == -1 {
            return Err(KilnError::Io(io::Error::last_os_error()));
        }
        Ok(rc)
    }

    /// Remove the semaphore from the system.
    pub fn remove(&self) -> KilnResult<()> {
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        if rc == -1 {
            return Err(KilnError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn op(&self, delta: libc::c_short, flags: libc::c_short) -> KilnResult<()> {
        let mut buf = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: flags,
        };
        let rc = unsafe { libc::semop(self.id, &mut buf, 1) };
        if rc == -1 {
            return Err(KilnError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Set the counter to `init_val` and mark the semaphore initialized.
///
/// SysV gives no atomic create-and-set, so the value is set to one less
/// and a signal operation stamps `sem_otime`, which attachers poll for.
fn init_sem(id: libc::c_int, init_val: i32) -> KilnResult<()> {
    let rc = unsafe { libc::semctl(id, 0, libc::SETVAL, init_val - 1) };
    if rc == -1 {
        return Err(KilnError::Io(io::Error::last_os_error()));
    }
    let mut buf = libc::sembuf {
        sem_num: 0,
        sem_op: 1,
        sem_flg: 0,
    };
    let rc = unsafe { libc::semop(id, &mut buf, 1) };
    if rc == -1 {
        return Err(KilnError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn file_key(path: &Path, project_id: u8) -> KilnResult<libc::key_t> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes().to_vec()).map_err(|_| {
        KilnError::Internal {
            message: format!("path contains a NUL byte: {}", path.display()),
        }
    })?;
    let key = unsafe { libc::ftok(c_path.as_ptr(), libc::c_int::from(project_id)) };
    if key == -1 {
        return Err(KilnError::Io(io::Error::last_os_error()));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn binary_semaphore_mutual_exclusion() {
        let temp = tempdir().unwrap();
        let keyfile = temp.path().join("key");
        std::fs::write(&keyfile, b"").unwrap();

        let sem = match Semaphore::open(&keyfile, 1, 1) {
            Ok(sem) => sem,
            // Some sandboxes deny SysV IPC entirely.
            Err(_) => return,
        };

        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.signal().unwrap();
        assert!(sem.try_wait());

        sem.signal().unwrap();
        sem.remove().unwrap();
    }

    #[test]
    fn second_opener_attaches() {
        let temp = tempdir().unwrap();
        let keyfile = temp.path().join("key");
        std::fs::write(&keyfile, b"").unwrap();

        let first = match Semaphore::open(&keyfile, 2, 1) {
            Ok(sem) => sem,
            Err(_) => return,
        };
        let second = Semaphore::open(&keyfile, 2, 1).unwrap();

        assert!(first.try_wait());
        // The second handle sees the same counter.
        assert!(!second.try_wait());
        first.signal().unwrap();
        assert!(second.try_wait());
        second.signal().unwrap();

        first.remove().unwrap();
    }
}
