//! Cross-process exclusive lock over the shared modem device.
//!
//! Several station processes may want the single serial device at once. Ownership
//! is recorded in a lock file (`LCK..<device>`) that holds the owner's process id.
//! A lock left behind by a crashed process is detected by probing the recorded pid
//! and removed so the device does not stay wedged.
//!
//! [`LockFile`] is the raw record; [`LockGuard`] brackets a single operation and
//! releases on every exit path, including unwinding.

use log::{debug, error, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

/// Free create attempts per [`LockFile::acquire`] call after clearing a stale record.
pub const MAX_STALE_CLEANUPS: u32 = 3;

/// Ownership record for the shared serial device.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    pid: u32,
}

enum Owner {
    Pid(u32),
    Unreadable,
    Vanished,
}

impl LockFile {
    /// Lock file owned by the current process.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_owner(path, std::process::id())
    }

    /// Lock file owned by an explicit pid (used to simulate competing owners).
    pub fn with_owner<P: AsRef<Path>>(path: P, pid: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pid,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Try to take the lock.
    ///
    /// Makes up to `max_retries + 1` exclusive-create attempts, sleeping
    /// `wait_interval` between them. Clearing a dead owner's record is followed by
    /// an immediate create that does not count against `max_retries` (at most
    /// [`MAX_STALE_CLEANUPS`] times per call). Returns `Ok(false)` when a live
    /// process holds the lock or the retries run out; only unexpected filesystem
    /// errors are `Err`.
    pub fn acquire(&self, max_retries: u32, wait_interval: Duration) -> io::Result<bool> {
        debug!("Trying to acquire lock {}", self.path.display());

        let mut unreadable_seen = false;
        let mut retries = 0;
        let mut cleanups = 0;

        loop {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    write!(file, "{}", self.pid)?;
                    file.sync_all()?;
                    debug!("  - lock acquired by pid {}", self.pid);
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("  - lock file already exists");
                }
                Err(e) => {
                    error!("Error creating lock {}: {}", self.path.display(), e);
                    return Err(e);
                }
            }

            let cleared = match self.read_owner()? {
                Owner::Vanished => true,
                // The creator may not have written its pid yet. Give it one interval.
                Owner::Unreadable if !unreadable_seen => {
                    unreadable_seen = true;
                    false
                }
                Owner::Unreadable => {
                    if !self.remove_stale("unreadable owner record")? {
                        return Ok(false);
                    }
                    true
                }
                Owner::Pid(pid) => {
                    debug!("  - pid={}, ours={}", pid, self.pid);

                    if pid == self.pid {
                        return Ok(true);
                    }

                    if process_alive(pid) {
                        debug!("  - owner pid {} still running", pid);
                        return Ok(false);
                    }

                    if !self.remove_stale(&format!("owner pid {} is gone", pid))? {
                        return Ok(false);
                    }
                    true
                }
            };

            if cleared && cleanups < MAX_STALE_CLEANUPS {
                cleanups += 1;
                continue;
            }

            if retries >= max_retries {
                debug!("  - max retries reached");
                return Ok(false);
            }
            retries += 1;
            debug!("  - retry {} of {}", retries, max_retries);
            sleep(wait_interval);
        }
    }

    /// Delete the lock file if this owner currently holds it.
    pub fn release(&self) -> io::Result<()> {
        if !self.owns_lock() {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Released lock {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// True when the lock file names a live process (any owner).
    pub fn is_locked(&self) -> bool {
        match self.read_owner() {
            Ok(Owner::Pid(pid)) => process_alive(pid),
            _ => false,
        }
    }

    /// True when the lock file names this owner.
    pub fn owns_lock(&self) -> bool {
        matches!(self.read_owner(), Ok(Owner::Pid(pid)) if pid == self.pid)
    }

    fn read_owner(&self) -> io::Result<Owner> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(match text.trim().parse::<u32>() {
                Ok(pid) if pid > 0 => Owner::Pid(pid),
                _ => Owner::Unreadable,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Owner::Vanished),
            Err(e) => {
                error!("Failed to read lock file {}: {}", self.path.display(), e);
                Err(e)
            }
        }
    }

    /// Remove a dead owner's lock file. `Ok(false)` when removal was refused.
    fn remove_stale(&self, reason: &str) -> io::Result<bool> {
        debug!("  - stale lock ({}), removing", reason);
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!("Cannot remove stale lock {}: {}", self.path.display(), e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Retry budget for bracketing one modem operation.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// Outer attempts while a live owner holds the device.
    pub attempts: u32,
    /// Sleep between outer attempts.
    pub busy_wait: Duration,
    /// Inner retries passed to [`LockFile::acquire`].
    pub max_retries: u32,
    /// Inner wait passed to [`LockFile::acquire`].
    pub wait_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            busy_wait: Duration::from_secs(1),
            max_retries: 10,
            wait_interval: Duration::from_secs(1),
        }
    }
}

/// Scoped ownership of a [`LockFile`]; released when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a LockFile,
}

impl<'a> LockGuard<'a> {
    /// Acquire within the policy's budget. `Ok(None)` means the device stayed busy.
    pub fn acquire(lock: &'a LockFile, policy: &LockPolicy) -> io::Result<Option<Self>> {
        let attempts = policy.attempts.max(1);
        for attempt in 0..attempts {
            if lock.acquire(policy.max_retries, policy.wait_interval)? {
                return Ok(Some(Self { lock }));
            }
            if attempt + 1 < attempts {
                sleep(policy.busy_wait);
            }
        }
        warn!(
            "Lock {} still busy after {} attempts",
            lock.path().display(),
            attempts
        );
        Ok(None)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!("Failed to release lock {}: {}", self.lock.path().display(), e);
        }
    }
}

/// Probe a pid without signalling it. EPERM still means the process exists.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let pid = match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => pid,
        _ => return false,
    };
    // SAFETY: signal 0 performs only the existence and permission checks.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
