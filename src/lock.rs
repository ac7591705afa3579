//! Single-process ownership of a data directory.
//!
//! `serve` holds the lock for its lifetime and the one-shot commands hold it
//! while they run, so two processes never write the same record store. The
//! holder's pid is written into the lock file to make conflicts readable.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE_NAME: &str = "pixfeed.lock";

/// Released when dropped.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Take the data directory, creating it if needed. Fails with
    /// `WouldBlock` naming the holder's pid when another process has it.
    pub fn try_acquire(base_path: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(base_path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(base_path.join(LOCK_FILE_NAME))?;

        if !flock_exclusive(&file)? {
            let holder = read_holder(&mut file)
                .map(|pid| format!("pid {pid}"))
                .unwrap_or_else(|| "another process".to_string());
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("data directory {base_path:?} is in use by {holder}"),
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(FileLock { file })
    }
}

fn read_holder(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

/// `Ok(false)` when someone else holds the lock.
#[cfg(unix)]
fn flock_exclusive(file: &File) -> io::Result<bool> {
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => Ok(false),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(unix)]
fn unlock(file: &File) {
    // closing the fd releases it too
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

impl Drop for FileLock {
    fn drop(&mut self) {
        // stale pid would mislead the next conflict message
        let _ = self.file.set_len(0);
        unlock(&self.file);
    }
}
