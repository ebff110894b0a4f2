//! File-drop boundary to the station's message transport.
//!
//! The scheduler posts every MT message body it receives into a drop directory;
//! the inbound dispatcher consumes the same directory as its inbox. Files are
//! written under a dot-prefixed temporary name and renamed into place, so a
//! reader never sees a half-written message.

use chrono::Utc;
use log::debug;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone)]
pub struct FileDrop {
    dir: PathBuf,
}

impl FileDrop {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store one message. Names sort in arrival order.
    pub fn post(&self, payload: &[u8]) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        loop {
            let name = format!(
                "msg-{}-{}-{:06}.sbd",
                Utc::now().format("%Y%m%d-%H%M%S%.6f"),
                std::process::id(),
                SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1_000_000
            );
            let path = self.dir.join(&name);
            let tmp = self.dir.join(format!(".{}", name));

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&tmp) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            };
            file.write_all(payload)?;
            file.sync_all()?;
            drop(file);

            if path.exists() {
                fs::remove_file(&tmp)?;
                continue;
            }
            fs::rename(&tmp, &path)?;
            debug!("Posted {} bytes to {}", payload.len(), path.display());
            return Ok(path);
        }
    }

    /// Complete messages waiting in the directory, oldest first.
    pub fn pending(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn posted_messages_come_back_in_order() {
        let dir = tempdir().unwrap();
        let drop_dir = FileDrop::new(dir.path().join("inbox"));

        assert!(drop_dir.pending().unwrap().is_empty());

        let first = drop_dir.post(b"one").unwrap();
        let second = drop_dir.post(b"two").unwrap();
        assert_ne!(first, second);

        let pending = drop_dir.pending().unwrap();
        assert_eq!(pending, vec![first.clone(), second]);
        assert_eq!(fs::read(&first).unwrap(), b"one");
    }

    #[test]
    fn temporary_files_are_not_pending() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".msg-partial.sbd"), b"x").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        assert!(FileDrop::new(dir.path()).pending().unwrap().is_empty());
    }
}
