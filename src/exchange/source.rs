//! Prioritized spool directories feeding the outbound queue.

use chrono::NaiveDateTime;
use log::{info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Timestamp layout embedded in spooled filenames: `<source>-YYYYMMDD-HHMMSS.<ext>`.
const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// One file-producing origin.
#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    /// Prefixed to every outbound payload so the ground side can tell origins apart.
    pub code: u8,
    pub pattern: String,
    /// Lower values are sent first.
    pub priority: i32,
    /// Keep only the newest N files; `None` or 0 keeps everything.
    pub limit_files: Option<usize>,
}

impl Source {
    pub fn new(
        name: impl Into<String>,
        code: u8,
        pattern: impl Into<String>,
        priority: i32,
        limit_files: Option<usize>,
    ) -> Result<Self, glob::PatternError> {
        let pattern = pattern.into();
        glob::Pattern::new(&pattern)?;
        Ok(Self {
            name: name.into(),
            code,
            pattern,
            priority,
            limit_files,
        })
    }

    /// Matching files, oldest first, after deleting any backlog beyond the retention limit.
    pub fn find_files(&self) -> io::Result<Vec<PathBuf>> {
        let paths = glob::glob(&self.pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut files = Vec::new();
        for entry in paths {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {}
                Err(e) => warn!("[{}] skipping unreadable entry: {}", self.name, e),
            }
        }

        files.sort_by_cached_key(|path| (file_timestamp(path), path.clone()));

        if let Some(limit) = self.limit_files.filter(|&n| n > 0) {
            if files.len() > limit {
                info!("[{}] Limiting files to last {}", self.name, limit);
                let keep = files.split_off(files.len() - limit);
                for old in &files {
                    info!("[{}]   - removing {}", self.name, old.display());
                    match fs::remove_file(old) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
                files = keep;
            }
        }

        Ok(files)
    }
}

/// Timestamp between the first `-` and the first `.` of the basename.
/// Names without a parseable stamp sort before every stamped file.
pub fn file_timestamp(path: &Path) -> Option<NaiveDateTime> {
    let name = path.file_name()?.to_str()?;
    let (_, rest) = name.split_once('-')?;
    let stamp = rest.split('.').next()?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()
}
