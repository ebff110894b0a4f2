//! Receive-side staging and completion of chunked transfers.
//!
//! Each arriving part is written to the staging directory as
//! `<serial>-<index:03>-<total>.part`; part 0 also writes `<serial>.meta`. Once every
//! index for the serial number is present the body is reassembled, inflated if
//! compressed, checked against the CRC32 from the meta block and written to its
//! destination. Staging files are removed whatever the outcome; a sender that
//! does not see a good acknowledgment resends the whole transfer.
//!
//! A resend carries a new serial number. When its part 0 arrives, any staged
//! transfer for the same destination filename is abandoned. Parts of recently
//! completed or abandoned serials are dropped on arrival, and anything left
//! untouched for longer than the stale age is swept.

use super::{crc32, decompress};
use crate::logutil::escape_bytes;
use crate::protocol::{Ack, DecodeError, FileFlags, FileMeta, PartHeader, PART_VERSION};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("staging io error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt meta record: {0}")]
    MetaRecord(#[from] serde_json::Error),
}

/// Persisted form of a part-0 meta block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MetaRecord {
    flags: u8,
    crc32: u32,
    filename: String,
    total: u8,
}

impl MetaRecord {
    fn flags(&self) -> FileFlags {
        FileFlags::from_bits_truncate(self.flags)
    }
}

/// Clamp a process exit status into the one-byte result code.
/// Anything outside 0..=255 (negative, signal, overflow) reports 255.
pub fn clamp_result_code(status: i64) -> u8 {
    u8::try_from(status).unwrap_or(u8::MAX)
}

/// Completed or superseded serial numbers remembered to catch late parts.
const RECENT_RETIRED: usize = 64;

pub const DEFAULT_STALE_AGE: Duration = Duration::from_secs(24 * 3600);

/// Disk-backed reassembly of FILE_UPLOAD messages.
#[derive(Debug)]
pub struct Reassembler {
    staging_dir: PathBuf,
    output_root: PathBuf,
    stale_age: Duration,
    retired: Mutex<VecDeque<u32>>,
}

impl Reassembler {
    /// `staging_dir` holds parts in flight; relative destination filenames are
    /// resolved against `output_root`.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(staging_dir: P, output_root: Q) -> io::Result<Self> {
        fs::create_dir_all(staging_dir.as_ref())?;
        Ok(Self {
            staging_dir: staging_dir.as_ref().to_path_buf(),
            output_root: output_root.as_ref().to_path_buf(),
            stale_age: DEFAULT_STALE_AGE,
            retired: Mutex::new(VecDeque::new()),
        })
    }

    /// Sweep staged transfers whose newest file is older than `age`.
    pub fn with_stale_age(mut self, age: Duration) -> Self {
        self.stale_age = age;
        self
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Feed one FILE_UPLOAD payload (envelope type byte already removed).
    ///
    /// Returns the acknowledgment once the transfer completes, `None` while parts
    /// are still missing or when the part uses an unknown format version.
    pub fn process(&self, payload: &[u8]) -> Result<Option<Ack>, TransferError> {
        match payload.first() {
            None => {
                return Err(DecodeError::Truncated {
                    field: "part version",
                    needed: 1,
                    available: 0,
                }
                .into())
            }
            Some(&v) if v != PART_VERSION => {
                warn!("Ignoring file part with unknown format version {}", v);
                return Ok(None);
            }
            Some(_) => {}
        }

        let (header, mut body) = PartHeader::decode(payload)?;
        let serial = header.serial;

        if self.is_retired(serial) && self.load_meta(serial)?.is_none() {
            debug!(
                "Dropping late part {} of finished serial {}",
                header.index, serial
            );
            return Ok(None);
        }

        debug!(
            "File part serial={} index={} total={} len={}",
            serial,
            header.index,
            header.total,
            body.len()
        );

        if header.index == 0 {
            let (meta, rest) = FileMeta::decode(body)?;
            body = rest;
            self.store_meta(serial, &meta, header.total)?;
        } else if let Some(meta) = self.load_meta(serial)? {
            if meta.total != header.total {
                warn!(
                    "Ignoring part {} of serial {}: total {} does not match meta total {}",
                    header.index, serial, header.total, meta.total
                );
                return Ok(None);
            }
        }

        self.write_atomic(&self.part_path(serial, header.index, header.total), body)?;

        let meta = match self.load_meta(serial)? {
            Some(meta) => meta,
            None => {
                debug!("  - waiting for part 0 of serial {}", serial);
                return Ok(None);
            }
        };

        let parts = self.parts_for(serial, Some(meta.total))?;
        if parts.len() < meta.total as usize {
            debug!(
                "  - serial {} has {} of {} parts",
                serial,
                parts.len(),
                meta.total
            );
            return Ok(None);
        }

        Ok(Some(self.complete(serial, meta, parts)?))
    }

    fn complete(
        &self,
        serial: u32,
        meta: MetaRecord,
        parts: BTreeMap<u8, PathBuf>,
    ) -> Result<Ack, TransferError> {
        let flags = meta.flags();

        info!("New file for serial {}", serial);
        info!("  - filename: {}", meta.filename);
        info!("  - parts: {}", meta.total);
        info!("  - flags: 0x{:x}", meta.flags);

        let mut contents = Vec::new();
        for path in parts.values() {
            contents.extend_from_slice(&fs::read(path)?);
        }
        info!("  - len: {}", contents.len());

        let mut contents_ok = true;

        if flags.contains(FileFlags::COMPRESSED) {
            info!("  - uncompressing");
            match decompress(&contents) {
                Ok(inflated) => contents = inflated,
                Err(e) => {
                    error!("  - failed to uncompress serial {}: {}", serial, e);
                    contents.clear();
                    contents_ok = false;
                }
            }
        }

        if contents_ok {
            let actual = crc32(&contents);
            if actual != meta.crc32 {
                error!(
                    "  - checksum mismatch for serial {}: expected {}, got {}",
                    serial, meta.crc32, actual
                );
                contents.clear();
                contents_ok = false;
            }
        }

        let mut process_ok = false;
        let mut result = 0u8;

        if contents_ok {
            match self.process_contents(&meta.filename, flags, &contents) {
                Ok(code) => {
                    process_ok = true;
                    result = code;
                }
                Err(e) => error!("Failed to process contents of serial {}: {}", serial, e),
            }
        }

        self.discard(serial)?;
        self.retire(serial);

        Ok(Ack {
            timestamp: chrono::Utc::now().timestamp() as u32,
            serial,
            contents_ok,
            process_ok,
            result,
        })
    }

    /// Save, execute and/or remove the reassembled file. Returns the result code.
    fn process_contents(&self, filename: &str, flags: FileFlags, contents: &[u8]) -> io::Result<u8> {
        let dest = self.resolve_destination(filename);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(&dest)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);

        let mut status = 0u8;

        if flags.contains(FileFlags::EXECUTE) {
            set_executable(&dest)?;
            let program = fs::canonicalize(&dest)?;
            let output = run_program(&program)?;
            let code = output.status.code().map(i64::from).unwrap_or(-1);
            status = clamp_result_code(code);
            info!("  - file executed, result status {}", status);
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            info!("  - output: {}", escape_bytes(&combined));
        }

        if flags.contains(FileFlags::REMOVE) {
            info!("  - remove {}", dest.display());
            fs::remove_file(&dest)?;
        }

        Ok(status)
    }

    fn resolve_destination(&self, filename: &str) -> PathBuf {
        let path = Path::new(filename);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.output_root.join(path)
        }
    }

    fn meta_path(&self, serial: u32) -> PathBuf {
        self.staging_dir.join(format!("{}.meta", serial))
    }

    fn part_path(&self, serial: u32, index: u8, total: u8) -> PathBuf {
        self.staging_dir
            .join(format!("{}-{:03}-{}.part", serial, index, total))
    }

    fn load_meta(&self, serial: u32) -> Result<Option<MetaRecord>, TransferError> {
        match fs::read(self.meta_path(serial)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record part 0's meta block. A different meta for the same serial number
    /// means the sender restarted the transfer, so earlier parts are dropped.
    /// Parts staged under a different total can never complete and go too.
    fn store_meta(&self, serial: u32, meta: &FileMeta, total: u8) -> Result<(), TransferError> {
        let record = MetaRecord {
            flags: meta.flags.bits(),
            crc32: meta.crc32,
            filename: meta.filename.clone(),
            total,
        };

        match self.load_meta(serial) {
            Ok(Some(existing)) if existing != record => {
                warn!("Serial {} restarted, discarding earlier parts", serial);
                self.remove_parts(serial)?;
            }
            Ok(_) => {}
            Err(TransferError::MetaRecord(e)) => {
                warn!("Replacing unreadable meta record for serial {}: {}", serial, e);
                self.remove_parts(serial)?;
            }
            Err(e) => return Err(e),
        }

        self.supersede_destination(serial, &record.filename)?;
        self.sweep_stale(serial)?;

        let stale: Vec<PathBuf> = self
            .parts_for(serial, None)?
            .into_values()
            .filter(|p| parse_part_name(p).map(|(_, _, t)| t != total).unwrap_or(false))
            .collect();
        for path in stale {
            remove_if_present(&path)?;
        }

        self.write_atomic(&self.meta_path(serial), &serde_json::to_vec(&record)?)?;
        Ok(())
    }

    /// Abandon other staged transfers headed for `filename`.
    fn supersede_destination(&self, serial: u32, filename: &str) -> Result<(), TransferError> {
        for (other, _) in self.staged_by_serial()? {
            if other == serial {
                continue;
            }
            let superseded = match self.load_meta(other) {
                Ok(Some(meta)) => meta.filename == filename,
                Ok(None) => false,
                Err(TransferError::MetaRecord(_)) => false,
                Err(e) => return Err(e),
            };
            if superseded {
                warn!(
                    "Serial {} supersedes incomplete serial {} for {}",
                    serial, other, filename
                );
                self.discard(other)?;
                self.retire(other);
            }
        }
        Ok(())
    }

    /// Remove every staged transfer, other than `keep`, left untouched past the stale age.
    fn sweep_stale(&self, keep: u32) -> io::Result<()> {
        let now = SystemTime::now();
        for (serial, files) in self.staged_by_serial()? {
            if serial == keep {
                continue;
            }
            let mut idle = Duration::MAX;
            for path in &files {
                let modified = match fs::metadata(path).and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                };
                idle = idle.min(now.duration_since(modified).unwrap_or_default());
            }
            if idle != Duration::MAX && idle >= self.stale_age {
                warn!(
                    "Sweeping stale transfer {} ({} files, idle {}s)",
                    serial,
                    files.len(),
                    idle.as_secs()
                );
                for path in &files {
                    remove_if_present(path)?;
                }
            }
        }
        Ok(())
    }

    /// Every staging file grouped by the serial number leading its name.
    fn staged_by_serial(&self) -> io::Result<BTreeMap<u32, Vec<PathBuf>>> {
        let mut staged: BTreeMap<u32, Vec<PathBuf>> = BTreeMap::new();
        for entry in fs::read_dir(&self.staging_dir)? {
            let path = entry?.path();
            if let Some(serial) = staged_serial(&path) {
                staged.entry(serial).or_default().push(path);
            }
        }
        Ok(staged)
    }

    fn is_retired(&self, serial: u32) -> bool {
        self.retired
            .lock()
            .map(|done| done.contains(&serial))
            .unwrap_or(false)
    }

    fn retire(&self, serial: u32) {
        if let Ok(mut done) = self.retired.lock() {
            if done.len() >= RECENT_RETIRED {
                done.pop_front();
            }
            done.push_back(serial);
        }
    }

    /// Staged parts for `serial`, keyed by index, optionally limited to one total.
    fn parts_for(&self, serial: u32, total: Option<u8>) -> io::Result<BTreeMap<u8, PathBuf>> {
        let mut parts = BTreeMap::new();
        for entry in fs::read_dir(&self.staging_dir)? {
            let path = entry?.path();
            if let Some((s, index, t)) = parse_part_name(&path) {
                if s == serial && total.map_or(true, |want| want == t) {
                    parts.insert(index, path);
                }
            }
        }
        Ok(parts)
    }

    fn remove_parts(&self, serial: u32) -> io::Result<()> {
        for path in self.parts_for(serial, None)?.into_values() {
            remove_if_present(&path)?;
        }
        Ok(())
    }

    /// Remove every staging file for `serial`.
    fn discard(&self, serial: u32) -> io::Result<()> {
        self.remove_parts(serial)?;
        remove_if_present(&self.meta_path(serial))
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)
    }
}

/// Parse `<serial>-<index>-<total>.part`.
fn parse_part_name(path: &Path) -> Option<(u32, u8, u8)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".part")?;
    let mut fields = stem.splitn(3, '-');
    let serial = fields.next()?.parse().ok()?;
    let index = fields.next()?.parse().ok()?;
    let total = fields.next()?.parse().ok()?;
    Some((serial, index, total))
}

/// Serial number of any staging file: `.part`, `.meta` or an interrupted `.tmp`.
fn staged_serial(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let stem = [".part", ".meta", ".tmp"]
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))?;
    stem.split('-').next()?.parse().ok()
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Run a freshly written program. A concurrent fork elsewhere in the process can
/// briefly hold the just-closed write handle, so ETXTBSY is retried.
fn run_program(program: &Path) -> io::Result<std::process::Output> {
    let mut attempts = 0;
    loop {
        match Command::new(program).output() {
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < 5 => {
                attempts += 1;
                std::thread::sleep(Duration::from_millis(50));
            }
            other => return other,
        }
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o775))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
