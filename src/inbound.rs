//! Inbound message dispatch.
//!
//! Every MT message starts with a [`MessageType`] byte. File uploads go to the
//! [`Reassembler`] and any acknowledgment it produces is written to a
//! timestamp-named file; station commands go to a pluggable [`CommandHandler`].
//! A message that fails to decode or handle is logged and dropped; it never
//! stops the messages queued behind it.

use crate::logutil::hex_snippet;
use crate::protocol::{DecodeError, Envelope, MessageType};
use crate::transfer::Reassembler;
use crate::transport::FileDrop;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

/// Station command hooks. The defaults only log the request.
pub trait CommandHandler: Send {
    fn ccm_command(&mut self, payload: &[u8]) -> Result<()> {
        info!(" - ccm command ({} bytes), no handler installed", payload.len());
        Ok(())
    }

    fn shell_command(&mut self, payload: &[u8]) -> Result<()> {
        info!(" - shell command ({} bytes), no handler installed", payload.len());
        Ok(())
    }
}

/// Handler that accepts and logs every command.
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl CommandHandler for LoggingHandler {}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Command(MessageType),
    /// A file part was accepted; `ack` is set when it completed a transfer.
    FilePart { ack: Option<PathBuf> },
    Dropped,
}

pub struct Dispatcher {
    reassembler: Reassembler,
    ack_pattern: String,
    handler: Box<dyn CommandHandler>,
}

impl Dispatcher {
    /// `ack_pattern` is a strftime pattern, e.g. `outbound/ack-%Y%m%d-%H%M%S.dat`.
    pub fn new(reassembler: Reassembler, ack_pattern: impl Into<String>) -> Self {
        Self::with_handler(reassembler, ack_pattern, Box::new(LoggingHandler))
    }

    pub fn with_handler(
        reassembler: Reassembler,
        ack_pattern: impl Into<String>,
        handler: Box<dyn CommandHandler>,
    ) -> Self {
        Self {
            reassembler,
            ack_pattern: ack_pattern.into(),
            handler,
        }
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Route one raw message by its type byte.
    pub fn dispatch(&mut self, data: &[u8]) -> Result<Dispatched> {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(DecodeError::UnknownMessageType(kind)) => {
                error!(" - Unknown message type: {} ({})", kind, hex_snippet(data, 16));
                return Ok(Dispatched::Dropped);
            }
            Err(e) => return Err(e.into()),
        };

        match envelope.kind {
            MessageType::CcmCommand => {
                self.handler.ccm_command(envelope.payload)?;
                Ok(Dispatched::Command(MessageType::CcmCommand))
            }
            MessageType::ShellCommand => {
                self.handler.shell_command(envelope.payload)?;
                Ok(Dispatched::Command(MessageType::ShellCommand))
            }
            MessageType::FileUpload => {
                info!(" - File upload");
                let ack = match self.reassembler.process(envelope.payload)? {
                    Some(ack) => {
                        let path = self.write_ack(&ack.encode(), Utc::now())?;
                        info!("  - sent ack {}", path.display());
                        Some(path)
                    }
                    None => None,
                };
                Ok(Dispatched::FilePart { ack })
            }
        }
    }

    /// Drain the inbox, deleting each message file whether or not it was handled.
    /// Returns the number of messages consumed.
    pub fn process_pending(&mut self, inbox: &FileDrop) -> Result<usize> {
        let pending = inbox
            .pending()
            .with_context(|| format!("listing inbox {}", inbox.dir().display()))?;

        let mut count = 0;
        for path in pending {
            info!("Message received: {}", path.display());

            match fs::read(&path) {
                Ok(data) => {
                    if let Err(e) = self.dispatch(&data) {
                        error!("Problem processing payload {}: {:#}", path.display(), e);
                    }
                }
                Err(e) => error!("Failed to read {}: {}", path.display(), e),
            }

            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
            count += 1;
        }
        Ok(count)
    }

    /// Expand the ack pattern for `now`, never overwriting an earlier ack.
    pub fn ack_path(&self, now: DateTime<Utc>) -> Result<PathBuf> {
        let mut name = String::new();
        write!(name, "{}", now.format(&self.ack_pattern))
            .map_err(|_| anyhow!("invalid ack path pattern '{}'", self.ack_pattern))?;

        let base = PathBuf::from(&name);
        if !base.exists() {
            return Ok(base);
        }
        (1..)
            .map(|n| PathBuf::from(format!("{}.{}", name, n)))
            .find(|candidate| !candidate.exists())
            .ok_or_else(|| anyhow!("no free ack filename for '{}'", name))
    }

    fn write_ack(&self, ack: &[u8], now: DateTime<Utc>) -> Result<PathBuf> {
        let path = self.ack_path(now)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating ack directory {}", parent.display()))?;
            }
        }
        fs::write(&path, ack).with_context(|| format!("writing ack {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct Recorder(Arc<Mutex<Vec<(MessageType, Vec<u8>)>>>);

    impl CommandHandler for Recorder {
        fn ccm_command(&mut self, payload: &[u8]) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((MessageType::CcmCommand, payload.to_vec()));
            Ok(())
        }

        fn shell_command(&mut self, _payload: &[u8]) -> Result<()> {
            Err(anyhow!("shell disabled"))
        }
    }

    fn dispatcher(root: &std::path::Path) -> Dispatcher {
        let reassembler = Reassembler::new(root.join("staging"), root.join("out")).unwrap();
        let pattern = format!("{}/acks/ack-%Y%m%d-%H%M%S.dat", root.display());
        Dispatcher::new(reassembler, pattern)
    }

    #[test]
    fn commands_reach_handler() {
        let dir = tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let reassembler = Reassembler::new(dir.path().join("staging"), dir.path()).unwrap();
        let mut d = Dispatcher::with_handler(reassembler, "ack.dat", Box::new(Recorder(seen.clone())));

        assert_eq!(
            d.dispatch(&[0, b'g', b'o']).unwrap(),
            Dispatched::Command(MessageType::CcmCommand)
        );
        assert_eq!(seen.lock().unwrap()[0], (MessageType::CcmCommand, b"go".to_vec()));
        assert!(d.dispatch(&[1, b'l', b's']).is_err());
    }

    #[test]
    fn unknown_type_is_dropped() {
        let dir = tempdir().unwrap();
        let mut d = dispatcher(dir.path());
        assert_eq!(d.dispatch(&[9, 1, 2, 3]).unwrap(), Dispatched::Dropped);
        assert!(d.dispatch(&[]).is_err());
    }

    #[test]
    fn ack_path_expands_pattern_and_avoids_overwrite() {
        let dir = tempdir().unwrap();
        let d = dispatcher(dir.path());
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 5).unwrap();

        let first = d.ack_path(now).unwrap();
        assert!(first.ends_with("acks/ack-20240309-123005.dat"));

        fs::create_dir_all(first.parent().unwrap()).unwrap();
        fs::write(&first, b"x").unwrap();
        let second = d.ack_path(now).unwrap();
        assert!(second.to_string_lossy().ends_with("ack-20240309-123005.dat.1"));
    }

    #[test]
    fn bad_ack_pattern_is_an_error() {
        let dir = tempdir().unwrap();
        let reassembler = Reassembler::new(dir.path().join("staging"), dir.path()).unwrap();
        let d = Dispatcher::new(reassembler, "ack-%");
        assert!(d.ack_path(Utc::now()).is_err());
    }
}
