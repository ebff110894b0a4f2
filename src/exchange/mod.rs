//! # Outbound Exchange Scheduler
//!
//! One [`ExchangeScheduler::tick`] is one exchange cycle:
//!
//! 1. probe the modem; an unreachable modem skips the whole cycle
//! 2. collect queued files from every [`Source`] in priority order, trimming
//!    each source's backlog to its retention limit first
//! 3. send each file as `[source code][file bytes]` followed by a session
//!    exchange, deleting the file once the session settles
//! 4. with nothing queued, drain any MT traffic announced by a ring alert
//!
//! MT messages returned by any session are posted to the inbound [`FileDrop`].
//! A failure on one file is logged and the cycle moves on to the next one,
//! leaving the file queued for the next cycle. A file too large for one MO
//! message is removed instead. Only shutdown stops a cycle early.

pub mod source;

pub use source::{file_timestamp, Source};

use crate::modem::{Modem, ModemError, MAX_MO_PAYLOAD};
use crate::transport::FileDrop;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;

/// The scheduler's view of the satellite link.
pub trait Bearer {
    fn ready(&mut self) -> Result<(), ModemError>;
    fn wait_for_signal(&mut self) -> Result<u8, ModemError>;
    fn write_message(&mut self, payload: &[u8]) -> Result<(), ModemError>;
    fn exchange_session(&mut self) -> Result<Vec<Vec<u8>>, ModemError>;
    /// Whether the network has flagged MT traffic waiting for us.
    fn ring_alert(&mut self) -> Result<bool, ModemError>;
}

impl Bearer for Modem {
    fn ready(&mut self) -> Result<(), ModemError> {
        Modem::ready(self)
    }

    fn wait_for_signal(&mut self) -> Result<u8, ModemError> {
        let (min, timeout) = (self.settings().min_signal, self.settings().signal_timeout);
        Modem::wait_for_signal(self, min, timeout)
    }

    fn write_message(&mut self, payload: &[u8]) -> Result<(), ModemError> {
        Modem::write_message(self, payload)
    }

    fn exchange_session(&mut self) -> Result<Vec<Vec<u8>>, ModemError> {
        let timeout = self.settings().session_timeout;
        Modem::exchange_session(self, timeout)
    }

    fn ring_alert(&mut self) -> Result<bool, ModemError> {
        Ok(self.status()?.ring_alert)
    }
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Modem(#[from] ModemError),

    #[error("spool io error: {0}")]
    Io(#[from] io::Error),
}

impl ExchangeError {
    fn is_abort(&self) -> bool {
        matches!(self, ExchangeError::Modem(ModemError::Abort))
    }

    /// Retrying cannot help; the file will fail the same way every cycle.
    fn is_permanent(&self) -> bool {
        matches!(self, ExchangeError::Modem(ModemError::PayloadTooLarge(_)))
    }
}

/// Modem health as seen across cycles.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeState {
    #[default]
    Starting,
    Ready,
    Unavailable {
        since: DateTime<Utc>,
        cycles: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    ModemUnavailable,
    /// Nothing queued and no ring alert.
    Idle,
    Sent { sent: usize, failed: usize },
    RingDrained,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// MT messages posted for the inbound dispatcher.
    pub inbound: usize,
}

/// Running totals since start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeCounters {
    pub cycles: u64,
    pub files_sent: u64,
    pub files_failed: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
}

pub struct ExchangeScheduler<B: Bearer> {
    sources: Vec<Source>,
    bearer: B,
    inbound: FileDrop,
    state: ExchangeState,
    counters: ExchangeCounters,
}

impl<B: Bearer> ExchangeScheduler<B> {
    /// Sources are ordered by ascending priority, then by name.
    pub fn new(mut sources: Vec<Source>, bearer: B, inbound: FileDrop) -> Self {
        sources.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Self {
            sources,
            bearer,
            inbound,
            state: ExchangeState::default(),
            counters: ExchangeCounters::default(),
        }
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    pub fn counters(&self) -> ExchangeCounters {
        self.counters
    }

    pub fn bearer(&self) -> &B {
        &self.bearer
    }

    pub fn bearer_mut(&mut self) -> &mut B {
        &mut self.bearer
    }

    /// Run one exchange cycle.
    pub fn tick(&mut self) -> CycleReport {
        self.counters.cycles += 1;

        if let Err(outcome) = self.modem_check() {
            return CycleReport {
                outcome,
                inbound: 0,
            };
        }

        let queued = self.find_files();

        if queued.is_empty() {
            return self.check_ring_alert();
        }

        info!("Found {} files queued for transfer", queued.len());

        let total = queued.len();
        let (mut sent, mut failed, mut inbound) = (0, 0, 0);

        for (index, (code, path)) in queued.into_iter().enumerate() {
            info!(
                "Send {} of {}: {}",
                index + 1,
                total,
                path.file_name().unwrap_or_default().to_string_lossy()
            );

            match self.send_file(code, &path) {
                Ok(received) => {
                    sent += 1;
                    inbound += received;
                    info!("  All messages sent");
                }
                Err(e) if e.is_abort() => {
                    warn!("Exchange aborted during {}", path.display());
                    return CycleReport {
                        outcome: CycleOutcome::Aborted,
                        inbound,
                    };
                }
                Err(e) => {
                    failed += 1;
                    self.counters.files_failed += 1;
                    error!("Failed to send {}: {}", path.display(), e);
                    if e.is_permanent() {
                        error!("  - dropping {} from the spool", path.display());
                        if let Err(e) = fs::remove_file(&path) {
                            error!("  - failed to remove {}: {}", path.display(), e);
                        }
                    }
                }
            }
        }

        CycleReport {
            outcome: CycleOutcome::Sent { sent, failed },
            inbound,
        }
    }

    /// Tick every `interval` until `running` is cleared.
    pub fn run(&mut self, interval: Duration, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            let started = Instant::now();
            let report = self.tick();
            info!("Exchange cycle: {:?}, {} inbound", report.outcome, report.inbound);

            let deadline = started + interval;
            while running.load(Ordering::SeqCst) && Instant::now() < deadline {
                sleep(Duration::from_millis(250).min(deadline.saturating_duration_since(Instant::now())));
            }
        }
    }

    fn modem_check(&mut self) -> Result<(), CycleOutcome> {
        info!("Modem check");

        match self.bearer.ready() {
            Ok(()) => {
                if let ExchangeState::Unavailable { cycles, .. } = self.state {
                    info!("  - modem back after {} failed cycles", cycles);
                }
                self.state = ExchangeState::Ready;
                Ok(())
            }
            Err(ModemError::Abort) => Err(CycleOutcome::Aborted),
            Err(e) => {
                if let ModemError::Timeout = e {
                    error!("  - timeout");
                } else {
                    error!("Problem communicating with modem: {}", e);
                }
                self.state = match self.state {
                    ExchangeState::Unavailable { since, cycles } => ExchangeState::Unavailable {
                        since,
                        cycles: cycles + 1,
                    },
                    _ => ExchangeState::Unavailable {
                        since: Utc::now(),
                        cycles: 1,
                    },
                };
                Err(CycleOutcome::ModemUnavailable)
            }
        }
    }

    fn find_files(&self) -> Vec<(u8, PathBuf)> {
        let mut queued = Vec::new();
        for source in &self.sources {
            match source.find_files() {
                Ok(files) => queued.extend(files.into_iter().map(|path| (source.code, path))),
                Err(e) => error!("[{}] Failed to list {}: {}", source.name, source.pattern, e),
            }
        }
        queued
    }

    fn send_file(&mut self, code: u8, path: &Path) -> Result<usize, ExchangeError> {
        let contents = fs::read(path)?;
        let mut payload = Vec::with_capacity(contents.len() + 1);
        payload.push(code);
        payload.extend_from_slice(&contents);
        if payload.len() > MAX_MO_PAYLOAD {
            return Err(ModemError::PayloadTooLarge(payload.len()).into());
        }

        info!("MO message queued ({} bytes)", payload.len());
        self.bearer.write_message(&payload)?;
        let received = self.exchange()?;

        self.counters.files_sent += 1;
        self.counters.bytes_sent += payload.len() as u64;

        fs::remove_file(path)?;
        Ok(received)
    }

    fn check_ring_alert(&mut self) -> CycleReport {
        let idle = CycleReport {
            outcome: CycleOutcome::Idle,
            inbound: 0,
        };

        match self.bearer.wait_for_signal() {
            Ok(_) => {}
            Err(ModemError::Abort) => {
                return CycleReport {
                    outcome: CycleOutcome::Aborted,
                    inbound: 0,
                }
            }
            Err(e) => {
                info!("No signal for ring alert check: {}", e);
                return idle;
            }
        }

        match self.bearer.ring_alert() {
            Ok(true) => {}
            Ok(false) => return idle,
            Err(e) => {
                warn!("Ring alert check failed: {}", e);
                return idle;
            }
        }

        info!("  Ring alert detected");
        match self.exchange() {
            Ok(inbound) => CycleReport {
                outcome: CycleOutcome::RingDrained,
                inbound,
            },
            Err(e) if e.is_abort() => CycleReport {
                outcome: CycleOutcome::Aborted,
                inbound: 0,
            },
            Err(e) => {
                error!("Ring alert exchange failed: {}", e);
                idle
            }
        }
    }

    /// Run a session and post every MT message it returns.
    fn exchange(&mut self) -> Result<usize, ExchangeError> {
        let messages = self.bearer.exchange_session()?;
        let mut posted = 0;
        for message in &messages {
            self.counters.messages_received += 1;
            match self.inbound.post(message) {
                Ok(path) => {
                    info!("  - inbound message ({} bytes) -> {}", message.len(), path.display());
                    posted += 1;
                }
                Err(e) => error!("Failed to post inbound message: {}", e),
            }
        }
        Ok(posted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockfile::{LockFile, LockPolicy};
    use crate::modem::link::ScriptedLink;
    use crate::modem::ModemSettings;
    use std::sync::{Arc, Mutex};
    use tempfile::{tempdir, TempDir};

    type Written = Arc<Mutex<Vec<Vec<u8>>>>;

    fn reply(line: &str) -> Vec<u8> {
        format!("\r\n{}\r\n\r\nOK\r\n", line).into_bytes()
    }

    fn settings() -> ModemSettings {
        ModemSettings {
            command_timeout: Duration::from_millis(200),
            read_poll: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            min_signal: 2,
            signal_timeout: Duration::from_millis(20),
            session_timeout: Duration::from_secs(5),
            retry_delay: Duration::ZERO,
            lock: LockPolicy {
                attempts: 1,
                busy_wait: Duration::ZERO,
                max_retries: 0,
                wait_interval: Duration::ZERO,
            },
        }
    }

    fn modem_scheduler<I, R>(
        responses: I,
        sources: Vec<Source>,
    ) -> (ExchangeScheduler<Modem>, Written, TempDir)
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[u8]>,
    {
        let dir = tempdir().unwrap();
        let (link, written) = ScriptedLink::new(responses);
        let modem = Modem::new(
            Box::new(link),
            LockFile::new(dir.path().join("LCK..iridium")),
            settings(),
            Arc::new(AtomicBool::new(true)),
        );
        let inbound = FileDrop::new(dir.path().join("inbound"));
        (ExchangeScheduler::new(sources, modem, inbound), written, dir)
    }

    fn commands(written: &Written) -> Vec<String> {
        written
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.ends_with(b"\r"))
            .map(|w| String::from_utf8_lossy(w).trim_end().to_string())
            .collect()
    }

    #[test]
    fn modem_cycle_sends_file_with_source_prefix() {
        let spool = tempdir().unwrap();
        std::fs::write(spool.path().join("gps-20240101-000000.dat"), b"fix").unwrap();
        let source = Source::new("gps", 9, format!("{}/*.dat", spool.path().display()), 1, None).unwrap();

        let (mut s, written, dir) = modem_scheduler(
            [
                b"\r\nOK\r\n".to_vec(),
                b"\r\nREADY\r\n".to_vec(),
                reply("0"),
                reply("+CSQ:4"),
                reply("+SBDIX: 0, 7, 0, 0, 0, 0"),
                reply("0"),
            ],
            vec![source],
        );

        let report = s.tick();
        assert_eq!(report.outcome, CycleOutcome::Sent { sent: 1, failed: 0 });
        assert_eq!(
            commands(&written),
            vec!["AT", "AT+SBDWB=4", "AT+CSQ", "AT+SBDIXA", "AT+SBDD0"]
        );
        assert!(written.lock().unwrap().contains(&b"\x09fix\x01\x50".to_vec()));
        assert!(!spool.path().join("gps-20240101-000000.dat").exists());
        assert!(!dir.path().join("LCK..iridium").exists());
    }

    #[test]
    fn modem_ring_alert_drains_mt_message() {
        let body = b"\x00reboot";
        let mut sbdrt = b"\r\n+SBDRT:\r".to_vec();
        sbdrt.extend_from_slice(body);
        sbdrt.extend_from_slice(b"\r\n\r\nOK\r\n");

        let (mut s, written, dir) = modem_scheduler(
            [
                b"\r\nOK\r\n".to_vec(),
                reply("+CSQ:3"),
                reply("+SBDSX: 0, 4, 0, -1, 1, 1"),
                reply("+CSQ:3"),
                reply(&format!("+SBDIX: 0, 5, 1, 8, {}, 0", body.len())),
                reply("0"),
                sbdrt,
            ],
            Vec::new(),
        );

        let report = s.tick();
        assert_eq!(report.outcome, CycleOutcome::RingDrained);
        assert_eq!(report.inbound, 1);
        assert_eq!(
            commands(&written),
            vec!["AT", "AT+CSQ", "AT+SBDSX", "AT+CSQ", "AT+SBDIXA", "AT+SBDD0", "AT+SBDRT"]
        );

        let pending = FileDrop::new(dir.path().join("inbound")).pending().unwrap();
        assert_eq!(std::fs::read(&pending[0]).unwrap(), body.to_vec());
    }

    #[test]
    fn modem_without_signal_skips_ring_check_after_signal_timeout() {
        let responses: Vec<Vec<u8>> = std::iter::once(b"\r\nOK\r\n".to_vec())
            .chain((0..10_000).map(|_| reply("+CSQ:1")))
            .collect();
        let (mut s, written, _dir) = modem_scheduler(responses, Vec::new());

        let started = Instant::now();
        assert_eq!(s.tick().outcome, CycleOutcome::Idle);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!commands(&written).iter().any(|c| c == "AT+SBDSX"));
    }
}
