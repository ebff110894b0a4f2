//! # Iridium SBD Modem Driver
//!
//! Drives a 960x-series Short Burst Data transceiver over its AT command set:
//!
//! - readiness probe (`AT`)
//! - signal quality (`AT+CSQ`, cached `AT+CSQF`)
//! - mobile-originated buffer write with checksum (`AT+SBDWB`)
//! - mobile-terminated buffer read (`AT+SBDRT`)
//! - status and ring-alert query (`AT+SBDSX`)
//! - the combined MO/MT session (`AT+SBDIXA`)
//!
//! Every public operation holds the device's [`LockFile`] for its whole duration
//! through a [`LockGuard`], so collector processes sharing the modem never
//! interleave commands.
//!
//! Responses are read one byte at a time until a terminator matches. Waits are
//! cut short when the shared running flag is cleared, which surfaces as
//! [`ModemError::Abort`] rather than a timeout.

pub mod link;

pub use link::SerialLink;

use crate::lockfile::{LockFile, LockGuard, LockPolicy};
use crate::logutil::escape_bytes;
use log::{debug, error, info, trace, warn};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Largest MO message the transceiver accepts in one `AT+SBDWB`.
pub const MAX_MO_PAYLOAD: usize = 340;

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("timed out waiting for modem")]
    Timeout,

    #[error("aborted by shutdown")]
    Abort,

    #[error("modem lock is busy")]
    LockBusy,

    #[error("modem protocol error: {0}")]
    Protocol(String),

    #[error("session rejected: {0}")]
    Rejected(String),

    #[error("payload of {0} bytes exceeds the {MAX_MO_PAYLOAD} byte MO limit")]
    PayloadTooLarge(usize),

    #[error("serial io error: {0}")]
    Io(#[from] io::Error),
}

/// Driver timing and thresholds.
#[derive(Debug, Clone)]
pub struct ModemSettings {
    /// Deadline for a single command/response exchange.
    pub command_timeout: Duration,
    /// Sleep between empty receive-buffer polls.
    pub read_poll: Duration,
    /// Sleep between signal level polls and the granularity of other waits.
    pub poll_interval: Duration,
    /// Bars required before a session is attempted.
    pub min_signal: u8,
    pub signal_timeout: Duration,
    pub session_timeout: Duration,
    /// Back-off after the gateway could not be reached.
    pub retry_delay: Duration,
    pub lock: LockPolicy,
}

impl Default for ModemSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            read_poll: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            min_signal: 2,
            signal_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(300),
            retry_delay: Duration::from_secs(15),
            lock: LockPolicy::default(),
        }
    }
}

/// Terminators that end a response read.
#[derive(Debug, Clone, Copy)]
struct Expect {
    success: &'static [u8],
    error: Option<&'static [u8]>,
    reject: Option<&'static [u8]>,
}

impl Expect {
    const OK: Expect = Expect {
        success: b"OK",
        error: Some(b"ERROR"),
        reject: Some(b"NO CARRIER"),
    };

    const READY: Expect = Expect {
        success: b"READY",
        error: Some(b"ERROR"),
        reject: Some(b"NO CARRIER"),
    };

    // Echo and prefix ahead of an MT payload of known length.
    const PAYLOAD_START: Expect = Expect {
        success: b"+SBDRT:\r",
        error: Some(b"ERROR"),
        reject: None,
    };

    // MT payloads are arbitrary bytes; only a full final result line ends the read.
    const PAYLOAD_OK: Expect = Expect {
        success: b"\r\nOK\r\n",
        error: None,
        reject: None,
    };
}

/// `+SBDIX` session result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub mo_status: i32,
    pub mo_msn: i32,
    pub mt_status: i32,
    pub mt_msn: i32,
    pub mt_length: i32,
    pub mt_queued: i32,
}

/// `+SBDSX` buffer and ring-alert status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbdStatus {
    pub mo_flag: bool,
    pub mo_msn: i32,
    pub mt_flag: bool,
    pub mt_msn: i32,
    pub ring_alert: bool,
    pub messages_waiting: i32,
}

/// `+CRIS` ring indication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingIndication {
    pub telephony: i32,
    pub sbd: i32,
}

/// Progress of one `exchange_session` call.
#[derive(Debug, Default)]
struct Session {
    mo_settled: bool,
    mt_settled: bool,
    mt_queued: i32,
    attempts: u32,
    messages: Vec<Vec<u8>>,
}

impl Session {
    fn is_settled(&self) -> bool {
        self.mo_settled && self.mt_settled && self.mt_queued <= 0
    }
}

/// Big-endian 16-bit sum of the payload bytes, appended after an `AT+SBDWB` body.
pub fn write_checksum(payload: &[u8]) -> u16 {
    payload
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// SBD transceiver behind an exclusive device lock.
pub struct Modem {
    lock: LockFile,
    io: ModemIo,
}

/// The unlocked half of the driver: everything that talks to the link.
struct ModemIo {
    link: Box<dyn SerialLink>,
    running: Arc<AtomicBool>,
    settings: ModemSettings,
}

impl Modem {
    pub fn new(
        link: Box<dyn SerialLink>,
        lock: LockFile,
        settings: ModemSettings,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            lock,
            io: ModemIo {
                link,
                running,
                settings,
            },
        }
    }

    /// Open a modem on a serial device, locking through `lock_path`.
    #[cfg(feature = "serial")]
    pub fn open(
        device: &std::path::Path,
        lock_path: &std::path::Path,
        baud_rate: u32,
        io_timeout: Duration,
        settings: ModemSettings,
        running: Arc<AtomicBool>,
    ) -> Result<Self, ModemError> {
        info!(
            "Opening Iridium modem on {} at {} baud",
            device.display(),
            baud_rate
        );
        let port = link::open_serial(device, baud_rate, io_timeout)?;
        Ok(Self::new(
            Box::new(port),
            LockFile::new(lock_path),
            settings,
            running,
        ))
    }

    pub fn settings(&self) -> &ModemSettings {
        &self.io.settings
    }

    pub fn is_running(&self) -> bool {
        self.io.is_running()
    }

    /// Run `op` while holding the device lock. The guard releases on every path.
    fn locked<T>(
        &mut self,
        op: impl FnOnce(&mut ModemIo) -> Result<T, ModemError>,
    ) -> Result<T, ModemError> {
        let _guard = LockGuard::acquire(&self.lock, &self.io.settings.lock)?
            .ok_or(ModemError::LockBusy)?;
        op(&mut self.io)
    }

    /// Ping the modem.
    pub fn ready(&mut self) -> Result<(), ModemError> {
        self.locked(|io| io.command(b"AT", Expect::OK).map(|_| ()))
    }

    /// Signal level in bars (0-5).
    pub fn get_signal_level(&mut self) -> Result<u8, ModemError> {
        self.locked(|io| io.signal_level())
    }

    /// Last cached signal level, without a fresh measurement.
    pub fn get_signal_level_fast(&mut self) -> Result<u8, ModemError> {
        self.locked(|io| {
            let value = io.query(b"AT+CSQF", b"+CSQF")?;
            parse_bars(&value)
        })
    }

    /// Poll until at least `min_bars` are reported or `timeout` elapses.
    pub fn wait_for_signal(&mut self, min_bars: u8, timeout: Duration) -> Result<u8, ModemError> {
        self.locked(|io| io.wait_for_signal(min_bars, timeout))
    }

    /// Load `payload` into the MO buffer.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<(), ModemError> {
        self.locked(|io| io.write_message(payload))
    }

    /// Read the MT buffer, stopping at the first final `OK` line.
    /// A payload that itself contains `\r\nOK\r\n` comes back cut short; use
    /// [`Modem::read_message_exact`] when the length is known.
    pub fn read_message(&mut self) -> Result<Vec<u8>, ModemError> {
        self.locked(|io| io.read_message())
    }

    /// Read an MT payload of exactly `length` bytes (as reported by `+SBDIX`).
    pub fn read_message_exact(&mut self, length: usize) -> Result<Vec<u8>, ModemError> {
        self.locked(|io| io.read_message_exact(length))
    }

    pub fn status(&mut self) -> Result<SbdStatus, ModemError> {
        self.locked(|io| io.status())
    }

    pub fn ring_indication(&mut self) -> Result<RingIndication, ModemError> {
        self.locked(|io| {
            let value = io.query(b"AT+CRIS", b"+CRIS")?;
            let [telephony, sbd] = parse_fields::<2>(&value)?;
            Ok(RingIndication { telephony, sbd })
        })
    }

    /// Drop DTR for `delay`, then raise it again.
    pub fn toggle_dtr(&mut self, delay: Duration) -> Result<(), ModemError> {
        self.locked(|io| {
            io.link.set_dtr(false)?;
            io.wait(delay);
            io.link.set_dtr(true)?;
            Ok(())
        })
    }

    /// Run SBD sessions until the MO buffer is delivered and no MT traffic is
    /// left, returning the MT messages received along the way.
    pub fn exchange_session(&mut self, timeout: Duration) -> Result<Vec<Vec<u8>>, ModemError> {
        self.locked(|io| io.exchange_session(timeout))
    }
}

impl ModemIo {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), ModemError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ModemError::Abort)
        }
    }

    /// Sleep for `delay` in poll-sized steps, returning early on shutdown.
    fn wait(&self, delay: Duration) {
        let end = Instant::now() + delay;
        while self.is_running() {
            let now = Instant::now();
            if now >= end {
                break;
            }
            sleep((end - now).min(self.settings.poll_interval));
        }
    }

    fn read_until(&mut self, expect: Expect, timeout: Duration) -> Result<Vec<u8>, ModemError> {
        debug!("Waiting for '{}'", escape_bytes(expect.success));

        let deadline = Instant::now() + timeout;
        let mut response = Vec::new();
        let mut byte = [0u8; 1];

        while self.is_running() {
            if Instant::now() > deadline {
                debug!("  - timeout, have '{}'", escape_bytes(&response));
                return Err(ModemError::Timeout);
            }

            if self.link.bytes_to_read()? == 0 {
                sleep(self.settings.read_poll);
                continue;
            }

            match self.link.read(&mut byte) {
                Ok(1) => response.push(byte[0]),
                Ok(_) => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }

            trace!("Response: {}", escape_bytes(&response));

            if response.ends_with(expect.success) {
                debug!("  - found expect: {}", escape_bytes(&response));
                return Ok(response);
            }

            if let Some(reject) = expect.reject {
                if response.ends_with(reject) {
                    debug!("  - found reject");
                    return Err(ModemError::Rejected(escape_bytes(&response)));
                }
            }

            if let Some(error) = expect.error {
                if response.ends_with(error) {
                    debug!("  - found error");
                    return Err(ModemError::Protocol(escape_bytes(&response)));
                }
            }
        }

        debug!("  - abort");
        Err(ModemError::Abort)
    }

    /// Send one AT command and read its response.
    fn command(&mut self, cmd: &[u8], expect: Expect) -> Result<Vec<u8>, ModemError> {
        self.ensure_running()?;
        self.link.discard_input()?;
        let mut frame = Vec::with_capacity(cmd.len() + 1);
        frame.extend_from_slice(cmd);
        frame.push(b'\r');
        debug!("Send: {}", escape_bytes(cmd));
        self.link.write_all(&frame)?;
        self.link.flush()?;
        self.read_until(expect, self.settings.command_timeout)
    }

    /// Send a command and return the value of its `<prefix>:` result line.
    fn query(&mut self, cmd: &[u8], prefix: &[u8]) -> Result<String, ModemError> {
        let response = self.command(cmd, Expect::OK)?;
        split_result(prefix, &response)
    }

    fn signal_level(&mut self) -> Result<u8, ModemError> {
        let value = self.query(b"AT+CSQ", b"+CSQ")?;
        parse_bars(&value)
    }

    fn wait_for_signal(&mut self, min_bars: u8, timeout: Duration) -> Result<u8, ModemError> {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline && self.is_running() {
            let level = self.signal_level()?;
            if level >= min_bars {
                return Ok(level);
            }
            info!("    level={}", level);
            self.wait(self.settings.poll_interval);
        }

        self.ensure_running()?;
        Err(ModemError::Timeout)
    }

    fn write_message(&mut self, payload: &[u8]) -> Result<(), ModemError> {
        if payload.len() > MAX_MO_PAYLOAD {
            return Err(ModemError::PayloadTooLarge(payload.len()));
        }

        let checksum = write_checksum(payload);
        debug!(
            "write_message: {} bytes, checksum=0x{:04x}",
            payload.len(),
            checksum
        );

        self.command(format!("AT+SBDWB={}", payload.len()).as_bytes(), Expect::READY)?;

        debug!("Sending message and checksum");
        let mut frame = Vec::with_capacity(payload.len() + 2);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&checksum.to_be_bytes());
        self.link.write_all(&frame)?;
        self.link.flush()?;

        let response = self.read_until(Expect::OK, self.settings.command_timeout)?;
        match first_number(&response) {
            None | Some(0) => Ok(()),
            Some(1) => Err(ModemError::Protocol("SBDWB: write timeout".into())),
            Some(2) => Err(ModemError::Protocol("SBDWB: checksum mismatch".into())),
            Some(3) => Err(ModemError::Protocol("SBDWB: message size rejected".into())),
            Some(other) => Err(ModemError::Protocol(format!("SBDWB: status {}", other))),
        }
    }

    fn read_message(&mut self) -> Result<Vec<u8>, ModemError> {
        let response = self.command(b"AT+SBDRT", Expect::PAYLOAD_OK)?;
        extract_sbdrt(&response)
    }

    fn read_message_exact(&mut self, length: usize) -> Result<Vec<u8>, ModemError> {
        self.command(b"AT+SBDRT", Expect::PAYLOAD_START)?;
        let body = self.read_exact(length, self.settings.command_timeout)?;
        self.read_until(Expect::PAYLOAD_OK, self.settings.command_timeout)?;
        Ok(body)
    }

    /// Read exactly `len` raw bytes, with no terminator matching.
    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, ModemError> {
        let deadline = Instant::now() + timeout;
        let mut body = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            self.ensure_running()?;
            if Instant::now() > deadline {
                debug!("  - timeout after {} of {} payload bytes", filled, len);
                return Err(ModemError::Timeout);
            }

            if self.link.bytes_to_read()? == 0 {
                sleep(self.settings.read_poll);
                continue;
            }

            match self.link.read(&mut body[filled..]) {
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }

        trace!("Payload: {}", escape_bytes(&body));
        Ok(body)
    }

    fn clear_mo_buffer(&mut self) -> Result<(), ModemError> {
        self.command(b"AT+SBDD0", Expect::OK)?;
        info!("  - send buffer cleared");
        Ok(())
    }

    fn status(&mut self) -> Result<SbdStatus, ModemError> {
        let value = self.query(b"AT+SBDSX", b"+SBDSX")?;
        let v = parse_fields::<6>(&value)?;
        Ok(SbdStatus {
            mo_flag: v[0] != 0,
            mo_msn: v[1],
            mt_flag: v[2] != 0,
            mt_msn: v[3],
            ring_alert: v[4] != 0,
            messages_waiting: v[5],
        })
    }

    fn initiate_session(&mut self) -> Result<SessionStatus, ModemError> {
        let value = self.query(b"AT+SBDIXA", b"+SBDIX")?;
        let v = parse_fields::<6>(&value)?;
        Ok(SessionStatus {
            mo_status: v[0],
            mo_msn: v[1],
            mt_status: v[2],
            mt_msn: v[3],
            mt_length: v[4],
            mt_queued: v[5],
        })
    }

    fn exchange_session(&mut self, timeout: Duration) -> Result<Vec<Vec<u8>>, ModemError> {
        let deadline = Instant::now() + timeout;
        let mut session = Session::default();

        while !session.is_settled() {
            self.ensure_running()?;
            session.attempts += 1;

            info!("SBD exchange: attempt {}", session.attempts);

            if Instant::now() > deadline {
                if session.mo_settled {
                    warn!(
                        "SBD exchange timed out with MT traffic pending ({} queued)",
                        session.mt_queued
                    );
                    return Ok(session.messages);
                }
                return Err(ModemError::Timeout);
            }

            match self.wait_for_signal(self.settings.min_signal, self.settings.signal_timeout) {
                Ok(level) => info!("  - good signal: {}", level),
                Err(ModemError::Abort) => return Err(ModemError::Abort),
                Err(e) => {
                    info!("  - no signal: {}", e);
                    continue;
                }
            }

            info!("  - sending");

            let status = match self.initiate_session() {
                Ok(status) => status,
                Err(e) => {
                    error!("  - failed to run SBDIX: {}", e);
                    return Err(e);
                }
            };

            info!("  - mo_status={}", status.mo_status);
            info!("  - mt_status={}", status.mt_status);
            info!("  - mt_queued={}", status.mt_queued);

            match status.mo_status {
                0..=4 => {
                    info!("  - MO send OK");
                    self.clear_mo_buffer()?;
                    session.mo_settled = true;
                }
                12 | 14 | 16 => {
                    // Settle anyway so a message the gateway refuses is not resent forever.
                    error!(
                        "  - invalid message (MO status {}), dropping it",
                        status.mo_status
                    );
                    self.clear_mo_buffer()?;
                    session.mo_settled = true;
                }
                other => {
                    info!("    - failed to connect to gateway (MO status {})", other);
                    self.wait(self.settings.retry_delay);
                }
            }

            match status.mt_status {
                0 => session.mt_settled = true,
                1 => {
                    info!("  - pending message ({} bytes)", status.mt_length);
                    let message = match usize::try_from(status.mt_length) {
                        Ok(length) if length > 0 => self.read_message_exact(length)?,
                        _ => self.read_message()?,
                    };
                    if !message.is_empty() {
                        session.messages.push(message);
                    }
                    session.mt_settled = true;
                }
                _ => session.mt_settled = false,
            }

            session.mt_queued = status.mt_queued;

            info!("  - done");
        }

        Ok(session.messages)
    }
}

/// Value after the colon on the first line that starts with `prefix`.
fn split_result(prefix: &[u8], response: &[u8]) -> Result<String, ModemError> {
    for line in response.split(|&b| b == b'\n') {
        let line = trim_ascii(line);
        if line.starts_with(prefix) {
            if let Some(pos) = line.iter().position(|&b| b == b':') {
                return Ok(String::from_utf8_lossy(trim_ascii(&line[pos + 1..])).into_owned());
            }
        }
    }
    Err(ModemError::Protocol(format!(
        "prefix '{}' not found in '{}'",
        String::from_utf8_lossy(prefix),
        escape_bytes(response)
    )))
}

fn parse_bars(value: &str) -> Result<u8, ModemError> {
    match value.trim().parse::<u8>() {
        Ok(bars) if bars <= 5 => Ok(bars),
        _ => Err(ModemError::Protocol(format!("bad signal level '{}'", value))),
    }
}

fn parse_fields<const N: usize>(value: &str) -> Result<[i32; N], ModemError> {
    let mut out = [0i32; N];
    let mut count = 0;
    for field in value.split(',') {
        if count == N {
            count += 1;
            break;
        }
        out[count] = field
            .trim()
            .parse()
            .map_err(|_| ModemError::Protocol(format!("bad status field in '{}'", value)))?;
        count += 1;
    }
    if count != N {
        return Err(ModemError::Protocol(format!(
            "expected {} status fields in '{}'",
            N, value
        )));
    }
    Ok(out)
}

/// First line of a response that is a bare integer (SBDWB/SBDD result codes).
fn first_number(response: &[u8]) -> Option<i32> {
    response
        .split(|&b| b == b'\n')
        .map(trim_ascii)
        .filter(|line| !line.is_empty() && line.iter().all(u8::is_ascii_digit))
        .find_map(|line| std::str::from_utf8(line).ok()?.parse().ok())
}

/// Payload between `+SBDRT:\r` and the final `OK`.
fn extract_sbdrt(response: &[u8]) -> Result<Vec<u8>, ModemError> {
    const MARKER: &[u8] = b"+SBDRT:\r";
    let start = response
        .windows(MARKER.len())
        .position(|w| w == MARKER)
        .ok_or_else(|| ModemError::Protocol(format!("no SBDRT payload in '{}'", escape_bytes(response))))?
        + MARKER.len();

    let mut body = &response[start..];
    body = body.strip_suffix(Expect::PAYLOAD_OK.success).unwrap_or(body);
    body = body.strip_suffix(b"\r\n").unwrap_or(body);
    Ok(body.to_vec())
}

fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = s {
        if first.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = s {
        if last.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::link::ScriptedLink;
    use super::*;
    use tempfile::{tempdir, TempDir};

    const OK: &[u8] = b"\r\nOK\r\n";

    fn fast_settings() -> ModemSettings {
        ModemSettings {
            command_timeout: Duration::from_millis(200),
            read_poll: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            min_signal: 2,
            signal_timeout: Duration::from_millis(200),
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

    fn modem_with<I, R>(responses: I) -> (Modem, Arc<std::sync::Mutex<Vec<Vec<u8>>>>, TempDir)
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[u8]>,
    {
        let dir = tempdir().unwrap();
        let (link, written) = ScriptedLink::new(responses);
        let modem = Modem::new(
            Box::new(link),
            LockFile::new(dir.path().join("LCK..iridium")),
            fast_settings(),
            Arc::new(AtomicBool::new(true)),
        );
        (modem, written, dir)
    }

    fn reply(line: &str) -> Vec<u8> {
        let mut out = format!("\r\n{}\r\n", line).into_bytes();
        out.extend_from_slice(OK);
        out
    }

    fn sbdix(mo: i32, mt: i32, queued: i32) -> Vec<u8> {
        sbdix_len(mo, mt, 5, queued)
    }

    fn sbdix_len(mo: i32, mt: i32, length: usize, queued: i32) -> Vec<u8> {
        reply(&format!("+SBDIX: {}, 12, {}, 3, {}, {}", mo, mt, length, queued))
    }

    fn sbdrt(body: &[u8]) -> Vec<u8> {
        let mut out = b"\r\n+SBDRT:\r".to_vec();
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(OK);
        out
    }

    fn commands(written: &Arc<std::sync::Mutex<Vec<Vec<u8>>>>) -> Vec<String> {
        written
            .lock()
            .unwrap()
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim_end().to_string())
            .collect()
    }

    #[test]
    fn checksum_is_truncated_byte_sum() {
        assert_eq!(write_checksum(&[0x01, 0x02, 0x03]), 0x0006);
        assert_eq!(write_checksum(&[0xFF; 300]), (0xFFu32 * 300) as u16);
        assert_eq!(write_checksum(&[0xFF; 300]).to_be_bytes(), [0x2A, 0xD4]);
    }

    #[test]
    fn toggle_dtr_drops_then_raises() {
        let (mut modem, written, dir) = modem_with(Vec::<Vec<u8>>::new());
        modem.toggle_dtr(Duration::from_millis(5)).unwrap();
        assert_eq!(commands(&written), vec!["DTR0", "DTR1"]);
        assert!(!dir.path().join("LCK..iridium").exists());
    }

    #[test]
    fn ready_sends_at_and_releases_lock() {
        let (mut modem, written, dir) = modem_with([OK.to_vec()]);
        modem.ready().unwrap();
        assert_eq!(commands(&written), vec!["AT"]);
        assert!(!dir.path().join("LCK..iridium").exists());
    }

    #[test]
    fn signal_level_parses_bars() {
        let (mut modem, _, _dir) = modem_with([reply("+CSQ:4")]);
        assert_eq!(modem.get_signal_level().unwrap(), 4);

        let (mut modem, _, _dir) = modem_with([reply("+CSQF:1")]);
        assert_eq!(modem.get_signal_level_fast().unwrap(), 1);
    }

    #[test]
    fn wait_for_signal_polls_until_threshold() {
        let (mut modem, written, _dir) =
            modem_with([reply("+CSQ:0"), reply("+CSQ:1"), reply("+CSQ:3")]);
        assert_eq!(modem.wait_for_signal(2, Duration::from_secs(2)).unwrap(), 3);
        assert_eq!(commands(&written).len(), 3);
    }

    #[test]
    fn wait_for_signal_times_out() {
        let responses: Vec<Vec<u8>> = (0..1000).map(|_| reply("+CSQ:0")).collect();
        let (mut modem, _, _dir) = modem_with(responses);
        assert!(matches!(
            modem.wait_for_signal(2, Duration::from_millis(20)),
            Err(ModemError::Timeout)
        ));
    }

    #[test]
    fn error_terminator_is_protocol_error() {
        let (mut modem, _, dir) = modem_with([b"\r\nERROR".to_vec()]);
        assert!(matches!(modem.ready(), Err(ModemError::Protocol(_))));
        assert!(!dir.path().join("LCK..iridium").exists());
    }

    #[test]
    fn reject_terminator_is_rejected_session() {
        let (mut modem, _, _dir) = modem_with([b"\r\nNO CARRIER".to_vec()]);
        assert!(matches!(modem.ready(), Err(ModemError::Rejected(_))));
    }

    #[test]
    fn silent_modem_times_out() {
        let (mut modem, _, dir) = modem_with(Vec::<Vec<u8>>::new());
        assert!(matches!(modem.ready(), Err(ModemError::Timeout)));
        assert!(!dir.path().join("LCK..iridium").exists());
    }

    #[test]
    fn shutdown_aborts_instead_of_timing_out() {
        let (mut modem, _, _dir) = modem_with(Vec::<Vec<u8>>::new());
        modem.io.running.store(false, Ordering::SeqCst);
        assert!(matches!(modem.ready(), Err(ModemError::Abort)));
    }

    #[test]
    fn busy_lock_prevents_operation() {
        let (mut modem, written, dir) = modem_with([OK.to_vec()]);
        let path = dir.path().join("LCK..iridium");
        // pid 1 is always alive.
        std::fs::write(&path, "1").unwrap();

        assert!(matches!(modem.ready(), Err(ModemError::LockBusy)));
        assert!(written.lock().unwrap().is_empty());
        assert!(path.exists());
    }

    #[test]
    fn write_message_appends_checksum() {
        let (mut modem, written, _dir) =
            modem_with([b"\r\nREADY\r\n".to_vec(), reply("0")]);
        modem.write_message(&[0x01, 0x02, 0x03]).unwrap();

        let w = written.lock().unwrap();
        assert_eq!(w[0], b"AT+SBDWB=3\r");
        assert_eq!(w[1], vec![0x01, 0x02, 0x03, 0x00, 0x06]);
    }

    #[test]
    fn write_message_reports_checksum_failure() {
        let (mut modem, _, _dir) = modem_with([b"\r\nREADY\r\n".to_vec(), reply("2")]);
        assert!(matches!(
            modem.write_message(b"abc"),
            Err(ModemError::Protocol(msg)) if msg.contains("checksum")
        ));
    }

    #[test]
    fn write_message_rejects_oversized_payload() {
        let (mut modem, written, _dir) = modem_with(Vec::<Vec<u8>>::new());
        assert!(matches!(
            modem.write_message(&[0u8; MAX_MO_PAYLOAD + 1]),
            Err(ModemError::PayloadTooLarge(_))
        ));
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn read_message_extracts_binary_payload() {
        let body = b"\x02\x00OK\x00ERROR\r\nbin";
        let (mut modem, _, _dir) = modem_with([sbdrt(body)]);
        assert_eq!(modem.read_message().unwrap(), body.to_vec());
    }

    #[test]
    fn read_message_exact_keeps_embedded_ok_line() {
        let body = b"ab\r\nOK\r\ncd";
        let (mut modem, _, _dir) = modem_with([sbdrt(body)]);
        assert_eq!(modem.read_message_exact(body.len()).unwrap(), body.to_vec());
    }

    #[test]
    fn session_reads_mt_payload_by_reported_length() {
        let body = b"line one\r\nOK\r\nline two";
        let (mut modem, written, _dir) = modem_with([
            reply("+CSQ:5"),
            sbdix_len(0, 1, body.len(), 0),
            reply("0"),
            sbdrt(body),
        ]);
        let messages = modem.exchange_session(Duration::from_secs(5)).unwrap();
        assert_eq!(messages, vec![body.to_vec()]);
        assert_eq!(commands(&written).last().unwrap(), "AT+SBDRT");
    }

    #[test]
    fn status_reports_ring_alert() {
        let (mut modem, _, _dir) = modem_with([reply("+SBDSX: 0, 4, 0, -1, 1, 2")]);
        let status = modem.status().unwrap();
        assert!(status.ring_alert);
        assert!(!status.mo_flag);
        assert_eq!(status.mt_msn, -1);
        assert_eq!(status.messages_waiting, 2);
    }

    #[test]
    fn ring_indication_reports_sbd_ring() {
        let (mut modem, written, _dir) = modem_with([reply("+CRIS:000,001")]);
        let ring = modem.ring_indication().unwrap();
        assert_eq!(ring, RingIndication { telephony: 0, sbd: 1 });
        assert_eq!(commands(&written), vec!["AT+CRIS"]);
    }

    #[test]
    fn malformed_status_is_protocol_error() {
        let (mut modem, _, _dir) = modem_with([reply("+SBDSX: 0, 4")]);
        assert!(matches!(modem.status(), Err(ModemError::Protocol(_))));
    }

    #[test]
    fn session_collects_mt_message_then_settles() {
        let (mut modem, written, dir) = modem_with([
            reply("+CSQ:5"),
            sbdix(0, 1, 1),
            reply("0"),
            sbdrt(b"hello"),
            reply("+CSQ:5"),
            sbdix(0, 0, 0),
            reply("0"),
        ]);

        let messages = modem.exchange_session(Duration::from_secs(5)).unwrap();
        assert_eq!(messages, vec![b"hello".to_vec()]);
        assert_eq!(
            commands(&written),
            vec![
                "AT+CSQ",
                "AT+SBDIXA",
                "AT+SBDD0",
                "AT+SBDRT",
                "AT+CSQ",
                "AT+SBDIXA",
                "AT+SBDD0"
            ]
        );
        assert!(!dir.path().join("LCK..iridium").exists());
    }

    #[test]
    fn session_settles_on_invalid_message_status() {
        let (mut modem, written, _dir) =
            modem_with([reply("+CSQ:3"), sbdix(14, 0, 0), reply("0")]);
        assert!(modem.exchange_session(Duration::from_secs(5)).unwrap().is_empty());
        assert_eq!(commands(&written).last().unwrap(), "AT+SBDD0");
    }

    #[test]
    fn session_retries_after_gateway_failure() {
        let (mut modem, written, _dir) = modem_with([
            reply("+CSQ:3"),
            sbdix(32, 0, 0),
            reply("+CSQ:3"),
            sbdix(1, 0, 0),
            reply("0"),
        ]);
        assert!(modem.exchange_session(Duration::from_secs(5)).unwrap().is_empty());
        let cmds = commands(&written);
        assert_eq!(cmds.iter().filter(|c| *c == "AT+SBDIXA").count(), 2);
        assert_eq!(cmds.iter().filter(|c| *c == "AT+SBDD0").count(), 1);
    }

    #[test]
    fn session_keeps_going_while_mt_queued() {
        let (mut modem, _, _dir) = modem_with([
            reply("+CSQ:5"),
            sbdix_len(0, 1, 3, 2),
            reply("0"),
            sbdrt(b"one"),
            reply("+CSQ:5"),
            sbdix_len(0, 1, 3, 0),
            reply("0"),
            sbdrt(b"two"),
        ]);
        let messages = modem.exchange_session(Duration::from_secs(5)).unwrap();
        assert_eq!(messages, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn session_timeout_without_mo_is_error() {
        let responses: Vec<Vec<u8>> = (0..10_000).map(|_| reply("+CSQ:0")).collect();
        let (mut modem, _, _dir) = modem_with(responses);
        modem.io.settings.signal_timeout = Duration::from_millis(5);
        assert!(matches!(
            modem.exchange_session(Duration::from_millis(30)),
            Err(ModemError::Timeout)
        ));
    }

    #[test]
    fn session_timeout_after_mo_returns_collected() {
        let mut responses = vec![reply("+CSQ:5"), sbdix(0, 1, 3), reply("0"), sbdrt(b"first")];
        responses.extend((0..10_000).map(|_| reply("+CSQ:0")));
        let (mut modem, _, _dir) = modem_with(responses);
        modem.io.settings.signal_timeout = Duration::from_millis(5);
        let messages = modem.exchange_session(Duration::from_millis(50)).unwrap();
        assert_eq!(messages, vec![b"first".to_vec()]);
    }

    #[test]
    fn split_result_finds_prefixed_line() {
        let response = b"AT+CSQ\r\r\n+CSQ:5\r\n\r\nOK";
        assert_eq!(split_result(b"+CSQ", response).unwrap(), "5");
        assert!(split_result(b"+SBDIX", response).is_err());
    }
}
