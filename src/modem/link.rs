//! Byte transport under the modem driver.
//!
//! The driver only needs a blocking byte pipe with a readable-count probe, an
//! input purge and the DTR line. Real hardware goes through `serialport`; tests
//! drive the state machine with [`ScriptedLink`].

use std::io::{self, Read, Write};
#[cfg(feature = "serial")]
use std::path::Path;
#[cfg(feature = "serial")]
use std::time::Duration;

pub trait SerialLink: Read + Write + Send {
    /// Bytes waiting in the receive buffer.
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Drop any unread input (stale response tails, unsolicited result codes).
    fn discard_input(&mut self) -> io::Result<()>;

    /// Drive the DTR line.
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;
}

#[cfg(feature = "serial")]
use serialport::SerialPort;

#[cfg(feature = "serial")]
impl SerialLink for Box<dyn SerialPort> {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        SerialPort::bytes_to_read(self.as_ref()).map_err(io::Error::from)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        SerialPort::clear(self.as_ref(), serialport::ClearBuffer::Input).map_err(io::Error::from)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.write_data_terminal_ready(level)
            .map_err(io::Error::from)
    }
}

/// Open the modem's serial device: 8 data bits, 1 stop bit, no parity, no flow control.
#[cfg(feature = "serial")]
pub fn open_serial(device: &Path, baud_rate: u32, timeout: Duration) -> io::Result<Box<dyn SerialPort>> {
    let path = device.to_string_lossy();
    let port = serialport::new(path.as_ref(), baud_rate)
        .timeout(timeout)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(io::Error::from)?;
    port.clear(serialport::ClearBuffer::All)
        .map_err(io::Error::from)?;
    log::debug!("Serial port {} opened at {} baud", path, baud_rate);
    Ok(port)
}

/// In-memory modem: every `write` call consumes the next scripted response.
#[cfg(test)]
pub(crate) struct ScriptedLink {
    rx: std::collections::VecDeque<u8>,
    responses: std::collections::VecDeque<Vec<u8>>,
    written: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
}

#[cfg(test)]
impl ScriptedLink {
    /// Returns the link and a handle to everything written to it.
    pub(crate) fn new<I, R>(responses: I) -> (Self, std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>)
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[u8]>,
    {
        let written = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let link = Self {
            rx: Default::default(),
            responses: responses.into_iter().map(|r| r.as_ref().to_vec()).collect(),
            written: written.clone(),
        };
        (link, written)
    }
}

#[cfg(test)]
impl Read for ScriptedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no scripted data"));
        }
        let n = buf.len().min(self.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.rx.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

#[cfg(test)]
impl Write for ScriptedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().push(buf.to_vec());
        if let Some(response) = self.responses.pop_front() {
            self.rx.extend(response);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl SerialLink for ScriptedLink {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.rx.len() as u32)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }

    /// Recorded alongside writes as `DTR0` / `DTR1`.
    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        let marker = if level { b"DTR1" } else { b"DTR0" };
        self.written.lock().unwrap().push(marker.to_vec());
        Ok(())
    }
}
