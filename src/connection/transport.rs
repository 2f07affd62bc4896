//! Byte-stream transport to the target device
//!
//! The serial protocol itself only needs a blocking byte stream that can be
//! closed and reopened on the same port, plus control over the reset lines.
//! [Transport] captures exactly that contract; [SerialTransport] implements
//! it on top of a serial port. Tests drive the protocol through scripted
//! in-memory implementations of the same trait.

use std::{
    io::{self, Read, Write},
    thread::sleep,
    time::Duration,
};

use serialport::SerialPort;

/// A blocking, reopenable byte stream to the target device.
///
/// All reads and writes block with the currently configured timeout. The
/// handle is exclusively owned by one [Connection](crate::connection::Connection);
/// closing and reopening it re-acquires the same underlying port rather than
/// producing a second handle.
pub trait Transport: Read + Write {
    /// Re-open the transport on the same port after [Transport::close].
    fn open(&mut self) -> io::Result<()>;

    /// Close the transport, releasing the underlying port.
    fn close(&mut self) -> io::Result<()>;

    /// Toggle the reset lines so the chip enters its serial bootloader.
    fn reset_to_download(&mut self, extra_delay: bool) -> io::Result<()>;

    /// Hard-reset the chip so it boots into user code.
    fn reset(&mut self) -> io::Result<()>;

    /// Set the timeout applied to all blocking reads and writes.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// The currently configured timeout.
    fn timeout(&self) -> Duration;

    /// Change the baud rate of the underlying port.
    fn set_baud(&mut self, baud: u32) -> io::Result<()>;

    /// The currently configured baud rate.
    fn baud(&self) -> io::Result<u32>;

    /// Discard any buffered input.
    fn clear_input(&mut self) -> io::Result<()>;
}

/// [Transport] implementation for a local serial port
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    name: String,
    baud: u32,
    timeout: Duration,
}

impl SerialTransport {
    /// Open a serial port at the given baud rate.
    pub fn open(name: &str, baud: u32) -> Result<Self, serialport::Error> {
        let mut transport = SerialTransport {
            port: None,
            name: name.into(),
            baud,
            timeout: Duration::from_secs(3),
        };
        Transport::open(&mut transport)?;
        Ok(transport)
    }

    /// The name of the underlying serial port.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port()?.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port()?.flush()
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> io::Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.name, self.baud)
            .timeout(self.timeout)
            .open()?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.port = None;
        Ok(())
    }

    fn reset_to_download(&mut self, extra_delay: bool) -> io::Result<()> {
        let port = self.port()?;

        // Classic reset sequence: EN low while IO0 is pulled down, so the
        // chip wakes up in its serial bootloader.
        port.write_data_terminal_ready(false)?;
        port.write_request_to_send(true)?;
        sleep(Duration::from_millis(100));

        port.write_data_terminal_ready(true)?;
        port.write_request_to_send(false)?;

        // Some serial adapters need a longer delay before IO0 is released
        let delay = if extra_delay { 500 } else { 50 };
        sleep(Duration::from_millis(delay));

        port.write_data_terminal_ready(false)?;

        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        let port = self.port()?;

        sleep(Duration::from_millis(100));
        port.write_request_to_send(true)?;
        sleep(Duration::from_millis(100));
        port.write_request_to_send(false)?;

        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout)?;
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.baud = baud;
        if let Some(port) = self.port.as_mut() {
            port.set_baud_rate(baud)?;
        }
        Ok(())
    }

    fn baud(&self) -> io::Result<u32> {
        Ok(self.baud)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port()?.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}
