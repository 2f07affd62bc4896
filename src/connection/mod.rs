//! Established connection with a target device
//!
//! [Connection] owns the [Transport] and layers the SLIP-framed
//! request/response protocol on top of it: command encoding, response
//! decoding and the sync/reconnect handshakes. Everything above this module
//! works in terms of [Command](command::Command)s and never touches raw
//! bytes.

use std::{
    io::{BufWriter, Write},
    thread::sleep,
    time::Duration,
};

use log::debug;
use slip_codec::SlipDecoder;

use self::{
    command::{Command, CommandType},
    encoder::SlipEncoder,
    transport::Transport,
};
use crate::error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind};

pub mod command;
pub mod transport;

const MAX_CONNECT_ATTEMPTS: usize = 7;
const MAX_SYNC_ATTEMPTS: usize = 5;
pub(crate) const DEFAULT_CONNECT_ATTEMPTS: usize = 7;

/// Number of status bytes trailing every response, ROM loaders use four
const ROM_STATUS_BYTES: usize = 4;
/// The stub loader only sends the two meaningful status bytes
const STUB_STATUS_BYTES: usize = 2;

/// The value attached to a command response
#[derive(Debug, Clone)]
pub enum CommandResponseValue {
    ValueU32(u32),
    ValueU128(u128),
    Vector(Vec<u8>),
}

impl TryFrom<CommandResponseValue> for u32 {
    type Error = Error;

    fn try_from(value: CommandResponseValue) -> Result<u32, Error> {
        match value {
            CommandResponseValue::ValueU32(value) => Ok(value),
            _ => Err(Error::InvalidResponse(
                "expected a 32-bit response value".into(),
            )),
        }
    }
}

impl TryFrom<CommandResponseValue> for u128 {
    type Error = Error;

    fn try_from(value: CommandResponseValue) -> Result<u128, Error> {
        match value {
            CommandResponseValue::ValueU128(value) => Ok(value),
            _ => Err(Error::InvalidResponse(
                "expected a 128-bit response value".into(),
            )),
        }
    }
}

impl TryFrom<CommandResponseValue> for Vec<u8> {
    type Error = Error;

    fn try_from(value: CommandResponseValue) -> Result<Vec<u8>, Error> {
        match value {
            CommandResponseValue::Vector(value) => Ok(value),
            _ => Err(Error::InvalidResponse(
                "expected a response payload".into(),
            )),
        }
    }
}

/// A response from a target device following a command
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub resp: u8,
    pub return_op: u8,
    pub return_length: u16,
    pub value: CommandResponseValue,
    pub status: u8,
    pub error: u8,
}

/// An established connection with a target device
pub struct Connection {
    transport: Box<dyn Transport>,
    decoder: SlipDecoder,
    status_bytes: usize,
    pub(crate) secure_download_mode: bool,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Connection {
            transport,
            decoder: SlipDecoder::new(),
            status_bytes: ROM_STATUS_BYTES,
            secure_download_mode: false,
        }
    }

    /// Initialize the connection: reset the chip into its bootloader and sync
    /// with it.
    pub fn begin(&mut self) -> Result<(), Error> {
        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            match self.connect_attempt(attempt % 2 == 1) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    debug!("Connection attempt failed, error {:#?}, retrying", e);
                }
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    fn connect_attempt(&mut self, extra_delay: bool) -> Result<(), Error> {
        self.transport.reset_to_download(extra_delay)?;

        for _ in 0..MAX_SYNC_ATTEMPTS {
            self.transport.clear_input().ok();
            self.flush()?;

            if self.sync().is_ok() {
                return Ok(());
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Try to sync with the device for a given timeout
    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.with_timeout(CommandType::Sync.timeout(), |connection| {
            connection.command(Command::Sync)?;

            // The ROM answers a sync request several times over, drain the
            // extra responses so they are not mistaken for later replies.
            while let Ok(Some(_)) = connection.read_response() {}

            Ok(())
        })
    }

    /// Close the transport, poll for the device to come back and sync again.
    ///
    /// This re-acquires the same underlying port, it never opens a second
    /// handle.
    pub fn reconnect(&mut self) -> Result<(), Error> {
        self.transport.close()?;

        debug!("Waiting for the chip to reconnect");
        for _ in 0..DEFAULT_CONNECT_ATTEMPTS {
            sleep(Duration::from_secs(1));
            if self.transport.open().is_err() {
                continue;
            }

            self.decoder = SlipDecoder::new();
            self.status_bytes = ROM_STATUS_BYTES;
            return self.begin();
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Switch response parsing to the stub loader's framing.
    pub(crate) fn set_stub_framing(&mut self, stub: bool) {
        self.status_bytes = if stub {
            STUB_STATUS_BYTES
        } else {
            ROM_STATUS_BYTES
        };
    }

    /// Whether the device reported being in Secure Download Mode.
    pub fn secure_download_mode(&self) -> bool {
        self.secure_download_mode
    }

    /// Set the timeout for the transport
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.transport.set_timeout(timeout)?;
        Ok(())
    }

    /// Set the baud rate for the transport
    pub fn set_baud(&mut self, speed: u32) -> Result<(), Error> {
        self.transport.set_baud(speed)?;
        Ok(())
    }

    /// Get the current baud rate of the transport
    pub fn baud(&self) -> Result<u32, Error> {
        Ok(self.transport.baud()?)
    }

    /// Hard-reset the device so it runs user code.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.transport.reset()?;
        Ok(())
    }

    /// Run a closure with a different transport timeout, restoring the
    /// previous timeout afterwards.
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = self.transport.timeout();
        self.transport.set_timeout(timeout)?;

        let result = f(self);

        self.transport.set_timeout(old_timeout).ok();

        result
    }

    /// Read one SLIP frame from the transport.
    pub(crate) fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        let mut frame = Vec::with_capacity(1024);
        loop {
            self.decoder.decode(&mut self.transport, &mut frame)?;
            if !frame.is_empty() {
                return Ok(frame);
            }
        }
    }

    /// Read and parse the response to a command
    pub fn read_response(&mut self) -> Result<Option<CommandResponse>, Error> {
        let frame = self.read_frame()?;
        if frame.len() < 8 + STUB_STATUS_BYTES {
            return Ok(None);
        }

        // Most responses carry their meaning in the 32-bit value field and
        // are 10 (stub) or 12 (ROM) bytes long. The flash MD5 responses are
        // the exception: the ROM sends the digest as 32 ASCII characters,
        // the stub as 16 raw bytes. Anything else is a payload-carrying
        // response (security info, flash reads) parsed with the framing of
        // whichever loader is currently running.
        let status_len = match frame.len() {
            10 | 26 => STUB_STATUS_BYTES,
            12 | 44 => ROM_STATUS_BYTES,
            _ => self.status_bytes,
        };

        let value = match frame.len() {
            10 | 12 => CommandResponseValue::ValueU32(u32::from_le_bytes(
                frame[4..][..4]
                    .try_into()
                    .map_err(|_| Error::Internal)?,
            )),
            44 => {
                // MD5 is in ASCII
                let digest = std::str::from_utf8(&frame[8..][..32])
                    .map_err(|e| Error::InvalidResponse(e.to_string()))?;
                CommandResponseValue::ValueU128(
                    u128::from_str_radix(digest, 16)
                        .map_err(|e| Error::InvalidResponse(e.to_string()))?,
                )
            }
            26 => {
                // MD5 is raw big-endian bytes
                CommandResponseValue::ValueU128(u128::from_be_bytes(
                    frame[8..][..16]
                        .try_into()
                        .map_err(|_| Error::Internal)?,
                ))
            }
            len => CommandResponseValue::Vector(frame[8..len - status_len].to_vec()),
        };

        let response = CommandResponse {
            resp: frame[0],
            return_op: frame[1],
            return_length: u16::from_le_bytes(
                frame[2..][..2].try_into().map_err(|_| Error::Internal)?,
            ),
            value,
            status: frame[frame.len() - status_len],
            error: frame[frame.len() - status_len + 1],
        };

        Ok(Some(response))
    }

    /// Write a command to the transport
    pub fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {:?}", command.command_type());
        self.transport.clear_input().ok();

        let mut writer = BufWriter::new(&mut self.transport);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;

        Ok(())
    }

    /// Write raw, SLIP-framed data without a command header.
    ///
    /// Used to acknowledge data frames during streamed flash reads.
    pub(crate) fn write_raw(&mut self, value: u32) -> Result<(), Error> {
        let mut writer = BufWriter::new(&mut self.transport);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        encoder.write_all(&value.to_le_bytes())?;
        encoder.finish()?;
        writer.flush()?;

        Ok(())
    }

    /// Write a command and read the response
    pub fn command(&mut self, command: Command<'_>) -> Result<CommandResponseValue, Error> {
        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;

        for _ in 0..100 {
            match self.read_response().for_command(ty)? {
                Some(response) if response.return_op == ty as u8 => {
                    return if response.status != 0 {
                        self.flush().ok();
                        Err(Error::Rom(RomError::new(
                            ty,
                            RomErrorKind::from(response.error),
                        )))
                    } else {
                        Ok(response.value)
                    };
                }
                // Response to some earlier command, or line noise
                _ => continue,
            }
        }
        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Read a register with the command's default timeout
    pub fn read_reg(&mut self, reg: u32) -> Result<u32, Error> {
        self.with_timeout(CommandType::ReadReg.timeout(), |connection| {
            connection.command(Command::ReadReg { address: reg })?.try_into()
        })
    }

    /// Write a register with the command's default timeout
    pub fn write_reg(&mut self, addr: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.with_timeout(CommandType::WriteReg.timeout(), |connection| {
            connection.command(Command::WriteReg {
                address: addr,
                value,
                mask,
            })
        })?;

        Ok(())
    }

    /// Flush the transport
    pub fn flush(&mut self) -> Result<(), Error> {
        self.transport.flush()?;
        Ok(())
    }

    /// Consume the connection, returning the transport.
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }
}

mod encoder {
    use std::io::Write;

    const END: u8 = 0xC0;
    const ESC: u8 = 0xDB;
    const ESC_END: u8 = 0xDC;
    const ESC_ESC: u8 = 0xDD;

    pub struct SlipEncoder<'a, W: Write> {
        writer: &'a mut W,
        len: usize,
    }

    impl<'a, W: Write> SlipEncoder<'a, W> {
        /// Creates a new encoder context
        pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
            let len = writer.write(&[END])?;
            Ok(Self { writer, len })
        }

        pub fn finish(mut self) -> std::io::Result<usize> {
            self.len += self.writer.write(&[END])?;
            Ok(self.len)
        }
    }

    impl<W: Write> Write for SlipEncoder<'_, W> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            for value in buf.iter() {
                match *value {
                    END => {
                        self.len += self.writer.write(&[ESC, ESC_END])?;
                    }
                    ESC => {
                        self.len += self.writer.write(&[ESC, ESC_ESC])?;
                    }
                    _ => {
                        self.len += self.writer.write(&[*value])?;
                    }
                }
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.writer.flush()
        }
    }
}
