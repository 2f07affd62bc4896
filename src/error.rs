//! Library errors
//!
//! Errors are layered the same way the protocol is: [ConnectionError] covers
//! the transport and framing, [RomError] carries the status bytes returned by
//! the ROM/stub loader, and [Error] is everything the library can report.

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use slip_codec::SlipError;
use strum::VariantNames;
use thiserror::Error;

use crate::{
    connection::command::CommandType,
    flasher::{FlashFrequency, FlashSize},
    target::Chip,
};

/// All possible errors returned by esploader
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Unrecognized magic value: {0:#010x}")]
    #[diagnostic(
        code(esploader::chip_detect),
        help("Supported chips are: {}\n\
              If your chip is supported, try hard-resetting the device and try again",
             Chip::VARIANTS.join(", "))
    )]
    ChipDetect(u32),

    #[error("Unrecognized chip ID: {0}")]
    #[diagnostic(
        code(esploader::chip_id),
        help("Probably this chip is unsupported by this version of the library")
    )]
    UnknownChipId(u16),

    #[error("Secure Download Mode is enabled on this chip, so it cannot be identified")]
    #[diagnostic(
        code(esploader::secure_download_detect),
        help("Autodetection does not work in Secure Download Mode, specify the chip manually")
    )]
    SecureDownloadModeDetection,

    #[error("The specified chip ({0}) does not match the detected chip ({1})")]
    #[diagnostic(
        code(esploader::chip_mismatch),
        help("Ensure that the correct chip is selected, or omit it to autodetect the chip")
    )]
    ChipMismatch(String, String),

    #[error("'{name}' is not an image for the detected chip")]
    #[diagnostic(
        code(esploader::image_chip_mismatch),
        help("Use the force option to flash anyway")
    )]
    ImageChipMismatch { name: String },

    #[error(
        "'{name}' requires chip revision in range [{min} - {max}] (this chip is revision {found})"
    )]
    #[diagnostic(
        code(esploader::unsupported_chip_revision),
        help("Use the force option to flash anyway")
    )]
    UnsupportedChipRevision {
        name: String,
        min: String,
        max: String,
        found: String,
    },

    #[error(
        "Secure Boot detected, writing to flash regions below 0x8000 is disabled to protect the bootloader"
    )]
    #[diagnostic(
        code(esploader::secure_boot_protected),
        help("Use the force option to override, please use with caution, otherwise it may brick your device!")
    )]
    SecureBootProtectedRegion,

    #[error("Active security features detected, this operation is disabled as a safety measure")]
    #[diagnostic(
        code(esploader::security_features_active),
        help("Use the force option to override, please use with caution, otherwise it may brick your device!")
    )]
    SecurityFeaturesActive,

    #[error("Can't perform encrypted flash write: {reason}")]
    #[diagnostic(
        code(esploader::encrypted_write_unavailable),
        help("Consult the Flash Encryption documentation for more information")
    )]
    EncryptedWriteUnavailable { reason: String },

    #[error(
        "'{name}' address {address:#x} is not {align} byte aligned, can't flash encrypted"
    )]
    #[diagnostic(code(esploader::misaligned_encrypted_write))]
    MisalignedEncryptedWrite {
        name: String,
        address: u32,
        align: u32,
    },

    #[error(
        "'{name}' (length {length}) at offset {address:#x} will not fit in {flash_size} bytes of flash"
    )]
    #[diagnostic(
        code(esploader::wont_fit),
        help("Change the flash size setting, or the flashing address")
    )]
    WontFit {
        name: String,
        address: u32,
        length: usize,
        flash_size: u32,
    },

    #[error("Binary blobs at {0:#x} and {1:#x} overlap")]
    #[diagnostic(code(esploader::overlapping_blobs))]
    OverlappingBlobs(u32, u32),

    #[error("Offset and size of the region to erase must be multiples of {0:#x}")]
    #[diagnostic(code(esploader::unaligned_erase))]
    UnalignedEraseRegion(u32),

    #[error("This is not a valid image (invalid magic number: {0:#04x})")]
    #[diagnostic(code(esploader::invalid_image_magic))]
    InvalidImageMagic(u8),

    #[error("Image is truncated: expected at least {expected} bytes, have {have}")]
    #[diagnostic(code(esploader::truncated_image))]
    TruncatedImage { expected: usize, have: usize },

    #[error("Write failed, the written flash region at {address:#010x} is still empty")]
    #[diagnostic(
        code(esploader::region_still_empty),
        help("The flash chip may be write protected")
    )]
    WriteFailedRegionEmpty { address: u32 },

    #[error("Hash of data does not match the data in flash: expected {expected}, got {actual}")]
    #[diagnostic(code(esploader::digest_mismatch))]
    DigestMismatch { expected: String, actual: String },

    #[error("Verification of flash content failed")]
    #[diagnostic(code(esploader::verify_failed))]
    VerifyFailed,

    #[error("Corrupt data, expected {0} bytes but received {1} bytes")]
    #[diagnostic(code(esploader::corrupt_data))]
    CorruptData(usize, usize),

    #[error("Read more bytes than expected")]
    #[diagnostic(code(esploader::read_more_than_expected))]
    ReadMoreThanExpected,

    #[error("This command requires the RAM stub to be running")]
    #[diagnostic(
        code(esploader::stub_required),
        help("Don't disable the stub loader for this command")
    )]
    StubRequired,

    #[error("The {chip} does not support {feature}")]
    #[diagnostic(code(esploader::unsupported_feature))]
    UnsupportedFeature { chip: Chip, feature: String },

    #[error("Flash chip not supported, unrecognized flash ID: {0:#x}")]
    #[diagnostic(code(esploader::unrecognized_flash))]
    UnsupportedFlash(u8),

    #[error("The flash size '{0}' is invalid")]
    #[diagnostic(
        code(esploader::invalid_flash_size),
        help("The accepted values are: {:?}", FlashSize::VARIANTS)
    )]
    InvalidFlashSize(String),

    #[error("The specified flash frequency '{frequency}' is not supported by the {chip}")]
    #[diagnostic(code(esploader::unsupported_flash_frequency))]
    UnsupportedFlashFrequency {
        chip: Chip,
        frequency: FlashFrequency,
    },

    #[error("Supplied ELF image is not valid: {0}")]
    #[diagnostic(code(esploader::invalid_elf))]
    InvalidElf(String),

    #[error("Invalid response from device: {0}")]
    #[diagnostic(code(esploader::invalid_response))]
    InvalidResponse(String),

    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    Rom(#[from] RomError),

    #[error("Failed to open file: {0}")]
    FileOpen(String, #[source] io::Error),

    #[error("Internal error")]
    Internal,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<SlipError> for Error {
    fn from(err: SlipError) -> Self {
        Self::Connection(err.into())
    }
}

impl From<object::Error> for Error {
    fn from(err: object::Error) -> Self {
        Self::InvalidElf(err.to_string())
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(esploader::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(esploader::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(esploader::slip_framing),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    FramingError,

    #[error("Received packet too large for buffer")]
    #[diagnostic(
        code(esploader::oversized_packet),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    OverSizedPacket,

    #[error("Invalid stub handshake response received")]
    #[diagnostic(code(esploader::stub_handshake))]
    InvalidStubHandshake,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(esploader::timeout))]
    Timeout(TimedOutCommand),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(esploader::serial_error))]
    Serial(#[source] io::Error),
}

impl ConnectionError {
    /// Whether a retry after closing and reopening the transport makes sense.
    ///
    /// Timeouts and protocol errors are not transient: the port is still
    /// there, the device just did not answer the way we expected.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::Serial(_) | ConnectionError::DeviceNotFound
        )
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
            io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(kind) => ConnectionError::from(io::Error::new(kind, err.to_string())),
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(io::Error::other(err.to_string())),
        }
    }
}

impl From<SlipError> for ConnectionError {
    fn from(err: SlipError) -> Self {
        match err {
            SlipError::FramingError => Self::FramingError,
            SlipError::OversizedPacket => Self::OverSizedPacket,
            SlipError::ReadError(io) => Self::from(io),
            SlipError::EndOfStream => Self::FramingError,
        }
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Errors originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(esploader::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(esploader::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(esploader::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(esploader::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(esploader::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(esploader::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(esploader::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Bad data length")]
    #[diagnostic(code(esploader::rom::data_len))]
    BadDataLen = 0xc0,

    #[error("Bad data checksum")]
    #[diagnostic(code(esploader::rom::data_crc))]
    BadDataChecksum = 0xc1,

    #[error("Bad block size")]
    #[diagnostic(code(esploader::rom::block_size))]
    BadBlocksize = 0xc2,

    #[error("Invalid command")]
    #[diagnostic(code(esploader::rom::cmd))]
    InvalidCommand = 0xc3,

    #[error("SPI operation failed")]
    #[diagnostic(code(esploader::rom::spi))]
    FailedSpiOp = 0xc4,

    #[error("SPI unlock failed")]
    #[diagnostic(code(esploader::rom::spi_unlock))]
    FailedSpiUnlock = 0xc5,

    #[error("Not in flash mode")]
    #[diagnostic(code(esploader::rom::flash_mode))]
    NotInFlashMode = 0xc6,

    #[error("Error when uncompressing the data")]
    #[diagnostic(code(esploader::rom::inflate))]
    InflateError = 0xc7,

    #[error("Didn't receive enough data")]
    #[diagnostic(code(esploader::rom::not_enough))]
    NotEnoughData = 0xc8,

    #[error("Received too much data")]
    #[diagnostic(code(esploader::rom::too_much_data))]
    TooMuchData = 0xc9,

    #[default]
    #[error("Other")]
    #[diagnostic(code(esploader::rom::other))]
    Other = 0xff,
}

impl RomErrorKind {
    /// The loader told us it does not implement the command we sent.
    ///
    /// The ROM reports this as an invalid message, the stub as an invalid
    /// command.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            RomErrorKind::InvalidMessage | RomErrorKind::InvalidCommand
        )
    }
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// An error originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Error while running {command} command")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }

    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}

impl Error {
    /// Whether this error was caused by the transport dropping mid-operation,
    /// making a reconnect-and-retry worthwhile.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Error::Connection(err) | Error::Flashing(err) => err.is_transient(),
            _ => false,
        }
    }
}
