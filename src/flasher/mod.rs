//! Device session and flash programming
//!
//! [Flasher] owns the serial [Connection], performs the two-phase chip
//! identification, optionally bootstraps the stub loader, and exposes the
//! flash operations. Flash writes live in [write]; everything that concerns
//! the session itself (detection, stub handoff, SPI flash access, security
//! state) lives here.

use std::{str::FromStr, thread::sleep, time::Duration};

use bitflags::bitflags;
use log::{debug, warn};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator, VariantNames};

pub(crate) use self::stubs::{FlashStub, STUB_HANDSHAKE};
pub use self::write::{FlashTask, VerifyMismatch, WriteOptions, WriteReport, WrittenRegion};
use crate::{
    connection::{
        command::{Command, CommandType},
        transport::Transport,
        Connection,
    },
    error::{ConnectionError, Error, ResultExt},
    target::{Chip, ChipProfile, EfuseField, CHIP_DETECT_MAGIC_REG_ADDR},
};

mod stubs;
mod write;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Supported flash frequencies
///
/// Note that not all frequencies are supported by each target device.
#[derive(
    Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashFrequency {
    /// 12 MHz
    #[serde(rename = "12MHz")]
    _12Mhz,
    /// 15 MHz
    #[serde(rename = "15MHz")]
    _15Mhz,
    /// 16 MHz
    #[serde(rename = "16MHz")]
    _16Mhz,
    /// 20 MHz
    #[serde(rename = "20MHz")]
    _20Mhz,
    /// 24 MHz
    #[serde(rename = "24MHz")]
    _24Mhz,
    /// 26 MHz
    #[serde(rename = "26MHz")]
    _26Mhz,
    /// 30 MHz
    #[serde(rename = "30MHz")]
    _30Mhz,
    /// 40 MHz
    #[serde(rename = "40MHz")]
    #[default]
    _40Mhz,
    /// 48 MHz
    #[serde(rename = "48MHz")]
    _48Mhz,
    /// 60 MHz
    #[serde(rename = "60MHz")]
    _60Mhz,
    /// 80 MHz
    #[serde(rename = "80MHz")]
    _80Mhz,
}

/// Supported flash modes
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, VariantNames, Serialize, Deserialize)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio,
    /// Quad Output (4 pins used for data)
    Qout,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio,
    /// Dual Output (2 pins used for data)
    Dout,
}

/// Supported flash sizes
///
/// Note that not all sizes are supported by each target device.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Display,
    VariantNames,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FlashSize {
    /// 256 KB
    #[serde(rename = "256KB")]
    _256Kb,
    /// 512 KB
    #[serde(rename = "512KB")]
    _512Kb,
    /// 1 MB
    #[serde(rename = "1MB")]
    _1Mb,
    /// 2 MB
    #[serde(rename = "2MB")]
    _2Mb,
    /// 4 MB
    #[default]
    #[serde(rename = "4MB")]
    _4Mb,
    /// 8 MB
    #[serde(rename = "8MB")]
    _8Mb,
    /// 16 MB
    #[serde(rename = "16MB")]
    _16Mb,
    /// 32 MB
    #[serde(rename = "32MB")]
    _32Mb,
    /// 64 MB
    #[serde(rename = "64MB")]
    _64Mb,
    /// 128 MB
    #[serde(rename = "128MB")]
    _128Mb,
    /// 256 MB
    #[serde(rename = "256MB")]
    _256Mb,
}

impl FlashSize {
    /// Create a [FlashSize] from the size ID byte of a flash chip's ID
    /// response.
    pub const fn from_detected(value: u8) -> Result<FlashSize, Error> {
        match value {
            0x12 | 0x32 => Ok(FlashSize::_256Kb),
            0x13 | 0x33 => Ok(FlashSize::_512Kb),
            0x14 | 0x34 => Ok(FlashSize::_1Mb),
            0x15 | 0x35 => Ok(FlashSize::_2Mb),
            0x16 | 0x36 => Ok(FlashSize::_4Mb),
            0x17 | 0x37 => Ok(FlashSize::_8Mb),
            0x18 | 0x38 => Ok(FlashSize::_16Mb),
            0x19 | 0x39 => Ok(FlashSize::_32Mb),
            0x20 | 0x1A | 0x3A => Ok(FlashSize::_64Mb),
            0x21 | 0x1B => Ok(FlashSize::_128Mb),
            0x22 | 0x1C => Ok(FlashSize::_256Mb),
            _ => Err(Error::UnsupportedFlash(value)),
        }
    }

    /// Returns the flash size in bytes
    pub const fn size(self) -> u32 {
        match self {
            FlashSize::_256Kb => 0x0040000,
            FlashSize::_512Kb => 0x0080000,
            FlashSize::_1Mb => 0x0100000,
            FlashSize::_2Mb => 0x0200000,
            FlashSize::_4Mb => 0x0400000,
            FlashSize::_8Mb => 0x0800000,
            FlashSize::_16Mb => 0x1000000,
            FlashSize::_32Mb => 0x2000000,
            FlashSize::_64Mb => 0x4000000,
            FlashSize::_128Mb => 0x8000000,
            FlashSize::_256Mb => 0x10000000,
        }
    }
}

impl FromStr for FlashSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlashSize::VARIANTS
            .iter()
            .copied()
            .zip(FlashSize::iter())
            .find(|(name, _)| *name == s.to_uppercase())
            .map(|(_, variant)| variant)
            .ok_or_else(|| Error::InvalidFlashSize(s.to_string()))
    }
}

/// A flash parameter which is either kept as-is or overridden
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Setting<T> {
    /// Keep whatever the image already declares
    #[default]
    Keep,
    /// Override with the given value
    Set(T),
}

/// The flash size parameter: kept, overridden, or detected from the device
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SizeSetting {
    /// Keep whatever the image already declares
    #[default]
    Keep,
    /// Read the size from the flash chip's ID response
    Detect,
    /// Override with the given size
    Set(FlashSize),
}

/// Flash parameter overrides, passed explicitly into every operation that
/// patches image headers
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlashSettings {
    pub mode: Setting<FlashMode>,
    pub freq: Setting<FlashFrequency>,
    pub size: SizeSetting,
}

impl FlashSettings {
    /// Settings that leave every image untouched.
    pub const fn keep() -> Self {
        FlashSettings {
            mode: Setting::Keep,
            freq: Setting::Keep,
            size: SizeSetting::Keep,
        }
    }

    /// Whether every parameter is left as-is.
    pub fn is_keep(&self) -> bool {
        self.mode == Setting::Keep
            && self.freq == Setting::Keep
            && matches!(self.size, SizeSetting::Keep)
    }
}

/// Parameters of the attached SPI flash chip (sizes, etc).
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct SpiSetParams {
    /// Flash chip ID
    fl_id: u32,
    /// Total size in bytes
    total_size: u32,
    /// Block size
    block_size: u32,
    /// Sector size
    sector_size: u32,
    /// Page size
    page_size: u32,
    /// Status mask
    status_mask: u32,
}

impl SpiSetParams {
    pub const fn default(size: u32) -> Self {
        SpiSetParams {
            fl_id: 0,
            total_size: size,
            block_size: 64 * 1024,
            sector_size: 4 * 1024,
            page_size: 256,
            status_mask: 0xFFFF,
        }
    }

    /// Encode the parameters into a byte array
    pub fn encode(&self) -> Vec<u8> {
        let mut encoded: Vec<u8> = Vec::new();
        encoded.extend_from_slice(&self.fl_id.to_le_bytes());
        encoded.extend_from_slice(&self.total_size.to_le_bytes());
        encoded.extend_from_slice(&self.block_size.to_le_bytes());
        encoded.extend_from_slice(&self.sector_size.to_le_bytes());
        encoded.extend_from_slice(&self.page_size.to_le_bytes());
        encoded.extend_from_slice(&self.status_mask.to_le_bytes());
        encoded
    }
}

/// Parameters for attaching to a target device's SPI flash
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct SpiAttachParams {
    clk: u8,
    q: u8,
    d: u8,
    hd: u8,
    cs: u8,
}

impl SpiAttachParams {
    pub const fn default() -> Self {
        SpiAttachParams {
            clk: 0,
            q: 0,
            d: 0,
            hd: 0,
            cs: 0,
        }
    }

    // Pin configuration used by boards with an on-package flash die
    pub const fn esp32_pico_d4() -> Self {
        SpiAttachParams {
            clk: 6,
            q: 17,
            d: 8,
            hd: 11,
            cs: 16,
        }
    }

    /// Encode the parameters into a byte array
    pub fn encode(self, stub: bool) -> Vec<u8> {
        let packed = ((self.hd as u32) << 24)
            | ((self.cs as u32) << 18)
            | ((self.d as u32) << 12)
            | ((self.q as u32) << 6)
            | (self.clk as u32);

        let mut encoded: Vec<u8> = packed.to_le_bytes().to_vec();

        if !stub {
            encoded.append(&mut vec![0u8; 4]);
        }

        encoded
    }
}

/// List of SPI parameters to try while detecting flash size
const TRY_SPI_PARAMS: [SpiAttachParams; 2] =
    [SpiAttachParams::default(), SpiAttachParams::esp32_pico_d4()];

bitflags! {
    /// Security state flags reported by the get-security-info command
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecurityFlags: u32 {
        const SECURE_BOOT_EN                = 1 << 0;
        const SECURE_BOOT_AGGRESSIVE_REVOKE = 1 << 1;
        const SECURE_DOWNLOAD_ENABLE        = 1 << 2;
        const SECURE_BOOT_KEY_REVOKE0       = 1 << 3;
        const SECURE_BOOT_KEY_REVOKE1       = 1 << 4;
        const SECURE_BOOT_KEY_REVOKE2       = 1 << 5;
        const SOFT_DIS_JTAG                 = 1 << 6;
        const HARD_DIS_JTAG                 = 1 << 7;
        const DIS_USB                       = 1 << 8;
        const DIS_DOWNLOAD_DCACHE           = 1 << 9;
        const DIS_DOWNLOAD_ICACHE           = 1 << 10;
    }
}

/// Security information reported by the device
#[derive(Debug, Clone)]
pub struct SecurityInfo {
    /// Security state flags
    pub flags: SecurityFlags,
    /// Number of times flash encryption has been enabled
    pub flash_crypt_cnt: u8,
    /// Purposes of the programmed key blocks
    pub key_purposes: [u8; 7],
    /// Chip ID, absent on the generation predating it
    pub chip_id: Option<u32>,
    /// Silicon revision, absent on the generation predating it
    pub eco_version: Option<u32>,
}

impl SecurityInfo {
    /// Key purpose values marking a programmed flash encryption key
    const XTS_AES_KEY_PURPOSES: [u8; 3] = [2, 3, 4];

    /// Whether any key block holds a flash encryption key.
    pub fn flash_encryption_key_valid(&self) -> bool {
        self.key_purposes
            .iter()
            .any(|purpose| Self::XTS_AES_KEY_PURPOSES.contains(purpose))
    }

    /// Whether flash encryption is currently enabled.
    pub fn flash_encryption_enabled(&self) -> bool {
        self.flash_crypt_cnt.count_ones() % 2 != 0
    }
}

impl TryFrom<&[u8]> for SecurityInfo {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        // The first security-info capable generation answers with 12 bytes,
        // everything later appends the chip ID and ECO version words.
        let legacy_response = bytes.len() == 12;

        if bytes.len() < 12 {
            return Err(Error::InvalidResponse(format!(
                "expected response of at least 12 bytes, received {} bytes",
                bytes.len()
            )));
        }

        let flags = SecurityFlags::from_bits_retain(u32::from_le_bytes(
            bytes[0..4].try_into().map_err(|_| Error::Internal)?,
        ));
        let flash_crypt_cnt = bytes[4];
        let key_purposes: [u8; 7] = bytes[5..12].try_into().map_err(|_| Error::Internal)?;

        let (chip_id, eco_version) = if legacy_response {
            (None, None)
        } else {
            if bytes.len() < 20 {
                return Err(Error::InvalidResponse(format!(
                    "expected response of at least 20 bytes, received {} bytes",
                    bytes.len()
                )));
            }
            let chip_id = u32::from_le_bytes(bytes[12..16].try_into().map_err(|_| Error::Internal)?);
            let eco_version =
                u32::from_le_bytes(bytes[16..20].try_into().map_err(|_| Error::Internal)?);
            (Some(chip_id), Some(eco_version))
        };

        Ok(SecurityInfo {
            flags,
            flash_crypt_cnt,
            key_purposes,
            chip_id,
            eco_version,
        })
    }
}

/// Information about the connected device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// The chip being used
    pub chip: Chip,
    /// The (major, minor) revision of the chip
    pub revision: Option<(u32, u32)>,
    /// The detected flash size
    pub flash_size: Option<FlashSize>,
    /// Whether the chip is locked down in Secure Download Mode
    pub secure_download_mode: bool,
    /// Whether the stub loader is running
    pub stub: bool,
}

/// Connect to and flash a target device
pub struct Flasher {
    /// Connection for flash operations
    connection: Connection,
    /// Profile of the detected chip, resolved once
    profile: &'static ChipProfile,
    /// Flash size, loaded from the SPI flash chip's ID when needed
    flash_size: Option<FlashSize>,
    /// Configuration for SPI attached flash (0 to use fused values)
    spi_params: SpiAttachParams,
    /// Whether the RAM stub loader is running
    is_stub: bool,
}

impl std::fmt::Debug for Flasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flasher")
            .field("chip", &self.profile.chip)
            .field("flash_size", &self.flash_size)
            .field("spi_params", &self.spi_params)
            .field("is_stub", &self.is_stub)
            .finish_non_exhaustive()
    }
}

impl Flasher {
    /// Connect to a device and identify it.
    ///
    /// The transport should be opened at the protocol's default baud rate of
    /// 115,200; once the chip is identified the rate is raised to `speed`.
    pub fn connect(
        transport: Box<dyn Transport>,
        speed: Option<u32>,
        use_stub: bool,
        chip: Option<Chip>,
    ) -> Result<Self, Error> {
        let mut connection = Connection::new(transport);
        connection.begin()?;
        connection.set_timeout(DEFAULT_TIMEOUT)?;

        let profile = detect_chip(&mut connection)?;
        if let Some(expected) = chip {
            if expected != profile.chip {
                return Err(Error::ChipMismatch(
                    expected.to_string(),
                    profile.chip.to_string(),
                ));
            }
        }
        debug!("Detected chip: {}", profile.chip);

        let mut flasher = Flasher {
            connection,
            profile,
            flash_size: None,
            spi_params: SpiAttachParams::default(),
            is_stub: false,
        };

        if flasher.connection.secure_download_mode {
            if use_stub {
                warn!("The stub loader is not supported in Secure Download Mode, disabling it");
            }
        } else if use_stub {
            // A failed handoff is a soft degrade, the ROM session keeps
            // working with its smaller block sizes.
            if let Err(e) = flasher.load_stub() {
                warn!("Failed to start the stub loader, falling back to the ROM loader: {e}");
                flasher.connection.set_stub_framing(false);
                flasher.is_stub = false;
            }
        }

        if let Some(baud) = speed {
            if baud > 115_200 {
                warn!("Setting baud rate higher than 115,200 can cause issues");
                flasher.change_baud(baud)?;
            }
        }

        Ok(flasher)
    }

    /// The chip type that the flasher is connected to
    pub fn chip(&self) -> Chip {
        self.profile.chip
    }

    /// The profile of the detected chip
    pub fn profile(&self) -> &'static ChipProfile {
        self.profile
    }

    /// Whether the stub loader is running
    pub fn is_stub(&self) -> bool {
        self.is_stub
    }

    /// Whether the chip is locked down in Secure Download Mode
    pub fn secure_download_mode(&self) -> bool {
        self.connection.secure_download_mode
    }

    /// The active connection being used by the flasher
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Consume the flasher, returning the transport.
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.connection.into_transport()
    }

    /// Drop back to a plain ROM session, after the chip reset behind our
    /// back.
    pub(crate) fn set_rom_session(&mut self) {
        self.connection.set_stub_framing(false);
        self.is_stub = false;
    }

    /// The block size for flash writes in the current loader mode.
    pub(crate) fn flash_write_size(&self) -> usize {
        if self.is_stub {
            self.profile.stub_flash_write_size
        } else {
            self.profile.flash_write_size
        }
    }

    /// Load the stub loader into RAM and hand the session over to it.
    pub(crate) fn load_stub(&mut self) -> Result<(), Error> {
        if !self.profile.supports_stub {
            return Err(Error::UnsupportedFeature {
                chip: self.profile.chip,
                feature: "the stub loader".into(),
            });
        }

        debug!("Loading flash stub for chip: {:?}", self.profile.chip);

        let stub = FlashStub::get(self.profile.chip);

        let (text_addr, text) = stub.text();
        debug!("Write {} byte stub text", text.len());
        self.write_ram(text_addr, &text)?;

        let (data_addr, data) = stub.data();
        debug!("Write {} byte stub data", data.len());
        self.write_ram(data_addr, &data)?;

        debug!("Running stub at {:#010x}", stub.entry());
        self.connection
            .with_timeout(CommandType::MemEnd.timeout(), |connection| {
                connection.command(Command::MemEnd {
                    no_entry: false,
                    entry: stub.entry(),
                })
            })
            .flashing()?;

        let handshake = self.connection.read_frame()?;
        if handshake != STUB_HANDSHAKE.as_bytes() {
            return Err(Error::Connection(ConnectionError::InvalidStubHandshake));
        }

        // The stub answers with the short status framing from here on, and
        // unlocks the larger block sizes.
        self.connection.set_stub_framing(true);
        self.is_stub = true;

        debug!("Stub running!");

        Ok(())
    }

    /// Write a blob into RAM, block by block.
    fn write_ram(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let block_size = self.profile.ram_write_size;
        let blocks = data.len().div_ceil(block_size);

        self.connection
            .with_timeout(CommandType::MemBegin.timeout(), |connection| {
                connection.command(Command::MemBegin {
                    size: data.len() as u32,
                    blocks: blocks as u32,
                    block_size: block_size as u32,
                    offset: addr,
                })
            })
            .flashing()?;

        for (sequence, block) in data.chunks(block_size).enumerate() {
            self.connection
                .with_timeout(CommandType::MemData.timeout(), |connection| {
                    connection.command(Command::MemData {
                        data: block,
                        pad_to: 4,
                        pad_byte: 0,
                        sequence: sequence as u32,
                    })
                })
                .flashing()?;
        }

        Ok(())
    }

    /// Attach the SPI flash so flash commands can run against it.
    pub(crate) fn enable_flash(&mut self) -> Result<(), Error> {
        let stub = self.is_stub;
        let spi_params = self.spi_params;
        self.connection
            .with_timeout(CommandType::SpiAttach.timeout(), |connection| {
                connection.command(if stub {
                    Command::SpiAttachStub { spi_params }
                } else {
                    Command::SpiAttach { spi_params }
                })
            })?;

        Ok(())
    }

    /// Read the flash chip's ID and derive its size from it.
    pub fn flash_detect(&mut self) -> Result<Option<FlashSize>, Error> {
        // This size ID means the chip wants a different detection method
        const FLASH_RETRY: u8 = 0xFF;

        let flash_id = self.spi_command(CommandType::FlashDetect, &[], 24)?;
        let size_id = (flash_id >> 16) as u8;

        if size_id == FLASH_RETRY {
            return Ok(None);
        }

        let flash_size = match FlashSize::from_detected(size_id) {
            Ok(size) => size,
            Err(_) => {
                warn!(
                    "Could not detect flash size (FlashID={flash_id:#04x}, SizeID={size_id:#04x}), defaulting to 4MB"
                );
                FlashSize::default()
            }
        };

        Ok(Some(flash_size))
    }

    /// Detect the flash size, cycling through the known SPI pin
    /// configurations until one answers.
    pub(crate) fn spi_autodetect(&mut self) -> Result<Option<FlashSize>, Error> {
        if let Some(size) = self.flash_size {
            return Ok(Some(size));
        }

        for spi_params in TRY_SPI_PARAMS {
            debug!("Attempting flash enable with: {:?}", spi_params);
            self.spi_params = spi_params;

            // The attach command may fail while the flash connection still
            // comes up, so an error here is not conclusive.
            if self.enable_flash().is_err() {
                debug!("Flash enable failed");
            }

            if let Some(flash_size) = self.flash_detect()? {
                debug!("Detected flash size: {}", flash_size);
                self.flash_size = Some(flash_size);
                self.set_spi_params(flash_size)?;
                return Ok(Some(flash_size));
            }
        }

        self.spi_params = SpiAttachParams::default();
        Ok(None)
    }

    /// Configure the flash chip geometry on the device side.
    pub(crate) fn set_spi_params(&mut self, size: FlashSize) -> Result<(), Error> {
        let spi_set_params = SpiSetParams::default(size.size());
        self.connection
            .with_timeout(CommandType::SpiSetParams.timeout(), |connection| {
                connection.command(Command::SpiSetParams {
                    spi_params: spi_set_params,
                })
            })?;
        Ok(())
    }

    /// Run a raw SPI flash command through the SPI controller registers.
    fn spi_command(&mut self, command: CommandType, data: &[u8], read_bits: u32) -> Result<u32, Error> {
        assert!(read_bits < 32);
        assert!(data.len() < 64);

        let spi_registers = self.profile.spi_registers;

        let old_spi_usr = self.connection.read_reg(spi_registers.usr())?;
        let old_spi_usr2 = self.connection.read_reg(spi_registers.usr2())?;

        let mut flags = 1 << 31;
        if !data.is_empty() {
            flags |= 1 << 27;
        }
        if read_bits > 0 {
            flags |= 1 << 28;
        }

        self.connection.write_reg(spi_registers.usr(), flags, None)?;
        self.connection
            .write_reg(spi_registers.usr2(), (7 << 28) | command as u32, None)?;

        if let (Some(mosi_data_length), Some(miso_data_length)) =
            (spi_registers.mosi_length(), spi_registers.miso_length())
        {
            if !data.is_empty() {
                self.connection
                    .write_reg(mosi_data_length, data.len() as u32 * 8 - 1, None)?;
            }
            if read_bits > 0 {
                self.connection
                    .write_reg(miso_data_length, read_bits - 1, None)?;
            }
        } else {
            let mosi_mask = if data.is_empty() {
                0
            } else {
                data.len() as u32 * 8 - 1
            };
            let miso_mask = if read_bits == 0 { 0 } else { read_bits - 1 };
            self.connection.write_reg(
                spi_registers.usr1(),
                (miso_mask << 8) | (mosi_mask << 17),
                None,
            )?;
        }

        if data.is_empty() {
            self.connection.write_reg(spi_registers.w0(), 0, None)?;
        } else {
            for (i, bytes) in data.chunks(4).enumerate() {
                let mut data_bytes = [0; 4];
                data_bytes[0..bytes.len()].copy_from_slice(bytes);
                let data = u32::from_le_bytes(data_bytes);
                self.connection
                    .write_reg(spi_registers.w0() + i as u32, data, None)?;
            }
        }

        self.connection.write_reg(spi_registers.cmd(), 1 << 18, None)?;

        let mut i = 0;
        loop {
            sleep(Duration::from_millis(1));
            if self.connection.read_reg(spi_registers.cmd())? & (1 << 18) == 0 {
                break;
            }
            i += 1;
            if i > 10 {
                return Err(Error::Connection(ConnectionError::Timeout(command.into())));
            }
        }

        let result = self.connection.read_reg(spi_registers.w0())?;
        self.connection
            .write_reg(spi_registers.usr(), old_spi_usr, None)?;
        self.connection
            .write_reg(spi_registers.usr2(), old_spi_usr2, None)?;

        Ok(result)
    }

    /// Read a single eFuse field.
    pub(crate) fn read_efuse(&mut self, field: EfuseField) -> Result<u32, Error> {
        let word = self
            .connection
            .read_reg(self.profile.efuse_reg + 4 * field.word)?;
        Ok(field.extract(word))
    }

    /// Determine the chip's (major, minor) revision from its eFuses.
    pub fn chip_revision(&mut self) -> Result<(u32, u32), Error> {
        let major = self.read_efuse(self.profile.major_version)?;

        let mut minor = 0;
        for field in self.profile.minor_version {
            minor = (minor << field.width) | self.read_efuse(*field)?;
        }

        Ok((major, minor))
    }

    /// Request the device's security information.
    pub fn security_info(&mut self) -> Result<SecurityInfo, Error> {
        self.connection
            .with_timeout(CommandType::GetSecurityInfo.timeout(), |connection| {
                let response = connection.command(Command::GetSecurityInfo)?;
                let data: Vec<u8> = response.try_into()?;
                SecurityInfo::try_from(data.as_slice())
            })
    }

    /// Whether secure boot is active on the device.
    pub fn secure_boot_enabled(&mut self) -> Result<bool, Error> {
        if self.profile.supports_security_info {
            Ok(self
                .security_info()?
                .flags
                .contains(SecurityFlags::SECURE_BOOT_EN))
        } else if let Some(field) = self.profile.secure_boot_efuse {
            Ok(self.read_efuse(field)? != 0)
        } else {
            Ok(false)
        }
    }

    /// Whether flash encryption is active on the device.
    pub fn flash_encryption_enabled(&mut self) -> Result<bool, Error> {
        let cnt = if self.profile.supports_security_info {
            self.security_info()?.flash_crypt_cnt as u32
        } else if let Some(field) = self.profile.flash_crypt_cnt_efuse {
            self.read_efuse(field)?
        } else {
            return Ok(false);
        };

        Ok(cnt.count_ones() % 2 != 0)
    }

    /// Whether a flash encryption key is programmed into the device.
    pub(crate) fn flash_encryption_key_valid(&mut self) -> Result<bool, Error> {
        if self.profile.supports_security_info {
            Ok(self.security_info()?.flash_encryption_key_valid())
        } else {
            // The first generation keeps the key in its own block, any
            // non-zero word means a key was burned.
            for word in 14..=21 {
                if self
                    .connection
                    .read_reg(self.profile.efuse_reg + 4 * word)?
                    != 0
                {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }

    /// Whether manually encrypted downloads are fused off.
    pub(crate) fn encrypted_download_disabled(&mut self) -> Result<bool, Error> {
        if let Some(field) = self.profile.encrypt_disable_efuse {
            Ok(self.read_efuse(field)? != 0)
        } else {
            Ok(false)
        }
    }

    /// Measure the crystal frequency, in MHz.
    pub fn crystal_freq(&mut self) -> Result<u32, Error> {
        let options = self.profile.xtal_options;
        if options.len() == 1 {
            return Ok(options[0]);
        }

        let Some(clkdiv_reg) = self.profile.uart_clkdiv_reg else {
            return Ok(options[0]);
        };

        // The ROM configured the UART divider for the real crystal, so the
        // divider and the current baud rate give away the frequency.
        let clkdiv = self.connection.read_reg(clkdiv_reg)? & 0xfffff;
        let baud = self.connection.baud()?;
        let estimate = (clkdiv as u64 * baud as u64) as f64 / 1_000_000.0;

        let nearest = options
            .iter()
            .copied()
            .min_by_key(|option| ((*option as f64 - estimate).abs() * 1000.0) as u64)
            .unwrap_or(options[0]);

        Ok(nearest)
    }

    /// Change the connection's baud rate.
    pub fn change_baud(&mut self, speed: u32) -> Result<(), Error> {
        debug!("Change baud to: {}", speed);

        let prior_baud = match self.is_stub {
            true => self.connection.baud()?,
            false => 0,
        };

        // The ROM of the 26 MHz-crystal family assumes a 40 MHz crystal when
        // programming its baud divider, so ask for a proportionally higher
        // rate to land on the real one.
        let mut new_baud = speed;
        if self.profile.xtal_options.contains(&26) && !self.is_stub && self.crystal_freq()? == 26 {
            new_baud = new_baud * 40 / 26;
        }

        self.connection
            .with_timeout(CommandType::ChangeBaudrate.timeout(), |connection| {
                connection.command(Command::ChangeBaudrate {
                    new_baud,
                    prior_baud,
                })
            })?;
        self.connection.set_baud(speed)?;
        sleep(Duration::from_millis(50));
        self.connection.flush()?;

        Ok(())
    }

    /// Erase the entire flash.
    pub fn erase_flash(&mut self, force: bool) -> Result<(), Error> {
        self.check_erase_safety(force)?;

        if !self.is_stub && !self.profile.rom_supports_erase {
            return Err(Error::StubRequired);
        }

        debug!("Erasing the entire flash");
        self.enable_flash()?;

        self.connection
            .with_timeout(CommandType::EraseFlash.timeout(), |connection| {
                connection.command(Command::EraseFlash)
            })?;
        sleep(Duration::from_millis(50));
        self.connection.flush()?;

        Ok(())
    }

    /// Erase a sector-aligned region of the flash.
    pub fn erase_region(&mut self, offset: u32, size: u32, force: bool) -> Result<(), Error> {
        let sector_size = self.profile.flash_sector_size;
        if offset % sector_size != 0 || size % sector_size != 0 {
            return Err(Error::UnalignedEraseRegion(sector_size));
        }
        self.check_erase_safety(force)?;

        debug!("Erasing region of {size:#x}B at {offset:#010x}");
        self.enable_flash()?;

        if self.is_stub || self.profile.rom_supports_erase {
            self.connection.with_timeout(
                CommandType::EraseRegion.timeout_for_size(size),
                |connection| connection.command(Command::EraseRegion { offset, size }),
            )?;
        } else {
            // The ROM loader erases the region covered by a write as a side
            // effect of the begin command, which also works in Secure
            // Download Mode.
            let block_size = self.flash_write_size() as u32;
            self.connection.with_timeout(
                CommandType::FlashBegin.timeout_for_size(size),
                |connection| {
                    connection.command(Command::FlashBegin {
                        size,
                        blocks: size.div_ceil(block_size),
                        block_size,
                        offset,
                        supports_encryption: false,
                        encrypt: false,
                    })
                },
            )?;
        }
        sleep(Duration::from_millis(50));
        self.connection.flush()?;

        Ok(())
    }

    fn check_erase_safety(&mut self, force: bool) -> Result<(), Error> {
        if force || self.connection.secure_download_mode {
            return Ok(());
        }
        if self.flash_encryption_enabled()? || self.secure_boot_enabled()? {
            return Err(Error::SecurityFeaturesActive);
        }
        Ok(())
    }

    /// Get the MD5 digest the device computes over a region of flash.
    pub fn flash_md5(&mut self, addr: u32, length: u32) -> Result<u128, Error> {
        self.connection
            .with_timeout(CommandType::FlashMd5.timeout_for_size(length), |connection| {
                connection
                    .command(Command::FlashMd5 {
                        offset: addr,
                        size: length,
                    })?
                    .try_into()
            })
    }

    /// Read a region of flash.
    pub fn read_flash(&mut self, offset: u32, size: u32) -> Result<Vec<u8>, Error> {
        debug!("Reading {size:#x}B from {offset:#010x}");

        self.enable_flash()?;

        if self.is_stub {
            self.read_flash_stub(offset, size)
        } else {
            self.read_flash_rom(offset, size)
        }
    }

    /// Streamed flash read through the stub, verified by a trailing digest.
    fn read_flash_stub(&mut self, offset: u32, size: u32) -> Result<Vec<u8>, Error> {
        const BLOCK_SIZE: u32 = 0x1000;
        const MAX_IN_FLIGHT: u32 = 64;

        self.connection
            .with_timeout(CommandType::ReadFlash.timeout(), |connection| {
                connection.command(Command::ReadFlash {
                    offset,
                    size,
                    block_size: BLOCK_SIZE,
                    max_in_flight: MAX_IN_FLIGHT,
                })
            })?;

        let mut data: Vec<u8> = Vec::with_capacity(size as usize);
        while data.len() < size as usize {
            let chunk = self.connection.read_frame()?;
            data.extend_from_slice(&chunk);

            if data.len() < size as usize && chunk.len() < BLOCK_SIZE as usize {
                return Err(Error::CorruptData(BLOCK_SIZE as usize, chunk.len()));
            }

            self.connection.write_raw(data.len() as u32)?;
        }

        if data.len() > size as usize {
            return Err(Error::ReadMoreThanExpected);
        }

        let digest = self.connection.read_frame()?;
        if digest.len() != 16 {
            return Err(Error::InvalidResponse(format!(
                "expected a 16 byte digest, received {} bytes",
                digest.len()
            )));
        }

        let mut hasher = Md5::new();
        hasher.update(&data);
        let checksum_md5 = hasher.finalize();

        if digest != checksum_md5.as_slice() {
            return Err(Error::DigestMismatch {
                expected: crate::image_format::hex(checksum_md5),
                actual: crate::image_format::hex(&digest),
            });
        }

        Ok(data)
    }

    /// Block-by-block flash read through the ROM loader.
    fn read_flash_rom(&mut self, offset: u32, size: u32) -> Result<Vec<u8>, Error> {
        // ROM read limit per command
        const BLOCK_LEN: usize = 64;

        let mut data: Vec<u8> = Vec::with_capacity(size as usize);

        while data.len() < size as usize {
            let block_len = BLOCK_LEN.min(size as usize - data.len());
            let block_offset = offset + data.len() as u32;

            let response =
                self.connection
                    .with_timeout(CommandType::ReadFlashSlow.timeout(), |connection| {
                        connection.command(Command::ReadFlashSlow {
                            offset: block_offset,
                            size: block_len as u32,
                            block_size: BLOCK_LEN as u32,
                            max_in_flight: 1,
                        })
                    })?;

            let payload: Vec<u8> = response.try_into()?;
            if payload.len() < block_len {
                return Err(Error::CorruptData(block_len, payload.len()));
            }

            // the command always answers with a full buffer, regardless of
            // how many bytes were actually read from flash
            data.extend_from_slice(&payload[..block_len]);
        }

        Ok(data)
    }

    /// Read and report everything we can about the connected device.
    pub fn device_info(&mut self) -> Result<DeviceInfo, Error> {
        // eFuses are not readable in Secure Download Mode
        let revision = (!self.connection.secure_download_mode)
            .then(|| self.chip_revision())
            .transpose()?;

        let flash_size = if self.connection.secure_download_mode {
            None
        } else {
            self.spi_autodetect()?
        };

        Ok(DeviceInfo {
            chip: self.profile.chip,
            revision,
            flash_size,
            secure_download_mode: self.connection.secure_download_mode,
            stub: self.is_stub,
        })
    }

    /// Reset the device and let it boot into user code.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.connection.reset()
    }
}

/// Two-phase chip detection.
///
/// Phase 1 asks for the chip ID through the get-security-info command, which
/// newer families answer even in Secure Download Mode. When the command is
/// unsupported, or the response predates the chip ID fields, phase 2 reads
/// the magic word from ROM and matches it against the older families.
fn detect_chip(connection: &mut Connection) -> Result<&'static ChipProfile, Error> {
    debug!("Detecting chip type...");

    let mut need_resync = false;
    let info = connection.with_timeout(CommandType::GetSecurityInfo.timeout(), |connection| {
        connection.command(Command::GetSecurityInfo)
    });

    match info {
        Ok(response) => {
            // A response that does not parse, or that predates the chip ID
            // fields, routes to the magic word like an unsupported command
            let parsed = Vec::<u8>::try_from(response)
                .ok()
                .and_then(|data| SecurityInfo::try_from(data.as_slice()).ok());

            if let Some(chip_id) = parsed.and_then(|info| info.chip_id) {
                let chip_id = chip_id as u16;
                let profile =
                    ChipProfile::from_chip_id(chip_id).ok_or(Error::UnknownChipId(chip_id))?;

                // A dummy read tells us whether Secure Download Mode is
                // active: the command is disabled there.
                match connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR) {
                    Ok(_) => {}
                    Err(Error::Rom(e)) if e.kind().is_unsupported() => {
                        debug!("Secure Download Mode detected");
                        connection.secure_download_mode = true;
                    }
                    Err(e) => return Err(e),
                }

                return Ok(profile);
            }
        }
        Err(Error::Rom(e)) if e.kind().is_unsupported() => {
            // Older ROMs reset after an unsupported command and need to be
            // re-synced before they answer anything else.
            need_resync = true;
        }
        Err(Error::InvalidResponse(_)) => {}
        Err(e) => return Err(e),
    }

    debug!("Unsupported detection protocol, switching and trying again...");
    if need_resync {
        connection.begin()?;
    }

    let magic = match connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR) {
        Ok(magic) => magic,
        Err(Error::Rom(e)) if e.kind().is_unsupported() => {
            // Both detection paths are walled off: the chip is in Secure
            // Download Mode and must be specified manually.
            return Err(Error::SecureDownloadModeDetection);
        }
        Err(e) => return Err(e),
    };

    ChipProfile::from_magic(magic).ok_or(Error::ChipDetect(magic))
}
