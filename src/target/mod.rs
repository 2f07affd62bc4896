//! Flashable target devices
//!
//! Every supported chip family is described by a [ChipProfile]: an immutable
//! record of identification keys, transfer block sizes, security
//! capabilities and register addresses. The profile is resolved once during
//! chip detection and threaded through the flasher, so no code path ever
//! dispatches on a chip name at a call site.

use std::ops::Range;

use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::flasher::FlashFrequency;

/// Address of the chip-detection magic word, readable on every generation
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x40001000;

/// Block size for writes to flash through the ROM loader
const FLASH_WRITE_SIZE: usize = 0x400;
/// Block size for writes to flash through the stub loader
const STUB_FLASH_WRITE_SIZE: usize = 0x4000;
/// Block size for writes to RAM
const RAM_WRITE_SIZE: usize = 0x1800;
/// Flash sector granularity for erase operations
const FLASH_SECTOR_SIZE: u32 = 0x1000;

const DEFAULT_FLASH_FREQ_ENCODINGS: &[(FlashFrequency, u8)] = &[
    (FlashFrequency::_20Mhz, 0x2),
    (FlashFrequency::_26Mhz, 0x1),
    (FlashFrequency::_40Mhz, 0x0),
    (FlashFrequency::_80Mhz, 0xf),
];

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP32
    Esp32,
    /// ESP32-C2, ESP8684
    Esp32c2,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-C5
    Esp32c5,
    /// ESP32-C6
    Esp32c6,
    /// ESP32-H2
    Esp32h2,
    /// ESP32-P4
    Esp32p4,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
}

impl Chip {
    /// The profile describing this chip family.
    pub fn profile(&self) -> &'static ChipProfile {
        PROFILES
            .iter()
            .find(|profile| profile.chip == *self)
            .expect("every chip has a profile")
    }
}

/// A bit field within the eFuse block of a chip
#[derive(Debug, Clone, Copy)]
pub struct EfuseField {
    /// Word offset from the eFuse base register
    pub word: u32,
    pub shift: u32,
    pub width: u32,
}

impl EfuseField {
    const fn new(word: u32, shift: u32, width: u32) -> Self {
        EfuseField { word, shift, width }
    }

    /// Extract the field's value from the raw word it lives in.
    pub fn extract(&self, word: u32) -> u32 {
        (word >> self.shift) & ((1 << self.width) - 1)
    }
}

/// SPI controller register addresses of a chip
#[derive(Debug, Clone, Copy)]
pub struct SpiRegisters {
    base: u32,
    usr_offset: u32,
    usr1_offset: u32,
    usr2_offset: u32,
    w0_offset: u32,
    mosi_length_offset: Option<u32>,
    miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    pub fn cmd(&self) -> u32 {
        self.base
    }

    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    pub fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|offset| self.base + offset)
    }

    pub fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|offset| self.base + offset)
    }
}

/// Immutable per-family constants, resolved once at detection time
#[derive(Debug)]
pub struct ChipProfile {
    pub chip: Chip,
    /// Chip ID as reported in image headers and by the get-security-info
    /// command
    pub image_chip_id: u16,
    /// `true` when the chip answers the get-security-info command with its
    /// chip ID (newer families); `false` when it is identified by the magic
    /// word (older families)
    pub detects_by_id: bool,
    /// Magic values read from [CHIP_DETECT_MAGIC_REG_ADDR], one per silicon
    /// revision
    pub magic_values: &'static [u32],
    /// Block size for flash writes through the ROM loader
    pub flash_write_size: usize,
    /// Block size for flash writes through the stub loader
    pub stub_flash_write_size: usize,
    /// Block size for RAM writes
    pub ram_write_size: usize,
    /// Erase granularity of the flash
    pub flash_sector_size: u32,
    /// Required address alignment for encrypted writes
    pub encrypted_write_align: u32,
    /// Whether a stub loader exists for this family
    pub supports_stub: bool,
    /// Whether the ROM implements the get-security-info command
    pub supports_security_info: bool,
    /// Whether the security info response carries the chip ID
    pub security_info_has_chip_id: bool,
    /// Whether the ROM loader implements the erase commands natively
    pub rom_supports_erase: bool,
    /// Whether encrypted writes use the dedicated encrypted-data command
    /// rather than an encrypted begin
    pub encrypted_data_command: bool,
    /// Flash offset the second-stage bootloader is read from
    pub bootloader_offset: u32,
    /// Base address of the eFuse block
    pub efuse_reg: u32,
    /// Major chip revision
    pub major_version: EfuseField,
    /// Minor chip revision, most significant field first
    pub minor_version: &'static [EfuseField],
    /// Whether the legacy single-byte revision field in image headers tracks
    /// the minor rather than the major revision. A historical quirk of one
    /// family, kept as an explicit table entry.
    pub legacy_rev_is_minor: bool,
    /// Secure-boot eFuse field, for families without security info support
    pub secure_boot_efuse: Option<EfuseField>,
    /// Flash-encryption counter eFuse field, for families without security
    /// info support
    pub flash_crypt_cnt_efuse: Option<EfuseField>,
    /// eFuse disabling manually encrypted downloads
    pub encrypt_disable_efuse: Option<EfuseField>,
    pub spi_registers: SpiRegisters,
    /// Address ranges mapped to flash, everything else is RAM
    pub flash_ranges: &'static [Range<u32>],
    /// Encodings of the flash frequencies supported by this family
    pub flash_freq_encodings: &'static [(FlashFrequency, u8)],
    pub default_flash_freq: FlashFrequency,
    /// Crystal frequencies (MHz) this family ships with
    pub xtal_options: &'static [u32],
    /// UART clock divider register, for families where the crystal frequency
    /// must be measured rather than assumed
    pub uart_clkdiv_reg: Option<u32>,
    /// MMU page size used to align flash-mapped image segments
    pub mmu_page_size: u32,
}

impl ChipProfile {
    /// Look up a profile by the chip ID reported by the device.
    ///
    /// Only matches families that are actually detected this way.
    pub fn from_chip_id(chip_id: u16) -> Option<&'static ChipProfile> {
        PROFILES
            .iter()
            .find(|profile| profile.detects_by_id && profile.image_chip_id == chip_id)
    }

    /// Look up a profile by the magic word read from ROM.
    pub fn from_magic(magic: u32) -> Option<&'static ChipProfile> {
        PROFILES
            .iter()
            .find(|profile| profile.magic_values.contains(&magic))
    }

    /// Look up the profile whose image header chip ID matches.
    pub fn from_image_chip_id(chip_id: u16) -> Option<&'static ChipProfile> {
        PROFILES
            .iter()
            .find(|profile| profile.image_chip_id == chip_id)
    }

    /// Is the provided address mapped to flash?
    pub fn addr_is_flash(&self, addr: u32) -> bool {
        self.flash_ranges.iter().any(|range| range.contains(&addr))
    }

    /// Numeric encoding of a flash frequency in the image header.
    pub fn encode_flash_frequency(&self, frequency: FlashFrequency) -> Option<u8> {
        self.flash_freq_encodings
            .iter()
            .find(|(f, _)| *f == frequency)
            .map(|(_, encoding)| *encoding)
    }

    /// Decode a flash frequency from its image header encoding.
    pub fn decode_flash_frequency(&self, encoding: u8) -> Option<FlashFrequency> {
        self.flash_freq_encodings
            .iter()
            .find(|(_, e)| *e == encoding)
            .map(|(frequency, _)| *frequency)
    }
}

static PROFILES: &[ChipProfile] = &[
    ChipProfile {
        chip: Chip::Esp32,
        image_chip_id: 0,
        detects_by_id: false,
        magic_values: &[0x00f0_1d83],
        flash_write_size: FLASH_WRITE_SIZE,
        stub_flash_write_size: STUB_FLASH_WRITE_SIZE,
        ram_write_size: RAM_WRITE_SIZE,
        flash_sector_size: FLASH_SECTOR_SIZE,
        encrypted_write_align: 32,
        supports_stub: true,
        supports_security_info: false,
        security_info_has_chip_id: false,
        rom_supports_erase: false,
        encrypted_data_command: true,
        bootloader_offset: 0x1000,
        efuse_reg: 0x3ff5_a000,
        major_version: EfuseField::new(3, 15, 2),
        minor_version: &[EfuseField::new(5, 24, 2)],
        legacy_rev_is_minor: false,
        secure_boot_efuse: Some(EfuseField::new(6, 4, 2)),
        flash_crypt_cnt_efuse: Some(EfuseField::new(0, 20, 7)),
        encrypt_disable_efuse: Some(EfuseField::new(0, 27, 1)),
        spi_registers: SpiRegisters {
            base: 0x3ff4_2000,
            usr_offset: 0x1c,
            usr1_offset: 0x20,
            usr2_offset: 0x24,
            w0_offset: 0x80,
            mosi_length_offset: Some(0x28),
            miso_length_offset: Some(0x2c),
        },
        flash_ranges: &[
            0x400d_0000..0x4040_0000, // IROM
            0x3f40_0000..0x3f80_0000, // DROM
        ],
        flash_freq_encodings: DEFAULT_FLASH_FREQ_ENCODINGS,
        default_flash_freq: FlashFrequency::_40Mhz,
        xtal_options: &[40, 26],
        uart_clkdiv_reg: Some(0x3ff4_0014),
        mmu_page_size: 0x10000,
    },
    ChipProfile {
        chip: Chip::Esp32c2,
        image_chip_id: 12,
        detects_by_id: true,
        magic_values: &[
            0x6f51_306f, // ECO0
            0x7c41_a06f, // ECO1
        ],
        flash_write_size: FLASH_WRITE_SIZE,
        stub_flash_write_size: STUB_FLASH_WRITE_SIZE,
        ram_write_size: RAM_WRITE_SIZE,
        flash_sector_size: FLASH_SECTOR_SIZE,
        encrypted_write_align: 16,
        supports_stub: true,
        supports_security_info: true,
        security_info_has_chip_id: true,
        rom_supports_erase: true,
        encrypted_data_command: false,
        bootloader_offset: 0x0,
        efuse_reg: 0x6000_8800,
        major_version: EfuseField::new(17, 20, 2),
        minor_version: &[EfuseField::new(17, 16, 4)],
        legacy_rev_is_minor: false,
        secure_boot_efuse: None,
        flash_crypt_cnt_efuse: None,
        encrypt_disable_efuse: None,
        spi_registers: SpiRegisters {
            base: 0x6000_2000,
            usr_offset: 0x18,
            usr1_offset: 0x1c,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        },
        flash_ranges: &[
            0x4200_0000..0x4240_0000, // IROM
            0x3c00_0000..0x3c40_0000, // DROM
        ],
        flash_freq_encodings: &[
            (FlashFrequency::_15Mhz, 0x2),
            (FlashFrequency::_20Mhz, 0x1),
            (FlashFrequency::_30Mhz, 0x0),
            (FlashFrequency::_60Mhz, 0xf),
        ],
        default_flash_freq: FlashFrequency::_30Mhz,
        xtal_options: &[40, 26],
        uart_clkdiv_reg: Some(0x6000_0014),
        mmu_page_size: 0x10000,
    },
    ChipProfile {
        chip: Chip::Esp32c3,
        image_chip_id: 5,
        detects_by_id: true,
        magic_values: &[
            0x6921_506f, // ECO1 + ECO2
            0x1b31_506f, // ECO3
            0x4881_606f, // ECO6
            0x4361_606f, // ECO7
        ],
        flash_write_size: FLASH_WRITE_SIZE,
        stub_flash_write_size: STUB_FLASH_WRITE_SIZE,
        ram_write_size: RAM_WRITE_SIZE,
        flash_sector_size: FLASH_SECTOR_SIZE,
        encrypted_write_align: 16,
        supports_stub: true,
        supports_security_info: true,
        security_info_has_chip_id: true,
        rom_supports_erase: true,
        encrypted_data_command: false,
        bootloader_offset: 0x0,
        efuse_reg: 0x6000_8800,
        major_version: EfuseField::new(5, 24, 2),
        minor_version: &[EfuseField::new(5, 23, 1), EfuseField::new(3, 18, 3)],
        // In IDF images for this family the legacy revision field holds the
        // minor revision, unlike every other family.
        legacy_rev_is_minor: true,
        secure_boot_efuse: None,
        flash_crypt_cnt_efuse: None,
        encrypt_disable_efuse: None,
        spi_registers: SpiRegisters {
            base: 0x6000_2000,
            usr_offset: 0x18,
            usr1_offset: 0x1c,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        },
        flash_ranges: &[
            0x4200_0000..0x4280_0000, // IROM
            0x3c00_0000..0x3c80_0000, // DROM
        ],
        flash_freq_encodings: DEFAULT_FLASH_FREQ_ENCODINGS,
        default_flash_freq: FlashFrequency::_40Mhz,
        xtal_options: &[40],
        uart_clkdiv_reg: None,
        mmu_page_size: 0x10000,
    },
    ChipProfile {
        chip: Chip::Esp32c5,
        image_chip_id: 23,
        detects_by_id: true,
        magic_values: &[],
        flash_write_size: FLASH_WRITE_SIZE,
        stub_flash_write_size: STUB_FLASH_WRITE_SIZE,
        ram_write_size: RAM_WRITE_SIZE,
        flash_sector_size: FLASH_SECTOR_SIZE,
        encrypted_write_align: 16,
        supports_stub: true,
        supports_security_info: true,
        security_info_has_chip_id: true,
        rom_supports_erase: true,
        encrypted_data_command: false,
        bootloader_offset: 0x2000,
        efuse_reg: 0x600b_4800,
        major_version: EfuseField::new(22, 24, 2),
        minor_version: &[EfuseField::new(22, 23, 1), EfuseField::new(22, 16, 3)],
        legacy_rev_is_minor: false,
        secure_boot_efuse: None,
        flash_crypt_cnt_efuse: None,
        encrypt_disable_efuse: None,
        spi_registers: SpiRegisters {
            base: 0x6000_3000,
            usr_offset: 0x18,
            usr1_offset: 0x1c,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        },
        flash_ranges: &[
            0x4200_0000..0x4280_0000, // IROM
            0x4280_0000..0x4300_0000, // DROM
        ],
        flash_freq_encodings: DEFAULT_FLASH_FREQ_ENCODINGS,
        default_flash_freq: FlashFrequency::_40Mhz,
        xtal_options: &[40, 48],
        uart_clkdiv_reg: None,
        mmu_page_size: 0x8000,
    },
    ChipProfile {
        chip: Chip::Esp32c6,
        image_chip_id: 13,
        detects_by_id: true,
        magic_values: &[0x2ce0_806f],
        flash_write_size: FLASH_WRITE_SIZE,
        stub_flash_write_size: STUB_FLASH_WRITE_SIZE,
        ram_write_size: RAM_WRITE_SIZE,
        flash_sector_size: FLASH_SECTOR_SIZE,
        encrypted_write_align: 16,
        supports_stub: true,
        supports_security_info: true,
        security_info_has_chip_id: true,
        rom_supports_erase: true,
        encrypted_data_command: false,
        bootloader_offset: 0x0,
        efuse_reg: 0x600b_0800,
        major_version: EfuseField::new(22, 24, 2),
        minor_version: &[EfuseField::new(22, 23, 1), EfuseField::new(22, 16, 3)],
        legacy_rev_is_minor: false,
        secure_boot_efuse: None,
        flash_crypt_cnt_efuse: None,
        encrypt_disable_efuse: None,
        spi_registers: SpiRegisters {
            base: 0x6000_3000,
            usr_offset: 0x18,
            usr1_offset: 0x1c,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        },
        flash_ranges: &[
            0x4200_0000..0x4280_0000, // IROM
            0x4280_0000..0x4300_0000, // DROM
        ],
        flash_freq_encodings: DEFAULT_FLASH_FREQ_ENCODINGS,
        default_flash_freq: FlashFrequency::_40Mhz,
        xtal_options: &[40],
        uart_clkdiv_reg: None,
        mmu_page_size: 0x8000,
    },
    ChipProfile {
        chip: Chip::Esp32h2,
        image_chip_id: 16,
        detects_by_id: true,
        magic_values: &[0xd7b7_3e80],
        flash_write_size: FLASH_WRITE_SIZE,
        stub_flash_write_size: STUB_FLASH_WRITE_SIZE,
        ram_write_size: RAM_WRITE_SIZE,
        flash_sector_size: FLASH_SECTOR_SIZE,
        encrypted_write_align: 16,
        supports_stub: true,
        supports_security_info: true,
        security_info_has_chip_id: true,
        rom_supports_erase: true,
        encrypted_data_command: false,
        bootloader_offset: 0x0,
        efuse_reg: 0x600b_0800,
        major_version: EfuseField::new(22, 24, 2),
        minor_version: &[EfuseField::new(22, 23, 1), EfuseField::new(22, 16, 3)],
        legacy_rev_is_minor: false,
        secure_boot_efuse: None,
        flash_crypt_cnt_efuse: None,
        encrypt_disable_efuse: None,
        spi_registers: SpiRegisters {
            base: 0x6000_3000,
            usr_offset: 0x18,
            usr1_offset: 0x1c,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        },
        flash_ranges: &[
            0x4200_0000..0x4280_0000, // IROM
            0x4280_0000..0x4300_0000, // DROM
        ],
        flash_freq_encodings: &[
            (FlashFrequency::_12Mhz, 0x2),
            (FlashFrequency::_16Mhz, 0x1),
            (FlashFrequency::_24Mhz, 0x0),
            (FlashFrequency::_48Mhz, 0xf),
        ],
        default_flash_freq: FlashFrequency::_24Mhz,
        xtal_options: &[32],
        uart_clkdiv_reg: None,
        mmu_page_size: 0x8000,
    },
    ChipProfile {
        chip: Chip::Esp32p4,
        image_chip_id: 18,
        detects_by_id: true,
        magic_values: &[0x0, 0x0add_bad0],
        flash_write_size: FLASH_WRITE_SIZE,
        stub_flash_write_size: STUB_FLASH_WRITE_SIZE,
        ram_write_size: RAM_WRITE_SIZE,
        flash_sector_size: FLASH_SECTOR_SIZE,
        encrypted_write_align: 16,
        supports_stub: true,
        supports_security_info: true,
        security_info_has_chip_id: true,
        rom_supports_erase: true,
        encrypted_data_command: false,
        bootloader_offset: 0x2000,
        efuse_reg: 0x5012_d000,
        major_version: EfuseField::new(22, 24, 2),
        minor_version: &[EfuseField::new(22, 23, 1), EfuseField::new(22, 16, 3)],
        legacy_rev_is_minor: false,
        secure_boot_efuse: None,
        flash_crypt_cnt_efuse: None,
        encrypt_disable_efuse: None,
        spi_registers: SpiRegisters {
            base: 0x5008_d000,
            usr_offset: 0x18,
            usr1_offset: 0x1c,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        },
        flash_ranges: &[
            0x4000_0000..0x4c00_0000, // IROM/DROM
        ],
        flash_freq_encodings: DEFAULT_FLASH_FREQ_ENCODINGS,
        default_flash_freq: FlashFrequency::_40Mhz,
        xtal_options: &[40],
        uart_clkdiv_reg: None,
        mmu_page_size: 0x10000,
    },
    ChipProfile {
        chip: Chip::Esp32s2,
        image_chip_id: 2,
        detects_by_id: false,
        magic_values: &[0x0000_07c6],
        flash_write_size: FLASH_WRITE_SIZE,
        stub_flash_write_size: STUB_FLASH_WRITE_SIZE,
        ram_write_size: RAM_WRITE_SIZE,
        flash_sector_size: FLASH_SECTOR_SIZE,
        encrypted_write_align: 16,
        supports_stub: true,
        supports_security_info: true,
        // The get-security-info response of this family predates the chip ID
        // fields, so it is still identified by the magic word.
        security_info_has_chip_id: false,
        rom_supports_erase: true,
        encrypted_data_command: false,
        bootloader_offset: 0x1000,
        efuse_reg: 0x3f41_a000,
        major_version: EfuseField::new(20, 18, 2),
        minor_version: &[EfuseField::new(20, 16, 2)],
        legacy_rev_is_minor: false,
        secure_boot_efuse: None,
        flash_crypt_cnt_efuse: None,
        encrypt_disable_efuse: None,
        spi_registers: SpiRegisters {
            base: 0x3f40_2000,
            usr_offset: 0x18,
            usr1_offset: 0x1c,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        },
        flash_ranges: &[
            0x4008_0000..0x40b8_0000, // IROM
            0x3f00_0000..0x3f3f_0000, // DROM
        ],
        flash_freq_encodings: DEFAULT_FLASH_FREQ_ENCODINGS,
        default_flash_freq: FlashFrequency::_40Mhz,
        xtal_options: &[40],
        uart_clkdiv_reg: None,
        mmu_page_size: 0x10000,
    },
    ChipProfile {
        chip: Chip::Esp32s3,
        image_chip_id: 9,
        detects_by_id: true,
        magic_values: &[0x9],
        flash_write_size: FLASH_WRITE_SIZE,
        stub_flash_write_size: STUB_FLASH_WRITE_SIZE,
        ram_write_size: RAM_WRITE_SIZE,
        flash_sector_size: FLASH_SECTOR_SIZE,
        encrypted_write_align: 16,
        supports_stub: true,
        supports_security_info: true,
        security_info_has_chip_id: true,
        rom_supports_erase: true,
        encrypted_data_command: false,
        bootloader_offset: 0x0,
        efuse_reg: 0x6000_7000,
        major_version: EfuseField::new(22, 24, 2),
        minor_version: &[EfuseField::new(22, 23, 1), EfuseField::new(20, 18, 3)],
        legacy_rev_is_minor: false,
        secure_boot_efuse: None,
        flash_crypt_cnt_efuse: None,
        encrypt_disable_efuse: None,
        spi_registers: SpiRegisters {
            base: 0x6000_2000,
            usr_offset: 0x18,
            usr1_offset: 0x1c,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        },
        flash_ranges: &[
            0x4200_0000..0x4400_0000, // IROM
            0x3c00_0000..0x3e00_0000, // DROM
        ],
        flash_freq_encodings: DEFAULT_FLASH_FREQ_ENCODINGS,
        default_flash_freq: FlashFrequency::_40Mhz,
        xtal_options: &[40],
        uart_clkdiv_reg: None,
        mmu_page_size: 0x10000,
    },
];

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn every_chip_has_a_profile() {
        for chip in Chip::iter() {
            let profile = chip.profile();
            assert_eq!(profile.chip, chip);
        }
    }

    #[test]
    fn detection_keys_are_unambiguous() {
        for profile in PROFILES {
            for magic in profile.magic_values {
                assert_eq!(
                    ChipProfile::from_magic(*magic).unwrap().chip,
                    profile.chip,
                    "magic {magic:#x} resolves to the wrong chip"
                );
            }
            if profile.detects_by_id {
                assert_eq!(
                    ChipProfile::from_chip_id(profile.image_chip_id)
                        .unwrap()
                        .chip,
                    profile.chip
                );
            }
        }
    }

    #[test]
    fn magic_detection_covers_older_families() {
        assert_eq!(
            ChipProfile::from_magic(0x00f0_1d83).unwrap().chip,
            Chip::Esp32
        );
        assert_eq!(
            ChipProfile::from_magic(0x0000_07c6).unwrap().chip,
            Chip::Esp32s2
        );
        assert!(ChipProfile::from_magic(0xdead_beef).is_none());
    }

    #[test]
    fn efuse_field_extraction() {
        let field = EfuseField::new(5, 24, 2);
        assert_eq!(field.extract(0x0300_0000), 3);
        assert_eq!(field.extract(0x0100_0000), 1);
        assert_eq!(field.extract(0x00ff_ffff), 0);
    }
}
