//! In-memory model of a firmware image
//!
//! [FirmwareImage] round-trips the serialized format byte-exactly: parsing
//! and re-serializing an image yields the same bytes, and the checksum and
//! digest fields are always recomputed on save so a header or segment
//! mutation can never leave a stale integrity field behind.

use std::{borrow::Cow, fs, mem::size_of, path::Path};

use bytemuck::{bytes_of, from_bytes};
use log::{debug, warn};
use sha2::{Digest, Sha256};

use super::{checksum, ImageHeader, Segment, SegmentHeader, CHECKSUM_INIT, ESP_MAGIC};
use crate::{
    error::Error,
    flasher::{FlashSettings, FlashSize, Setting, SizeSetting},
    target::{Chip, ChipProfile},
};

const SEG_HEADER_LEN: usize = size_of::<SegmentHeader>();
const IMAGE_HEADER_LEN: usize = size_of::<ImageHeader>();
const SHA256_DIGEST_LEN: usize = 32;

/// A firmware image: header metadata plus an ordered list of load segments
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub header: ImageHeader,
    segments: Vec<Segment<'static>>,
    /// Checksum byte found when parsing, kept for validity reporting only
    stored_checksum: Option<u8>,
    /// Digest found when parsing, kept for validity reporting only
    stored_digest: Option<[u8; 32]>,
    /// Length of the serialized image up to (not including) the digest
    data_len: usize,
}

impl FirmwareImage {
    /// Create an empty image with the given header.
    pub fn new(header: ImageHeader) -> Self {
        FirmwareImage {
            header,
            segments: Vec::new(),
            stored_checksum: None,
            stored_digest: None,
            data_len: 0,
        }
    }

    /// Append a segment to the image.
    ///
    /// Segments must not overlap; adjacent segments should be merged before
    /// being added.
    pub fn push_segment(&mut self, segment: Segment<'_>) {
        self.segments.push(segment.into_owned());
    }

    /// The image's segments, in stored order.
    pub fn segments(&self) -> &[Segment<'static>] {
        &self.segments
    }

    /// Parse a serialized firmware image.
    ///
    /// Integrity fields are read but never trusted: they are reported through
    /// [FirmwareImage::describe], while [FirmwareImage::to_bytes] always
    /// recomputes them.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 8 {
            return Err(Error::TruncatedImage {
                expected: 8,
                have: data.len(),
            });
        }
        if data[0] != ESP_MAGIC {
            return Err(Error::InvalidImageMagic(data[0]));
        }
        if data.len() < IMAGE_HEADER_LEN {
            return Err(Error::TruncatedImage {
                expected: IMAGE_HEADER_LEN,
                have: data.len(),
            });
        }

        let header: ImageHeader = *from_bytes(&data[..IMAGE_HEADER_LEN]);
        if header.append_digest > 1 {
            return Err(Error::InvalidResponse(format!(
                "append digest field must be 0 or 1, is {}",
                header.append_digest
            )));
        }

        let mut offset = IMAGE_HEADER_LEN;
        let mut segments = Vec::with_capacity(header.segment_count as usize);

        for _ in 0..header.segment_count {
            if data.len() < offset + SEG_HEADER_LEN {
                return Err(Error::TruncatedImage {
                    expected: offset + SEG_HEADER_LEN,
                    have: data.len(),
                });
            }
            let segment_header: SegmentHeader =
                *from_bytes(&data[offset..offset + SEG_HEADER_LEN]);
            offset += SEG_HEADER_LEN;

            let length = segment_header.length as usize;
            if data.len() < offset + length {
                return Err(Error::TruncatedImage {
                    expected: offset + length,
                    have: data.len(),
                });
            }
            segments.push(Segment {
                addr: segment_header.addr,
                data: Cow::Owned(data[offset..offset + length].to_vec()),
            });
            offset += length;
        }

        // The image is padded so the checksum lands on the last byte of a
        // 16-byte boundary.
        let checksum_offset = offset + 15 - (offset % 16);
        if data.len() < checksum_offset + 1 {
            return Err(Error::TruncatedImage {
                expected: checksum_offset + 1,
                have: data.len(),
            });
        }
        let stored_checksum = data[checksum_offset];
        let data_len = checksum_offset + 1;

        let stored_digest = if header.append_digest == 1 {
            if data.len() < data_len + SHA256_DIGEST_LEN {
                return Err(Error::TruncatedImage {
                    expected: data_len + SHA256_DIGEST_LEN,
                    have: data.len(),
                });
            }
            let mut digest = [0; SHA256_DIGEST_LEN];
            digest.copy_from_slice(&data[data_len..data_len + SHA256_DIGEST_LEN]);
            Some(digest)
        } else {
            None
        };

        Ok(FirmwareImage {
            header,
            segments,
            stored_checksum: Some(stored_checksum),
            stored_digest,
            data_len,
        })
    }

    /// XOR checksum over all segment payload bytes, in stored order.
    pub fn checksum(&self) -> u8 {
        self.segments
            .iter()
            .fold(CHECKSUM_INIT, |acc, segment| checksum(segment.data(), acc))
    }

    /// Serialize the image.
    ///
    /// The checksum and the digest (when enabled) are recomputed from the
    /// current header and segments, never copied from a parsed source.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = self.header;
        header.segment_count = self.segments.len() as u8;

        let mut data = bytes_of(&header).to_vec();

        for segment in &self.segments {
            let padding = (4 - segment.size() % 4) % 4;
            let segment_header = SegmentHeader {
                addr: segment.addr,
                length: segment.size() + padding,
            };
            data.extend_from_slice(bytes_of(&segment_header));
            data.extend_from_slice(segment.data());
            data.extend_from_slice(&[0u8; 4][..padding as usize]);
        }

        let padding = 15 - (data.len() % 16);
        data.extend_from_slice(&[0u8; 16][..padding]);
        data.push(self.checksum());

        if header.append_digest == 1 {
            let mut hasher = Sha256::new();
            hasher.update(&data);
            let digest = hasher.finalize();
            data.extend_from_slice(&digest);
        }

        data
    }

    /// Build the structured report for this image.
    pub fn describe(&self) -> ImageInfo {
        let serialized = self.to_bytes();

        let calculated_digest = self.stored_digest.map(|stored| {
            let mut hasher = Sha256::new();
            hasher.update(&serialized[..self.data_len.min(serialized.len())]);
            let calculated: [u8; 32] = hasher.finalize().into();
            DigestInfo {
                stored,
                calculated,
                valid: stored == calculated,
            }
        });

        ImageInfo {
            chip: ChipProfile::from_image_chip_id(self.header.chip_id).map(|p| p.chip),
            chip_id: self.header.chip_id,
            entry: self.header.entry,
            flash_mode: self.header.flash_mode,
            flash_size_encoding: self.header.flash_config >> 4,
            flash_freq_encoding: self.header.flash_config & 0x0F,
            min_rev: self.header.min_rev,
            min_chip_rev_full: self.header.min_chip_rev_full,
            max_chip_rev_full: self.header.max_chip_rev_full,
            mmu_page_size: match self.header.mmu_page_size {
                0 => None,
                log2 => Some(1 << log2),
            },
            segments: self
                .segments
                .iter()
                .map(|segment| SegmentInfo {
                    addr: segment.addr,
                    length: segment.size(),
                })
                .collect(),
            stored_checksum: self.stored_checksum,
            calculated_checksum: self.checksum(),
            digest: calculated_digest,
        }
    }

    /// Which revision fields of the image to trust, and the resulting bounds.
    ///
    /// Images carry both the legacy single-byte minimum revision and the
    /// newer min/max pair. The newer fields win when the maximum is set to a
    /// real value, or when it still holds the unset-default but the new
    /// minimum is in use. The documented precedence is preserved exactly;
    /// further chip-specific exceptions belong in the profile table, not
    /// here.
    pub fn revision_requirement(&self) -> RevisionRequirement {
        let min_rev = self.header.min_rev;
        let min_full = self.header.min_chip_rev_full;
        let max_full = self.header.max_chip_rev_full;

        let use_full_fields = if max_full == 0 {
            // image predates the min/max pair entirely
            false
        } else if max_full == u16::MAX {
            // default value of the maximum; trust the pair unless the image
            // only filled in the legacy field
            !(min_full == 0 && min_rev != 0)
        } else {
            true
        };

        if use_full_fields {
            RevisionRequirement::Full {
                min: min_full,
                max: max_full,
            }
        } else if min_rev != 0 {
            RevisionRequirement::Legacy(min_rev)
        } else {
            RevisionRequirement::None
        }
    }
}

/// Revision bounds declared by an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionRequirement {
    /// Image declares no revision requirement
    None,
    /// Only the legacy single-byte minimum is set
    Legacy(u8),
    /// The extended min/max pair is authoritative, `major * 100 + minor`
    Full { min: u16, max: u16 },
}

/// Stored and recalculated digest of an image
#[derive(Debug, Clone)]
pub struct DigestInfo {
    pub stored: [u8; 32],
    pub calculated: [u8; 32],
    pub valid: bool,
}

/// One entry of an image's segment table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub addr: u32,
    pub length: u32,
}

/// Structured report about a firmware image, produced without a device
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Chip the image targets, when the chip ID is known
    pub chip: Option<Chip>,
    pub chip_id: u16,
    pub entry: u32,
    pub flash_mode: u8,
    pub flash_size_encoding: u8,
    pub flash_freq_encoding: u8,
    pub min_rev: u8,
    pub min_chip_rev_full: u16,
    pub max_chip_rev_full: u16,
    pub mmu_page_size: Option<u32>,
    pub segments: Vec<SegmentInfo>,
    pub stored_checksum: Option<u8>,
    pub calculated_checksum: u8,
    pub digest: Option<DigestInfo>,
}

impl ImageInfo {
    pub fn checksum_valid(&self) -> bool {
        self.stored_checksum == Some(self.calculated_checksum)
    }
}

/// Parse the image stored at `path` and build its structured report.
pub fn describe_image(path: &Path) -> Result<ImageInfo, Error> {
    let data =
        fs::read(path).map_err(|e| Error::FileOpen(path.display().to_string(), e))?;
    Ok(FirmwareImage::parse(&data)?.describe())
}

/// Update the flash mode, size and frequency fields of a bootloader image,
/// if applicable.
///
/// This is a no-op unless `address` is the profile's bootloader offset and at
/// least one setting is not "keep". The first bytes must look like an image
/// header *and* the whole blob must parse as one before anything is touched,
/// so an encrypted payload that happens to start with the magic byte is left
/// alone. When the image carries a trailing digest it is recomputed after the
/// patch; a stale digest in the source image is reported as a warning, not a
/// failure.
pub fn update_flash_params<'a>(
    profile: &ChipProfile,
    address: u32,
    settings: &FlashSettings,
    image: &'a [u8],
) -> Result<Cow<'a, [u8]>, Error> {
    if image.len() < 8 {
        // not long enough to be a bootloader image
        return Ok(Cow::Borrowed(image));
    }
    if address != profile.bootloader_offset {
        // not flashing the bootloader offset, so don't modify this
        return Ok(Cow::Borrowed(image));
    }
    if settings.is_keep() {
        return Ok(Cow::Borrowed(image));
    }

    if image[0] != ESP_MAGIC {
        warn!(
            "Image file at {address:#x} doesn't look like an image file, \
             so not changing any flash settings"
        );
        return Ok(Cow::Borrowed(image));
    }

    // Make sure this really is an image, and not just data that starts with
    // the magic byte
    let parsed = match FirmwareImage::parse(image) {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(
                "Image file at {address:#x} is not a valid {} image, \
                 so not changing any flash settings",
                profile.chip
            );
            return Ok(Cow::Borrowed(image));
        }
    };

    let mut flash_mode = image[2];
    if let Setting::Set(mode) = settings.mode {
        flash_mode = mode as u8;
    }

    let mut flash_freq = image[3] & 0x0F;
    if let Setting::Set(freq) = settings.freq {
        flash_freq = profile
            .encode_flash_frequency(freq)
            .ok_or(Error::UnsupportedFlashFrequency {
                chip: profile.chip,
                frequency: freq,
            })?;
    }

    let mut flash_size = image[3] & 0xF0;
    if let SizeSetting::Set(size) = settings.size {
        flash_size = encode_flash_size(size)? << 4;
    }

    let flash_params = [flash_mode, flash_size | flash_freq];
    if flash_params[..] == image[2..4] {
        return Ok(Cow::Borrowed(image));
    }

    debug!(
        "Flash params set to {:#06x}",
        u16::from_be_bytes(flash_params)
    );

    let mut patched = image.to_vec();
    patched[2..4].copy_from_slice(&flash_params);

    // recalculate the SHA digest if one is appended
    if parsed.header.append_digest == 1 {
        let data_len = parsed.data_len;

        let mut hasher = Sha256::new();
        hasher.update(&image[..data_len]);
        let original_digest: [u8; 32] = hasher.finalize().into();

        if parsed.stored_digest != Some(original_digest) {
            warn!(
                "SHA digest of the source image was already stale!\n\
                 \tExpected calculated SHA: {}\n\
                 \tSHA stored in binary:    {}",
                hex(&original_digest),
                hex(&parsed.stored_digest.unwrap_or_default())
            );
        }

        let mut hasher = Sha256::new();
        hasher.update(&patched[..data_len]);
        let digest: [u8; 32] = hasher.finalize().into();
        patched[data_len..data_len + SHA256_DIGEST_LEN].copy_from_slice(&digest);
    }

    Ok(Cow::Owned(patched))
}

/// Encode a flash size into the image header nibble.
pub(crate) fn encode_flash_size(size: FlashSize) -> Result<u8, Error> {
    use FlashSize::*;

    match size {
        _1Mb => Ok(0),
        _2Mb => Ok(1),
        _4Mb => Ok(2),
        _8Mb => Ok(3),
        _16Mb => Ok(4),
        _32Mb => Ok(5),
        _64Mb => Ok(6),
        _128Mb => Ok(7),
        _256Mb => Ok(8),
        other => Err(Error::UnsupportedFlash(other as u8)),
    }
}

pub(crate) fn hex<T: AsRef<[u8]>>(data: T) -> String {
    const HEX_CHARS: &[u8] = b"0123456789abcdef";

    let mut s = String::new();
    for byte in data.as_ref() {
        s.push(HEX_CHARS[(byte >> 4) as usize] as char);
        s.push(HEX_CHARS[(byte & 0x0F) as usize] as char);
    }

    s
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::flasher::FlashMode;

    fn test_image(segments: &[(u32, Vec<u8>)]) -> FirmwareImage {
        let mut header = ImageHeader {
            entry: 0x4037_0000,
            chip_id: 5,
            ..ImageHeader::default()
        };
        header.flash_config = 0x20;

        let mut image = FirmwareImage::new(header);
        for (addr, data) in segments {
            image.push_segment(Segment::new(*addr, data));
        }
        image
    }

    #[test]
    fn checksum_round_trips_through_serialization() {
        for segments in [
            vec![(0x1000_u32, vec![0xAA_u8; 7])],
            vec![(0x1000, vec![0x55; 256]), (0x2000, vec![0x12; 33])],
            vec![
                (0x0, vec![1, 2, 3]),
                (0x100, vec![4; 64]),
                (0x1000, vec![0xFF; 13]),
            ],
        ] {
            let image = test_image(&segments);
            let bytes = image.to_bytes();

            let parsed = FirmwareImage::parse(&bytes).unwrap();
            assert_eq!(parsed.stored_checksum, Some(parsed.checksum()));
            assert!(parsed.describe().checksum_valid());

            // parse → serialize is byte-identical
            assert_eq!(parsed.to_bytes(), bytes);
        }
    }

    #[test]
    fn digest_covers_all_bytes_before_it() {
        let image = test_image(&[(0x1000, vec![0xAB; 100])]);
        let bytes = image.to_bytes();

        let mut hasher = Sha256::new();
        hasher.update(&bytes[..bytes.len() - 32]);
        let digest: [u8; 32] = hasher.finalize().into();

        assert_eq!(&bytes[bytes.len() - 32..], &digest);
        assert!(FirmwareImage::parse(&bytes)
            .unwrap()
            .describe()
            .digest
            .unwrap()
            .valid);
    }

    #[test]
    fn describe_reports_invalid_magic_without_crashing() {
        // a hand-built 8-byte header with a mismatched magic byte
        let bogus = [0x42, 0x01, 0x02, 0x20, 0x00, 0x00, 0x00, 0x40];
        match FirmwareImage::parse(&bogus) {
            Err(Error::InvalidImageMagic(0x42)) => {}
            other => panic!("expected invalid magic error, got {other:?}"),
        }
    }

    #[test]
    fn patching_to_current_values_is_identity() {
        let profile = Chip::Esp32c3.profile();
        let image = test_image(&[(0x0, vec![0x11; 50])]);
        let bytes = image.to_bytes();

        // flash_config is 0x20: 4MB, 40MHz, mode byte 0
        let settings = FlashSettings {
            mode: Setting::Set(FlashMode::Qio),
            freq: Setting::Keep,
            size: SizeSetting::Set(FlashSize::_4Mb),
        };
        // mode Qio == 0 == current value, size 4MB == current value
        let patched = update_flash_params(profile, profile.bootloader_offset, &settings, &bytes)
            .unwrap();
        assert_eq!(patched.as_ref(), bytes.as_slice());
        assert!(matches!(patched, Cow::Borrowed(_)));
    }

    #[test]
    fn patching_changes_only_params_and_digest() {
        let profile = Chip::Esp32c3.profile();
        let image = test_image(&[(0x0, vec![0x11; 50])]);
        let bytes = image.to_bytes();

        let settings = FlashSettings {
            mode: Setting::Keep,
            freq: Setting::Keep,
            size: SizeSetting::Set(FlashSize::_8Mb),
        };
        let patched = update_flash_params(profile, profile.bootloader_offset, &settings, &bytes)
            .unwrap()
            .into_owned();

        assert_eq!(patched.len(), bytes.len());
        assert_eq!(patched[3], 0x30, "size nibble updated");

        let differing: Vec<usize> = (0..bytes.len())
            .filter(|i| bytes[*i] != patched[*i])
            .collect();
        // byte 3 plus (some of) the trailing 32 digest bytes
        assert!(differing.contains(&3));
        for i in differing {
            assert!(
                i == 3 || i >= bytes.len() - 32,
                "unexpected change at offset {i}"
            );
        }

        // and the patched digest is once again self-consistent
        assert!(FirmwareImage::parse(&patched)
            .unwrap()
            .describe()
            .digest
            .unwrap()
            .valid);
    }

    #[test]
    fn patching_ignores_non_bootloader_addresses() {
        let profile = Chip::Esp32c3.profile();
        let image = test_image(&[(0x0, vec![0x11; 50])]);
        let bytes = image.to_bytes();

        let settings = FlashSettings {
            mode: Setting::Keep,
            freq: Setting::Keep,
            size: SizeSetting::Set(FlashSize::_8Mb),
        };
        let patched = update_flash_params(profile, 0x1_0000, &settings, &bytes).unwrap();
        assert!(matches!(patched, Cow::Borrowed(_)));
    }

    #[test]
    fn patching_leaves_magic_lookalikes_alone() {
        let profile = Chip::Esp32c3.profile();
        // starts with the magic byte but is not a parseable image
        let lookalike = [ESP_MAGIC, 0xFF, 0x00, 0x20, 1, 2, 3, 4, 5, 6];

        let settings = FlashSettings {
            mode: Setting::Keep,
            freq: Setting::Keep,
            size: SizeSetting::Set(FlashSize::_8Mb),
        };
        let patched =
            update_flash_params(profile, profile.bootloader_offset, &settings, &lookalike)
                .unwrap();
        assert_eq!(patched.as_ref(), &lookalike);
    }

    #[test]
    fn revision_precedence_matches_documented_rules() {
        let mut image = test_image(&[(0x0, vec![0; 4])]);

        // no fields set at all: max_full at default, min_full 0, min_rev 0
        image.header.min_rev = 0;
        image.header.min_chip_rev_full = 0;
        image.header.max_chip_rev_full = u16::MAX;
        assert_eq!(
            image.revision_requirement(),
            RevisionRequirement::Full { min: 0, max: u16::MAX }
        );

        // legacy-only image
        image.header.min_rev = 3;
        assert_eq!(image.revision_requirement(), RevisionRequirement::Legacy(3));

        // extended fields take priority when present and non-default
        image.header.min_chip_rev_full = 101;
        assert_eq!(
            image.revision_requirement(),
            RevisionRequirement::Full { min: 101, max: u16::MAX }
        );

        // image predating the extended fields entirely
        image.header.min_chip_rev_full = 0;
        image.header.max_chip_rev_full = 0;
        assert_eq!(image.revision_requirement(), RevisionRequirement::Legacy(3));

        // a real maximum always wins
        image.header.max_chip_rev_full = 205;
        image.header.min_rev = 9;
        assert_eq!(
            image.revision_requirement(),
            RevisionRequirement::Full { min: 0, max: 205 }
        );
    }
}
