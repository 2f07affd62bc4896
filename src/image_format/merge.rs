//! Merging addressed binaries into a single artifact
//!
//! Input blobs are sorted by address, checked for overlap, run through the
//! flash-parameter patch logic and then handed to a [ContainerSerializer] in
//! ascending address order. The raw serializer lives here; the Intel HEX and
//! chunked container formats are alternate serializations of the exact same
//! `(address, bytes)` stream and plug in through the same trait.

use super::update_flash_params;
use crate::{error::Error, flasher::FlashSettings, target::ChipProfile};

/// Sink for merged `(address, bytes)` pairs, fed in ascending address order
pub trait ContainerSerializer {
    /// Add a blob at the given flash address.
    fn add(&mut self, addr: u32, data: &[u8]) -> Result<(), Error>;

    /// Finish the artifact and return its bytes.
    fn finish(self: Box<Self>) -> Result<Vec<u8>, Error>;
}

/// Serializer producing one contiguous binary, gaps filled with erased bytes
pub struct RawSerializer {
    output: Vec<u8>,
    /// Flash address the start of the output corresponds to
    target_offset: u32,
    /// Total size to pad the artifact to, if any
    pad_to_size: Option<u32>,
}

impl RawSerializer {
    pub fn new(target_offset: u32, pad_to_size: Option<u32>) -> Self {
        RawSerializer {
            output: Vec::new(),
            target_offset,
            pad_to_size,
        }
    }

    fn pad_to(&mut self, flash_offset: u32) {
        let position = (flash_offset - self.target_offset) as usize;
        if position > self.output.len() {
            self.output.resize(position, 0xFF);
        }
    }
}

impl ContainerSerializer for RawSerializer {
    fn add(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        if addr < self.target_offset {
            return Err(Error::OverlappingBlobs(addr, self.target_offset));
        }
        self.pad_to(addr);
        self.output.extend_from_slice(data);
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<u8>, Error> {
        if let Some(size) = self.pad_to_size {
            self.pad_to(self.target_offset + size);
        }
        Ok(self.output)
    }
}

/// Merge multiple addressed binaries into one artifact.
///
/// Every blob flashed to the profile's bootloader offset gets its flash
/// parameters patched the same way the live programmer patches them, so the
/// merged artifact and a directly-flashed set of files are byte-identical on
/// flash.
pub fn merge_images(
    profile: &ChipProfile,
    blobs: &[(u32, Vec<u8>)],
    settings: &FlashSettings,
    mut serializer: Box<dyn ContainerSerializer>,
) -> Result<Vec<u8>, Error> {
    let mut sorted: Vec<&(u32, Vec<u8>)> = blobs.iter().collect();
    sorted.sort_by_key(|(addr, _)| *addr);

    let mut last_end: Option<u32> = None;
    for (addr, data) in sorted {
        if let Some(end) = last_end {
            if *addr < end {
                return Err(Error::OverlappingBlobs(*addr, end));
            }
        }
        last_end = Some(addr + data.len() as u32);

        let patched = update_flash_params(profile, *addr, settings, data)?;
        serializer.add(*addr, patched.as_ref())?;
    }

    serializer.finish()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        flasher::{FlashSettings, FlashSize, SizeSetting},
        image_format::{FirmwareImage, ImageHeader, Segment},
        target::Chip,
    };

    #[test]
    fn raw_merge_fills_gaps_with_erased_bytes() {
        let profile = Chip::Esp32c3.profile();
        let blobs = vec![(0x10_u32, vec![0xAA; 4]), (0x20, vec![0xBB; 2])];

        let merged = merge_images(
            profile,
            &blobs,
            &FlashSettings::keep(),
            Box::new(RawSerializer::new(0, None)),
        )
        .unwrap();

        assert_eq!(merged.len(), 0x22);
        assert_eq!(&merged[0x10..0x14], &[0xAA; 4]);
        assert_eq!(&merged[0x14..0x20], &[0xFF; 12]);
        assert_eq!(&merged[0x20..0x22], &[0xBB; 2]);
    }

    #[test]
    fn merge_rejects_overlapping_blobs() {
        let profile = Chip::Esp32c3.profile();
        let blobs = vec![(0x0_u32, vec![0u8; 0x20]), (0x10, vec![0u8; 4])];

        let result = merge_images(
            profile,
            &blobs,
            &FlashSettings::keep(),
            Box::new(RawSerializer::new(0, None)),
        );
        assert!(matches!(result, Err(Error::OverlappingBlobs(0x10, 0x20))));
    }

    #[test]
    fn merge_patches_bootloader_flash_params() {
        let profile = Chip::Esp32c3.profile();

        let mut header = ImageHeader::default();
        header.flash_config = 0x20;
        let mut bootloader = FirmwareImage::new(header);
        bootloader.push_segment(Segment::new(0x0, &[0x42; 16]));
        let bootloader = bootloader.to_bytes();

        let settings = FlashSettings {
            size: SizeSetting::Set(FlashSize::_16Mb),
            ..FlashSettings::keep()
        };

        let merged = merge_images(
            profile,
            &[(profile.bootloader_offset, bootloader.clone())],
            &settings,
            Box::new(RawSerializer::new(0, None)),
        )
        .unwrap();

        assert_eq!(merged[3], 0x40, "size nibble patched in merged artifact");
        assert_eq!(merged.len(), bootloader.len());
    }

    #[test]
    fn merge_pads_to_requested_size() {
        let profile = Chip::Esp32c3.profile();
        let merged = merge_images(
            profile,
            &[(0x0, vec![1, 2, 3])],
            &FlashSettings::keep(),
            Box::new(RawSerializer::new(0, Some(0x100))),
        )
        .unwrap();

        assert_eq!(merged.len(), 0x100);
        assert_eq!(&merged[3..], &[0xFF; 0xFD][..]);
    }
}
