//! Building firmware images from linked executables
//!
//! The ELF reader is only an input adapter: it surfaces the entry point and
//! the loadable sections, everything else (merging, alignment, header and
//! integrity fields) is the image model's job and works the same whether the
//! segments came from an ELF or anywhere else.

use object::{read::elf::ElfFile32 as ElfFile, Object, ObjectSection, SectionKind};

use crate::{
    error::Error,
    flasher::{FlashSettings, Setting, SizeSetting},
    image_format::{
        merge_adjacent_segments, FirmwareImage, ImageHeader, Segment,
    },
    target::ChipProfile,
};

const SEG_HEADER_LEN: u32 = 8;
const IMAGE_HEADER_LEN: u32 = 24;

/// Extract the entry point and the loadable segments from an ELF.
pub fn load_segments(elf_data: &[u8]) -> Result<(u32, Vec<Segment<'_>>), Error> {
    let elf = ElfFile::<object::Endianness>::parse(elf_data)?;

    let mut segments = Vec::new();
    for section in elf.sections() {
        let address = section.address() as u32;
        if address == 0 {
            continue;
        }
        if !matches!(
            section.kind(),
            SectionKind::Text
                | SectionKind::Data
                | SectionKind::ReadOnlyData
                | SectionKind::ReadOnlyString
        ) {
            continue;
        }
        let data = section.data()?;
        if data.is_empty() {
            continue;
        }

        segments.push(Segment::new(address, data));
    }

    Ok((elf.entry() as u32, segments))
}

/// Build a flashable firmware image from the linked executable at `path`.
pub fn build_image_from_path(
    profile: &ChipProfile,
    path: &std::path::Path,
    settings: &FlashSettings,
    min_chip_rev_full: u16,
    mmu_page_size: Option<u32>,
) -> Result<FirmwareImage, Error> {
    let elf_data = std::fs::read(path)
        .map_err(|e| Error::FileOpen(path.display().to_string(), e))?;
    build_image(profile, &elf_data, settings, min_chip_rev_full, mmu_page_size)
}

/// Build a flashable firmware image from a linked executable.
pub fn build_image(
    profile: &ChipProfile,
    elf_data: &[u8],
    settings: &FlashSettings,
    min_chip_rev_full: u16,
    mmu_page_size: Option<u32>,
) -> Result<FirmwareImage, Error> {
    let (entry, segments) = load_segments(elf_data)?;
    build_image_from_segments(
        profile,
        entry,
        segments,
        settings,
        min_chip_rev_full,
        mmu_page_size,
    )
}

/// Build a flashable firmware image from an entry point and raw segments.
///
/// Flash-mapped segments are aligned so their load address and file offset
/// agree modulo the MMU page size, with zero-filled pad segments inserted
/// where needed; RAM segments follow unaligned. The caller gets a fully
/// assembled image whose checksum and digest are computed on serialization.
pub fn build_image_from_segments(
    profile: &ChipProfile,
    entry: u32,
    segments: Vec<Segment<'_>>,
    settings: &FlashSettings,
    min_chip_rev_full: u16,
    mmu_page_size: Option<u32>,
) -> Result<FirmwareImage, Error> {
    let mmu_page_size = mmu_page_size.unwrap_or(profile.mmu_page_size);

    let mut header = ImageHeader {
        entry,
        chip_id: profile.image_chip_id,
        min_chip_rev_full,
        ..ImageHeader::default()
    };
    if mmu_page_size != profile.mmu_page_size {
        header.mmu_page_size = mmu_page_size.ilog2() as u8;
    }
    if let Setting::Set(mode) = settings.mode {
        header.flash_mode = mode as u8;
    }

    let size = match settings.size {
        SizeSetting::Set(size) => size,
        _ => Default::default(),
    };
    let freq = match settings.freq {
        Setting::Set(freq) => freq,
        Setting::Keep => profile.default_flash_freq,
    };
    let flash_size = crate::image_format::encode_flash_size(size)?;
    let flash_freq =
        profile
            .encode_flash_frequency(freq)
            .ok_or(Error::UnsupportedFlashFrequency {
                chip: profile.chip,
                frequency: freq,
            })?;
    header.flash_config = (flash_size << 4) | flash_freq;

    let (flash_segments, ram_segments): (Vec<_>, Vec<_>) = segments
        .into_iter()
        .partition(|segment| profile.addr_is_flash(segment.addr));

    let mut flash_segments = merge_adjacent_segments(flash_segments);
    let mut ram_segments = merge_adjacent_segments(ram_segments);
    for segment in flash_segments.iter_mut().chain(ram_segments.iter_mut()) {
        segment.pad_align(4);
    }

    let mut image = FirmwareImage::new(header);
    // running length of the serialized image, which the alignment of
    // flash-mapped segments is computed against
    let mut offset = IMAGE_HEADER_LEN;

    for mut segment in flash_segments {
        let pad_len = segment_padding(offset, segment.addr, mmu_page_size);
        if pad_len > 0 {
            let padding = Segment {
                addr: 0,
                data: vec![0u8; pad_len as usize].into(),
            };
            offset += SEG_HEADER_LEN + padding.size();
            image.push_segment(padding);
        }

        // The second-stage bootloader does not map the final MMU page if a
        // flash segment ends fewer than 0x24 bytes past the page boundary.
        let end_pos = offset + SEG_HEADER_LEN + segment.size();
        let segment_remainder = end_pos % mmu_page_size;
        if segment_remainder < 0x24 {
            static PADDING: [u8; 0x24] = [0; 0x24];
            segment += &PADDING[0..(0x24 - segment_remainder as usize)];
            segment.pad_align(4);
        }

        offset += SEG_HEADER_LEN + segment.size();
        image.push_segment(segment);
    }

    for segment in ram_segments {
        image.push_segment(segment);
    }

    Ok(image)
}

/// Padding (in data bytes) required before a flash segment's header so that
/// after the next 8-byte header is written, the file offset and the load
/// address agree modulo the MMU page size.
fn segment_padding(offset: u32, addr: u32, align_to: u32) -> u32 {
    let align_past = (addr.wrapping_sub(SEG_HEADER_LEN)) % align_to;
    let pad_len = ((align_to - (offset % align_to)) + align_past) % align_to;

    if pad_len == 0 {
        0
    } else if pad_len > SEG_HEADER_LEN {
        pad_len - SEG_HEADER_LEN
    } else {
        pad_len + align_to - SEG_HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{flasher::FlashSettings, image_format::FirmwareImage, target::Chip};

    #[test]
    fn built_image_aligns_flash_segments_to_mmu_pages() {
        let profile = Chip::Esp32c3.profile();
        let code = vec![0x5A_u8; 0x100];
        let segments = vec![Segment::new(0x4200_0020, &code)];

        let image = build_image_from_segments(
            profile,
            0x4200_0020,
            segments,
            &FlashSettings::keep(),
            0,
            None,
        )
        .unwrap();

        let bytes = image.to_bytes();
        let parsed = FirmwareImage::parse(&bytes).unwrap();

        // locate the flash segment and confirm its data offset lines up with
        // its load address modulo the page size
        let mut offset = 24_u32;
        let mut found = false;
        for segment in parsed.segments() {
            offset += 8;
            if segment.addr == 0x4200_0020 {
                assert_eq!(offset % 0x10000, segment.addr % 0x10000);
                found = true;
            }
            offset += segment.size();
        }
        assert!(found, "flash segment missing from built image");
        assert!(parsed.describe().checksum_valid());
    }

    #[test]
    fn ram_segments_follow_flash_segments() {
        let profile = Chip::Esp32c3.profile();
        let code = vec![0x11_u8; 64];
        let data = vec![0x22_u8; 32];
        let segments = vec![
            Segment::new(0x3fc8_0000, &data), // RAM
            Segment::new(0x4200_0020, &code), // flash
        ];

        let image = build_image_from_segments(
            profile,
            0x4200_0020,
            segments,
            &FlashSettings::keep(),
            0,
            None,
        )
        .unwrap();

        let addrs: Vec<u32> = image.segments().iter().map(|s| s.addr).collect();
        let flash_pos = addrs.iter().position(|a| *a == 0x4200_0020).unwrap();
        let ram_pos = addrs.iter().position(|a| *a == 0x3fc8_0000).unwrap();
        assert!(flash_pos < ram_pos);
    }

    #[test]
    fn adjacent_input_segments_are_coalesced() {
        let profile = Chip::Esp32c3.profile();
        let first = vec![0x01_u8; 0x10];
        let second = vec![0x02_u8; 0x10];
        let segments = vec![
            Segment::new(0x3fc8_0000, &first),
            Segment::new(0x3fc8_0010, &second),
        ];

        let image = build_image_from_segments(
            profile,
            0x0,
            segments,
            &FlashSettings::keep(),
            0,
            None,
        )
        .unwrap();

        assert_eq!(image.segments().len(), 1);
        assert_eq!(image.segments()[0].size(), 0x20);
    }
}
