//! Firmware image format
//!
//! The on-flash application format shared by every supported family: an
//! 8-byte common header, a 16-byte extended header, a table of load
//! segments, a 1-byte XOR checksum and an optional trailing SHA-256 digest.
//! This module owns the in-memory model ([FirmwareImage]), the offline
//! builder and inspector, and the flash-parameter patch logic used by both
//! the live programmer and the offline merger. The serialized bytes must be
//! bit-exact between all of these paths, the device ROM validates them.

use std::{
    borrow::Cow,
    cmp::Ordering,
    fmt::{Debug, Formatter},
    ops::AddAssign,
};

use bytemuck::{Pod, Zeroable};

pub use self::{
    firmware::{
        describe_image, update_flash_params, FirmwareImage, ImageInfo, RevisionRequirement,
        SegmentInfo,
    },
    merge::{merge_images, ContainerSerializer, RawSerializer},
};
pub(crate) use self::firmware::{encode_flash_size, hex};

mod firmware;
mod merge;

pub(crate) const ESP_MAGIC: u8 = 0xE9;
pub(crate) const WP_PIN_DISABLED: u8 = 0xEE;
pub(crate) const CHECKSUM_INIT: u8 = 0xEF;

/// Update the running XOR checksum with the given data
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

/// Common + extended firmware image header
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct ImageHeader {
    pub magic: u8,
    pub segment_count: u8,
    /// Flash read mode
    pub flash_mode: u8,
    /// Low nibble is the flash frequency, high nibble the flash size
    pub flash_config: u8,
    pub entry: u32,

    // extended header part
    pub wp_pin: u8,
    pub clk_q_drv: u8,
    pub d_cs_drv: u8,
    pub gd_wp_drv: u8,
    pub chip_id: u16,
    /// Minimum supported chip revision, legacy single-byte encoding
    pub min_rev: u8,
    /// Minimum chip revision supported by image, in format: major * 100 + minor
    pub min_chip_rev_full: u16,
    /// Maximal chip revision supported by image, in format: major * 100 + minor
    pub max_chip_rev_full: u16,
    /// MMU page size in log base 2 format, 0 meaning the family default
    pub mmu_page_size: u8,
    pub reserved: [u8; 3],
    pub append_digest: u8,
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self {
            magic: ESP_MAGIC,
            segment_count: 0,
            flash_mode: 0,
            flash_config: 0,
            entry: 0,
            wp_pin: WP_PIN_DISABLED,
            clk_q_drv: 0,
            d_cs_drv: 0,
            gd_wp_drv: 0,
            chip_id: 0,
            min_rev: 0,
            min_chip_rev_full: 0,
            max_chip_rev_full: u16::MAX,
            mmu_page_size: 0,
            reserved: [0; 3],
            append_digest: 1,
        }
    }
}

/// Header preceding every segment in the segment table
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct SegmentHeader {
    pub addr: u32,
    pub length: u32,
}

/// A contiguous byte range destined for a load address
#[derive(Default, Clone, Eq)]
pub struct Segment<'a> {
    /// Target address of the segment
    pub addr: u32,
    /// Segment data
    pub data: Cow<'a, [u8]>,
}

impl<'a> Segment<'a> {
    pub fn new(addr: u32, data: &'a [u8]) -> Self {
        Segment {
            addr,
            data: Cow::Borrowed(data),
        }
    }

    /// Number of bytes in the segment
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// The segment data
    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Pad the segment to the given alignment
    pub fn pad_align(&mut self, align: usize) {
        let padding = (align - self.data.len() % align) % align;
        if padding > 0 {
            let mut data = self.data.to_vec();
            data.extend_from_slice(&[0; 8][0..padding]);
            self.data = Cow::Owned(data);
        }
    }

    /// Borrow the segment for a shorter lifetime
    pub fn borrow(&self) -> Segment<'_> {
        Segment {
            addr: self.addr,
            data: Cow::Borrowed(self.data.as_ref()),
        }
    }

    /// Convert into a segment owning its data
    pub fn into_owned(self) -> Segment<'static> {
        Segment {
            addr: self.addr,
            data: Cow::Owned(self.data.into_owned()),
        }
    }
}

impl AddAssign<&'_ [u8]> for Segment<'_> {
    fn add_assign(&mut self, rhs: &'_ [u8]) {
        let mut data = std::mem::take(&mut self.data).into_owned();
        data.extend_from_slice(rhs);
        self.data = Cow::Owned(data);
    }
}

impl AddAssign<&'_ Segment<'_>> for Segment<'_> {
    fn add_assign(&mut self, rhs: &'_ Segment<'_>) {
        // Pad the gap between the segments, the sum must stay contiguous
        let mut data = std::mem::take(&mut self.data).into_owned();
        for _ in 0..((rhs.addr - self.addr) as usize).saturating_sub(data.len()) {
            data.push(0);
        }
        data.extend_from_slice(rhs.data.as_ref());
        self.data = Cow::Owned(data);
    }
}

impl PartialEq for Segment<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.data == other.data
    }
}

impl PartialOrd for Segment<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Segment<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr.cmp(&other.addr)
    }
}

impl Debug for Segment<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("addr", &self.addr)
            .field("size", &self.size())
            .finish()
    }
}

/// Merge adjacent segments into one.
///
/// Segments whose address ranges touch, or whose gap disappears under 4-byte
/// alignment, are coalesced; order is otherwise preserved.
pub fn merge_adjacent_segments(mut segments: Vec<Segment<'_>>) -> Vec<Segment<'_>> {
    segments.sort();

    let mut merged: Vec<Segment<'_>> = Vec::with_capacity(segments.len());
    for segment in segments {
        if let Some(last) = merged.last_mut() {
            let last_end = last.addr + last.size();
            if last_end == segment.addr {
                *last += segment.data();
                continue;
            }

            // There is some space between the segments. They can still be
            // merged if they would be contiguous once the first segment is
            // 4-byte aligned.
            let max_padding = (4 - last_end % 4) % 4;
            if last_end + max_padding >= segment.addr {
                *last += &[0u8; 4][..(segment.addr - last_end) as usize];
                *last += segment.data();
                continue;
            }
        }

        merged.push(segment)
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_xor_with_seed() {
        assert_eq!(checksum(&[], CHECKSUM_INIT), 0xEF);
        assert_eq!(checksum(&[0xEF], CHECKSUM_INIT), 0x00);
        assert_eq!(
            checksum(&[0x01, 0x02, 0x04], CHECKSUM_INIT),
            0xEF ^ 0x01 ^ 0x02 ^ 0x04
        );
    }

    #[test]
    fn merge_adjacent_segments_joins_contiguous_ranges() {
        let segments = vec![
            Segment::new(0x1000, &[0u8; 0x100]),
            Segment::new(0x1100, &[0u8; 0xFF]),
            Segment::new(0x1200, &[0u8; 0x100]),
        ];

        let merged = merge_adjacent_segments(segments);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].addr, 0x1000);
        assert_eq!(merged[0].size(), 0x300);
    }

    #[test]
    fn merge_adjacent_segments_keeps_disjoint_ranges() {
        let segments = vec![
            Segment::new(0x1000, &[0u8; 0x100]),
            Segment::new(0x2000, &[0u8; 0x100]),
        ];

        let merged = merge_adjacent_segments(segments);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn segment_padding_rounds_up() {
        let mut segment = Segment::new(0x0, &[1, 2, 3]);
        segment.pad_align(4);
        assert_eq!(segment.data(), &[1, 2, 3, 0]);

        let mut aligned = Segment::new(0x0, &[1, 2, 3, 4]);
        aligned.pad_align(4);
        assert_eq!(aligned.size(), 4);
    }
}
