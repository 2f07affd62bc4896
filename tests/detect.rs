//! Chip detection against the scripted device

mod common;

use common::{mock, MockChip};
use esploader::{Chip, Error, Flasher};

#[test]
fn detects_newer_chips_by_chip_id() {
    let (transport, state) = mock(MockChip::Esp32c3);
    let flasher = Flasher::connect(transport, None, false, None).unwrap();

    assert_eq!(flasher.chip(), Chip::Esp32c3);
    assert!(!flasher.secure_download_mode());
    assert!(!flasher.is_stub());
    assert_eq!(state.borrow().mutation_commands, 0);
}

#[test]
fn falls_back_to_magic_word_for_older_chips() {
    let (transport, _state) = mock(MockChip::Esp32);
    let flasher = Flasher::connect(transport, None, false, None).unwrap();

    assert_eq!(flasher.chip(), Chip::Esp32);
    assert!(!flasher.secure_download_mode());
}

#[test]
fn reports_secure_download_mode_on_newer_chips() {
    let (transport, state) = mock(MockChip::Esp32c3);
    state.borrow_mut().secure_download_mode = true;

    // the chip ID still comes through, only register reads are walled off
    let flasher = Flasher::connect(transport, None, false, None).unwrap();

    assert_eq!(flasher.chip(), Chip::Esp32c3);
    assert!(flasher.secure_download_mode());
}

#[test]
fn fails_fast_when_both_detection_paths_are_walled_off() {
    let (transport, state) = mock(MockChip::Esp32);
    state.borrow_mut().secure_download_mode = true;

    match Flasher::connect(transport, None, false, None) {
        Err(Error::SecureDownloadModeDetection) => {}
        other => panic!("expected a secure download mode error, got {other:?}"),
    }
}

#[test]
fn rejects_a_mismatched_chip_argument() {
    let (transport, _state) = mock(MockChip::Esp32c3);

    match Flasher::connect(transport, None, false, Some(Chip::Esp32s3)) {
        Err(Error::ChipMismatch(expected, detected)) => {
            assert_eq!(expected, "esp32s3");
            assert_eq!(detected, "esp32c3");
        }
        other => panic!("expected a chip mismatch error, got {other:?}"),
    }
}

#[test]
fn detects_flash_size_from_the_flash_id() {
    let (transport, _state) = mock(MockChip::Esp32c3);
    let mut flasher = Flasher::connect(transport, None, false, None).unwrap();

    let info = flasher.device_info().unwrap();
    assert_eq!(info.chip, Chip::Esp32c3);
    assert_eq!(info.flash_size, Some(esploader::FlashSize::_4Mb));
    assert!(!info.stub);
}

#[test]
fn bootstraps_the_stub_loader() {
    let (transport, _state) = mock(MockChip::Esp32);
    let flasher = Flasher::connect(transport, None, true, None).unwrap();

    assert!(flasher.is_stub());
}
