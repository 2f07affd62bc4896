//! Flash engine scenarios against the scripted device

mod common;

use common::{mock, MockChip, MockState, FLASH_LEN};
use esploader::{
    Error, FlashSettings, FlashSize, FlashTask, Flasher, SizeSetting, WriteOptions,
};
use std::{cell::RefCell, rc::Rc};

fn connect(chip: MockChip) -> (Flasher, Rc<RefCell<MockState>>) {
    let (transport, state) = mock(chip);
    let flasher = Flasher::connect(transport, None, false, None).unwrap();
    (flasher, state)
}

fn settings_4mb() -> FlashSettings {
    FlashSettings {
        size: SizeSetting::Set(FlashSize::_4Mb),
        ..FlashSettings::keep()
    }
}

#[test]
fn writes_two_tasks_in_ascending_order_with_sector_erases() {
    let (mut flasher, state) = connect(MockChip::Esp32);

    let first = vec![0xA5_u8; 64];
    let second = vec![0x3C_u8; 128];
    // given out of order on purpose
    let tasks = vec![
        FlashTask::new(0x9000, second.clone()),
        FlashTask::new(0x1000, first.clone()),
    ];

    let report = flasher
        .write_flash(tasks, settings_4mb(), WriteOptions::default(), None)
        .unwrap();

    assert_eq!(report.regions.len(), 2);
    assert!(report.regions.iter().all(|region| region.verified));
    assert_eq!(report.regions[0].address, 0x1000);
    assert_eq!(report.regions[1].address, 0x9000);

    let state = state.borrow();
    assert_eq!(&state.flash[0x1000..0x1040], &first[..]);
    assert_eq!(&state.flash[0x9000..0x9080], &second[..]);

    // one sector-aligned erase range per task, in write order
    assert_eq!(state.erased, vec![(0x1000, 0x1000), (0x9000, 0x1000)]);
    // and the device saw the begin commands in ascending address order
    let begin_offsets: Vec<u32> = state.begins.iter().map(|b| b.offset).collect();
    assert_eq!(begin_offsets, vec![0x1000, 0x9000]);
}

#[test]
fn rejects_tasks_exceeding_flash_before_any_device_write() {
    let (mut flasher, state) = connect(MockChip::Esp32);

    let settings = FlashSettings {
        size: SizeSetting::Set(FlashSize::_1Mb),
        ..FlashSettings::keep()
    };
    let tasks = vec![FlashTask::named(
        0x0F_FF00,
        vec![0u8; 0x200],
        "too-big.bin",
    )];

    let options = WriteOptions {
        // skip the security pre-flight so the only possible rejection is the
        // geometry check
        force: true,
        ..WriteOptions::default()
    };

    match flasher.write_flash(tasks, settings, options, None) {
        Err(Error::WontFit { name, address, length, flash_size }) => {
            assert_eq!(name, "too-big.bin");
            assert_eq!(address, 0x0F_FF00);
            assert_eq!(length, 0x200);
            assert_eq!(flash_size, 0x10_0000);
        }
        other => panic!("expected a won't-fit error, got {other:?}"),
    }

    // nothing was erased or written
    assert_eq!(state.borrow().mutation_commands, 0);
}

#[test]
fn rejects_the_whole_batch_on_a_misaligned_encrypted_task() {
    let (mut flasher, state) = connect(MockChip::Esp32c3);
    // a programmed flash encryption key, so only the alignment can fail
    state.borrow_mut().key_purposes = [4, 0, 0, 0, 0, 0, 0];

    let tasks = vec![
        FlashTask::new(0x2000, vec![0x11; 32]),
        FlashTask::named(0x1001, vec![0x22; 32], "encrypted.bin").encrypted(),
    ];

    match flasher.write_flash(tasks, settings_4mb(), WriteOptions::default(), None) {
        Err(Error::MisalignedEncryptedWrite { name, address, align }) => {
            assert_eq!(name, "encrypted.bin");
            assert_eq!(address, 0x1001);
            assert_eq!(align, 16);
        }
        other => panic!("expected a misalignment error, got {other:?}"),
    }

    // the valid plain task in the same batch was not written either
    assert_eq!(state.borrow().mutation_commands, 0);
}

#[test]
fn rejects_encrypted_writes_without_a_programmed_key() {
    let (mut flasher, state) = connect(MockChip::Esp32c3);

    let tasks = vec![FlashTask::new(0x1000, vec![0x22; 32]).encrypted()];

    match flasher.write_flash(tasks, settings_4mb(), WriteOptions::default(), None) {
        Err(Error::EncryptedWriteUnavailable { .. }) => {}
        other => panic!("expected an encrypted-write error, got {other:?}"),
    }
    assert_eq!(state.borrow().mutation_commands, 0);
}

#[test]
fn resumes_a_task_from_scratch_after_a_disconnect() {
    let (mut flasher, state) = connect(MockChip::Esp32);

    // three ROM-sized blocks, the device drops off during the second
    let data: Vec<u8> = (0..0x900_u32).map(|i| (i % 251) as u8).collect();
    state.borrow_mut().fail_on_data_block = Some(2);

    let report = flasher
        .write_flash(
            vec![FlashTask::new(0x1000, data.clone())],
            settings_4mb(),
            WriteOptions::default(),
            None,
        )
        .unwrap();

    assert_eq!(report.regions[0].attempts, 2);
    assert!(report.regions[0].verified);

    let state = state.borrow();
    // the final content is the complete original task, not a truncated mix
    assert_eq!(&state.flash[0x1000..0x1000 + data.len()], &data[..]);
    // the transport was reopened exactly once
    assert_eq!(state.open_count, 2);
}

#[test]
fn never_retries_an_encrypted_task() {
    let (mut flasher, state) = connect(MockChip::Esp32c3);
    {
        let mut state = state.borrow_mut();
        state.key_purposes = [4, 0, 0, 0, 0, 0, 0];
        state.fail_on_data_block = Some(1);
    }

    let result = flasher.write_flash(
        vec![FlashTask::new(0x1000, vec![0x77; 64]).encrypted()],
        settings_4mb(),
        WriteOptions::default(),
        None,
    );

    assert!(result.is_err(), "disconnect must propagate immediately");
    // no reconnect was attempted
    assert_eq!(state.borrow().open_count, 1);
}

#[test]
fn compressed_writes_inflate_to_the_original_content() {
    let (mut flasher, state) = connect(MockChip::Esp32);

    let data: Vec<u8> = (0..0x1200_u32).map(|i| (i / 7 % 256) as u8).collect();
    let options = WriteOptions {
        compress: Some(true),
        ..WriteOptions::default()
    };

    let report = flasher
        .write_flash(
            vec![FlashTask::new(0x8000, data.clone())],
            settings_4mb(),
            options,
            None,
        )
        .unwrap();

    assert!(report.regions[0].verified);
    let compressed = report.regions[0].compressed_size.unwrap();
    assert!(compressed > 0 && (compressed as usize) < data.len());

    let state = state.borrow();
    assert_eq!(&state.flash[0x8000..0x8000 + data.len()], &data[..]);
    // the transfer went through the deflate variant of the begin command
    assert_eq!(state.begins[0].op, 0x10);
}

#[test]
fn reports_a_still_erased_region_distinctly() {
    let (mut flasher, state) = connect(MockChip::Esp32);
    state.borrow_mut().drop_writes = true;

    match flasher.write_flash(
        vec![FlashTask::new(0x1000, vec![0x55; 64])],
        settings_4mb(),
        WriteOptions::default(),
        None,
    ) {
        Err(Error::WriteFailedRegionEmpty { address }) => assert_eq!(address, 0x1000),
        other => panic!("expected a region-still-empty error, got {other:?}"),
    }
}

#[test]
fn reports_a_garbled_write_as_a_digest_mismatch() {
    let (mut flasher, state) = connect(MockChip::Esp32);
    state.borrow_mut().corrupt_writes = true;

    match flasher.write_flash(
        vec![FlashTask::new(0x1000, vec![0x55; 64])],
        settings_4mb(),
        WriteOptions::default(),
        None,
    ) {
        Err(Error::DigestMismatch { expected, actual }) => {
            assert_ne!(expected, actual);
        }
        other => panic!("expected a digest mismatch, got {other:?}"),
    }
}

#[test]
fn erase_all_wipes_the_chip_before_writing() {
    let (mut flasher, state) = connect(MockChip::Esp32c3);

    let options = WriteOptions {
        erase_all: true,
        ..WriteOptions::default()
    };
    flasher
        .write_flash(
            vec![FlashTask::new(0x1000, vec![0x42; 16])],
            settings_4mb(),
            options,
            None,
        )
        .unwrap();

    assert_eq!(state.borrow().erase_all_count, 1);
}

#[test]
fn erase_region_requires_sector_alignment() {
    let (mut flasher, _state) = connect(MockChip::Esp32c3);

    match flasher.erase_region(0x1010, 0x1000, false) {
        Err(Error::UnalignedEraseRegion(sector)) => assert_eq!(sector, 0x1000),
        other => panic!("expected an alignment error, got {other:?}"),
    }
}

#[test]
fn erase_region_reaches_the_device() {
    let (mut flasher, state) = connect(MockChip::Esp32c3);

    flasher.erase_region(0x2000, 0x2000, false).unwrap();

    let state = state.borrow();
    assert!(state.erased.contains(&(0x2000, 0x2000)));
}

#[test]
fn rom_loader_erases_regions_through_the_begin_command() {
    let (mut flasher, state) = connect(MockChip::Esp32);

    flasher.erase_region(0x3000, 0x1000, false).unwrap();

    let state = state.borrow();
    // no native erase on this ROM: the begin command carried the erase
    assert_eq!(state.begins.len(), 1);
    assert_eq!(state.begins[0].offset, 0x3000);
    assert_eq!(state.begins[0].size, 0x1000);
    assert!(state.erased.contains(&(0x3000, 0x1000)));
}

#[test]
fn whole_chip_erase_needs_the_stub_on_older_roms() {
    let (mut flasher, _state) = connect(MockChip::Esp32);

    match flasher.erase_flash(false) {
        Err(Error::StubRequired) => {}
        other => panic!("expected a stub-required error, got {other:?}"),
    }
}

#[test]
fn verify_flash_passes_after_a_write_and_diffs_after_corruption() {
    let (mut flasher, state) = connect(MockChip::Esp32);

    let data = vec![0x5A_u8; 64];
    let task = FlashTask::new(0x1000, data.clone());
    flasher
        .write_flash(
            vec![task.clone()],
            settings_4mb(),
            WriteOptions::default(),
            None,
        )
        .unwrap();

    let mismatches = flasher
        .verify_flash(&[task.clone()], settings_4mb(), false)
        .unwrap();
    assert!(mismatches.is_empty());

    // flip two bytes behind the flasher's back
    {
        let mut state = state.borrow_mut();
        state.flash[0x1003] ^= 0xFF;
        state.flash[0x1010] ^= 0xFF;
    }

    let mismatches = flasher.verify_flash(&[task], settings_4mb(), true).unwrap();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].address, 0x1000);
    assert_eq!(mismatches[0].differences, vec![0x3, 0x10]);
}

#[test]
fn read_flash_returns_written_content_through_the_rom() {
    let (mut flasher, _state) = connect(MockChip::Esp32);

    let data: Vec<u8> = (0..200_u32).map(|i| i as u8).collect();
    flasher
        .write_flash(
            vec![FlashTask::new(0x1000, data.clone())],
            settings_4mb(),
            WriteOptions::default(),
            None,
        )
        .unwrap();

    let read = flasher.read_flash(0x1000, data.len() as u32).unwrap();
    assert_eq!(read, data);
}

#[test]
fn stub_session_uses_compression_and_larger_blocks() {
    let (transport, state) = mock(MockChip::Esp32);
    let mut flasher = Flasher::connect(transport, None, true, None).unwrap();
    assert!(flasher.is_stub());

    let data: Vec<u8> = (0..0x5000_u32).map(|i| (i % 199) as u8).collect();
    let report = flasher
        .write_flash(
            vec![FlashTask::new(0x1_0000, data.clone())],
            settings_4mb(),
            WriteOptions::default(),
            None,
        )
        .unwrap();

    assert!(report.regions[0].verified);
    assert!(report.regions[0].compressed_size.is_some());

    let state = state.borrow();
    assert_eq!(&state.flash[0x1_0000..0x1_0000 + data.len()], &data[..]);
    // stub transfers run with the larger block size
    assert_eq!(state.begins[0].block_size, 0x4000);
}

#[test]
fn secure_boot_blocks_writes_to_the_bootloader_region() {
    let (mut flasher, state) = connect(MockChip::Esp32c3);
    state.borrow_mut().security_flags = 1; // SECURE_BOOT_EN

    match flasher.write_flash(
        vec![FlashTask::new(0x4000, vec![0u8; 16])],
        settings_4mb(),
        WriteOptions::default(),
        None,
    ) {
        Err(Error::SecureBootProtectedRegion) => {}
        other => panic!("expected a secure boot rejection, got {other:?}"),
    }
    assert_eq!(state.borrow().mutation_commands, 0);
}

#[test]
fn oversized_flash_setting_is_clamped_to_the_real_chip() {
    let (mut flasher, _state) = connect(MockChip::Esp32c3);

    // the mock chip reports 4MB, ask for 16MB and try to write past 4MB
    let settings = FlashSettings {
        size: SizeSetting::Set(FlashSize::_16Mb),
        ..FlashSettings::keep()
    };
    let result = flasher.write_flash(
        vec![FlashTask::new(FLASH_LEN as u32, vec![0u8; 16])],
        settings,
        WriteOptions::default(),
        None,
    );

    assert!(matches!(result, Err(Error::WontFit { .. })));
}
