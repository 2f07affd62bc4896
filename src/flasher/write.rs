//! The flash write engine
//!
//! A write request is a list of [FlashTask]s. Before any device I/O the batch
//! runs through the security, encryption and geometry pre-flights; each task
//! is then streamed in blocks with retry-on-disconnect, and verified against
//! the device's own digest of the written region afterwards.

use std::{
    io::Write as _,
    time::{Duration, Instant},
};

use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
use log::{debug, warn};
use md5::{Digest, Md5};

use super::{
    FlashSettings, FlashSize, Flasher, SizeSetting, DEFAULT_TIMEOUT,
};
use crate::{
    connection::command::{Command, CommandType},
    error::Error,
    image_format::{hex, update_flash_params, FirmwareImage, RevisionRequirement},
    progress::ProgressCallbacks,
    target::CHIP_DETECT_MAGIC_REG_ADDR,
};

/// Attempts per task before a disconnect is considered fatal
const WRITE_FLASH_ATTEMPTS: u32 = 3;

/// A scheduling unit of a write request: one blob at one address
#[derive(Debug, Clone)]
pub struct FlashTask {
    /// Flash address the blob is written to
    pub address: u32,
    /// The bytes to write
    pub data: Vec<u8>,
    /// Name used in progress and error reporting
    pub name: String,
    /// Encrypt this blob on its way into flash
    pub encrypt: bool,
}

impl FlashTask {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        FlashTask {
            name: format!("{address:#010x}"),
            address,
            data,
            encrypt: false,
        }
    }

    pub fn named(address: u32, data: Vec<u8>, name: impl Into<String>) -> Self {
        FlashTask {
            name: name.into(),
            address,
            data,
            encrypt: false,
        }
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }
}

/// Options controlling a write request
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Erase the entire flash before writing
    pub erase_all: bool,
    /// Compress data before flashing; defaults to on when the stub loader is
    /// running
    pub compress: Option<bool>,
    /// Encrypt every task, not just the ones marked individually
    pub encrypt_all: bool,
    /// Skip the security and validation pre-flights
    pub force: bool,
    /// Proceed even when the encryption-related eFuses look wrong
    pub ignore_encryption_efuse: bool,
    /// Skip the post-write verification
    pub no_verify: bool,
}

/// Per-task progress, alive for the duration of one task's transfer
struct WriteSession {
    /// Sequence number of the next block
    sequence: u32,
    /// Bytes transmitted on the wire
    bytes_sent: usize,
    /// Bytes physically written to flash, differs from `bytes_sent` under
    /// compression
    bytes_written: usize,
    started: Instant,
    /// Current adaptive per-block timeout
    timeout: Duration,
    attempt: u32,
}

impl WriteSession {
    fn new() -> Self {
        WriteSession {
            sequence: 0,
            bytes_sent: 0,
            bytes_written: 0,
            started: Instant::now(),
            timeout: DEFAULT_TIMEOUT,
            attempt: 1,
        }
    }

    /// Rewind for a fresh attempt at the same task.
    fn rewind(&mut self) {
        self.sequence = 0;
        self.bytes_sent = 0;
        self.bytes_written = 0;
        self.started = Instant::now();
        self.timeout = DEFAULT_TIMEOUT;
    }
}

/// Result of writing one task
#[derive(Debug, Clone)]
pub struct WrittenRegion {
    pub address: u32,
    /// Uncompressed byte count written to flash
    pub size: u32,
    /// Bytes sent on the wire when the transfer was compressed
    pub compressed_size: Option<u32>,
    /// Attempts needed, more than one means reconnects happened
    pub attempts: u32,
    pub elapsed: Duration,
    /// Whether the device-side digest was checked against the data
    pub verified: bool,
}

/// Result of a whole write request
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub regions: Vec<WrittenRegion>,
    /// Flash size the request was validated against, when known
    pub flash_size: Option<FlashSize>,
}

/// A region that failed verification
#[derive(Debug, Clone)]
pub struct VerifyMismatch {
    pub address: u32,
    /// Offsets of differing bytes; only filled in diff mode
    pub differences: Vec<u32>,
}

impl Flasher {
    /// Write a batch of tasks to flash.
    ///
    /// Tasks are sorted and processed in ascending address order. The whole
    /// batch is validated before the first byte of device I/O that mutates
    /// flash; a task failing validation rejects the entire request.
    pub fn write_flash(
        &mut self,
        tasks: Vec<FlashTask>,
        settings: FlashSettings,
        options: WriteOptions,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<WriteReport, Error> {
        let mut tasks = tasks;
        tasks.sort_by_key(|task| task.address);
        tasks.retain(|task| {
            if task.data.is_empty() {
                warn!("'{}' is empty, skipping it", task.name);
            }
            !task.data.is_empty()
        });

        for pair in tasks.windows(2) {
            if pair[0].address + pair[0].data.len() as u32 > pair[1].address {
                return Err(Error::OverlappingBlobs(pair[1].address, pair[0].address));
            }
        }

        self.security_preflight(&tasks, &options)?;
        self.encryption_preflight(&tasks, &options)?;

        let flash_size = self.resolve_flash_size(settings.size)?;

        // Geometry: every task must fit the resolved flash size, checked
        // before anything is erased or written
        if let Some(flash_end) = flash_size.map(|size| size.size()) {
            for task in &tasks {
                if task.address as u64 + task.data.len() as u64 > flash_end as u64 {
                    return Err(Error::WontFit {
                        name: task.name.clone(),
                        address: task.address,
                        length: task.data.len(),
                        flash_size: flash_end,
                    });
                }
            }
        }

        // Header patching is unsafe under secure boot and pointless in
        // secure download mode, decided once for the whole batch
        let patch_allowed = if self.secure_download_mode() {
            false
        } else {
            !self.secure_boot_enabled()?
        };
        let patch_settings = FlashSettings {
            size: match settings.size {
                SizeSetting::Detect => flash_size.map(SizeSetting::Set).unwrap_or(SizeSetting::Keep),
                other => other,
            },
            ..settings
        };

        self.enable_flash()?;

        if options.erase_all {
            self.erase_flash(options.force)?;
        } else {
            for task in &tasks {
                let sector_size = self.profile().flash_sector_size;
                let start = task.address - task.address % sector_size;
                let end = (task.address + task.data.len() as u32).div_ceil(sector_size) * sector_size;
                debug!("Flash will be erased from {start:#010x} to {:#010x}", end - 1);
            }
        }

        let compress_default = options.compress.unwrap_or(self.is_stub());

        let mut regions = Vec::with_capacity(tasks.len());
        let mut last_compressed = false;
        for task in &tasks {
            let encrypted = options.encrypt_all || task.encrypt;

            let mut compress = compress_default;
            if compress && encrypted {
                warn!(
                    "Compress and encrypt options are mutually exclusive, writing '{}' uncompressed",
                    task.name
                );
                compress = false;
            }

            let region = self.transfer_task(
                task,
                encrypted,
                compress,
                patch_allowed,
                &patch_settings,
                &options,
                &mut progress,
            )?;
            last_compressed = compress;
            regions.push(region);
        }

        if self.is_stub() && !regions.is_empty() {
            // Leave the stub running: a zero-length begin makes the finish
            // command a no-op instead of a handoff to user code
            self.flash_begin_plain(0, 0, 0)?;
            let finish = if last_compressed {
                Command::FlashDeflEnd { reboot: false }
            } else {
                Command::FlashEnd { reboot: false }
            };
            self.connection()
                .with_timeout(finish.command_type().timeout(), |connection| {
                    connection.command(finish)
                })?;
        }

        Ok(WriteReport {
            regions,
            flash_size,
        })
    }

    /// Verify flash contents against the given tasks.
    ///
    /// Starts with the device-side digest of each region; when `diff` is set
    /// and the cheap comparison failed, the region is re-read and every
    /// differing offset reported.
    pub fn verify_flash(
        &mut self,
        tasks: &[FlashTask],
        settings: FlashSettings,
        diff: bool,
    ) -> Result<Vec<VerifyMismatch>, Error> {
        let flash_size = self.resolve_flash_size(settings.size)?;
        if let Some(flash_end) = flash_size.map(|size| size.size()) {
            for task in tasks {
                if task.address as u64 + task.data.len() as u64 > flash_end as u64 {
                    return Err(Error::WontFit {
                        name: task.name.clone(),
                        address: task.address,
                        length: task.data.len(),
                        flash_size: flash_end,
                    });
                }
            }
        }

        let patch_settings = FlashSettings {
            size: match settings.size {
                SizeSetting::Detect => flash_size.map(SizeSetting::Set).unwrap_or(SizeSetting::Keep),
                other => other,
            },
            ..settings
        };

        self.enable_flash()?;

        let mut mismatches = Vec::new();
        for task in tasks {
            let image = pad_to(task.data.clone(), 4, 0xFF);
            let image = update_flash_params(
                self.profile(),
                task.address,
                &patch_settings,
                &image,
            )?;

            debug!(
                "Verifying {:#x} bytes at {:#010x} against '{}'",
                image.len(),
                task.address,
                task.name
            );

            let device_md5 = self.flash_md5(task.address, image.len() as u32)?;
            let expected_md5 = Md5::digest(&image);

            if device_md5.to_be_bytes().as_slice() == expected_md5.as_slice() {
                debug!("-- verify OK (digest matched)");
                continue;
            }

            if !diff {
                debug!("-- verify FAILED (digest mismatch)");
                mismatches.push(VerifyMismatch {
                    address: task.address,
                    differences: Vec::new(),
                });
                continue;
            }

            let flash = self.read_flash(task.address, image.len() as u32)?;
            let differences: Vec<u32> = (0..image.len())
                .filter(|i| flash[*i] != image[*i])
                .map(|i| i as u32)
                .collect();
            debug!(
                "-- verify FAILED: {} differences, first at {:#010x}",
                differences.len(),
                task.address + differences.first().copied().unwrap_or(0)
            );
            mismatches.push(VerifyMismatch {
                address: task.address,
                differences,
            });
        }

        Ok(mismatches)
    }

    /// Secure-boot and image compatibility checks, before any flash mutation.
    fn security_preflight(
        &mut self,
        tasks: &[FlashTask],
        options: &WriteOptions,
    ) -> Result<(), Error> {
        if options.force || self.secure_download_mode() {
            return Ok(());
        }

        if self.secure_boot_enabled()? {
            for task in tasks {
                if task.address < 0x8000 {
                    return Err(Error::SecureBootProtectedRegion);
                }
            }
        }

        for task in tasks {
            // Only blobs that parse as firmware images declare compatibility
            // requirements
            let Ok(image) = FirmwareImage::parse(&task.data) else {
                continue;
            };

            if image.header.chip_id != self.profile().image_chip_id {
                return Err(Error::ImageChipMismatch {
                    name: task.name.clone(),
                });
            }

            match image.revision_requirement() {
                RevisionRequirement::None => {}
                RevisionRequirement::Full { min, max } => {
                    let (major, minor) = self.chip_revision()?;
                    let revision = major * 100 + minor;
                    if revision < min as u32 || revision > max as u32 {
                        return Err(Error::UnsupportedChipRevision {
                            name: task.name.clone(),
                            min: format_revision(min as u32),
                            max: if max == u16::MAX {
                                "max rev not set".into()
                            } else {
                                format_revision(max as u32)
                            },
                            found: format_revision(revision),
                        });
                    }
                }
                RevisionRequirement::Legacy(min_rev) => {
                    // The legacy field predates the major.minor split; one
                    // family tracks the minor revision in it, all others the
                    // major. The profile carries that exception.
                    let (major, minor) = self.chip_revision()?;
                    let revision = if self.profile().legacy_rev_is_minor {
                        minor
                    } else {
                        major
                    };
                    if revision < min_rev as u32 {
                        return Err(Error::UnsupportedChipRevision {
                            name: task.name.clone(),
                            min: min_rev.to_string(),
                            max: "any".into(),
                            found: revision.to_string(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Encryption sanity checks; a single failure rejects the whole batch.
    fn encryption_preflight(
        &mut self,
        tasks: &[FlashTask],
        options: &WriteOptions,
    ) -> Result<(), Error> {
        let encrypting = options.encrypt_all || tasks.iter().any(|task| task.encrypt);

        if !encrypting {
            if options.force {
                return Ok(());
            }
            // Writing plaintext onto encrypted flash bricks the device, warn
            // through an error unless forced
            if self.secure_download_mode() {
                if self.profile().supports_security_info
                    && self.security_info()?.flash_encryption_enabled()
                {
                    return Err(Error::EncryptedWriteUnavailable {
                        reason: "flash encryption and secure download mode are both enabled, \
                                 flashing a plaintext binary may brick the device"
                            .into(),
                    });
                }
            } else if self.encrypted_download_disabled()? && self.flash_encryption_enabled()? {
                return Err(Error::EncryptedWriteUnavailable {
                    reason: "flash encryption is enabled and manually encrypted downloads are \
                             fused off, flashing a plaintext binary may brick the device"
                        .into(),
                });
            }
            return Ok(());
        }

        let mut key_problem = None;
        let mut alignment_problem = None;

        if !self.secure_download_mode() {
            if self.encrypted_download_disabled()? {
                return Err(Error::EncryptedWriteUnavailable {
                    reason: "encrypted downloads are permanently disabled on this chip".into(),
                });
            }

            if !self.flash_encryption_key_valid()? {
                warn!("Flash encryption key is not programmed");
                key_problem = Some("the flash encryption key is not programmed".to_string());
            }
        }

        let align = self.profile().encrypted_write_align;
        for task in tasks {
            if (options.encrypt_all || task.encrypt) && task.address % align != 0 {
                warn!(
                    "'{}' address {:#x} is not {} byte aligned, can't flash encrypted",
                    task.name, task.address, align
                );
                alignment_problem.get_or_insert(Error::MisalignedEncryptedWrite {
                    name: task.name.clone(),
                    address: task.address,
                    align,
                });
            }
        }

        if !options.ignore_encryption_efuse {
            if let Some(error) = alignment_problem {
                return Err(error);
            }
            if let Some(reason) = key_problem {
                return Err(Error::EncryptedWriteUnavailable { reason });
            }
        }

        Ok(())
    }

    /// Resolve the flash size the request runs against.
    fn resolve_flash_size(&mut self, setting: SizeSetting) -> Result<Option<FlashSize>, Error> {
        match setting {
            SizeSetting::Set(size) => {
                self.enable_flash()?;
                self.set_spi_params(size)?;

                // Warn when the requested size exceeds the physical chip and
                // validate against the smaller of the two
                if !self.secure_download_mode() {
                    if let Ok(Some(real)) = self.spi_autodetect() {
                        if size.size() > real.size() {
                            warn!(
                                "Set flash size {size} is larger than the available flash size of {real}"
                            );
                            return Ok(Some(real));
                        }
                    }
                }
                Ok(Some(size))
            }
            SizeSetting::Detect => match self.spi_autodetect()? {
                Some(size) => Ok(Some(size)),
                None => {
                    warn!("Could not auto-detect flash size, defaulting to 4MB");
                    let size = FlashSize::default();
                    self.set_spi_params(size)?;
                    Ok(Some(size))
                }
            },
            SizeSetting::Keep => {
                // Detection is unavailable in secure download mode; elsewhere
                // configure the chip with its real size when it answers, but
                // leave image headers alone
                if self.secure_download_mode() {
                    Ok(None)
                } else {
                    Ok(self.spi_autodetect().ok().flatten())
                }
            }
        }
    }

    /// Transfer a single task, retrying on transport disconnects.
    #[allow(clippy::too_many_arguments)]
    fn transfer_task(
        &mut self,
        task: &FlashTask,
        encrypted: bool,
        compress: bool,
        patch_allowed: bool,
        patch_settings: &FlashSettings,
        options: &WriteOptions,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<WrittenRegion, Error> {
        let mut address = task.address;

        let align = if encrypted {
            self.profile().encrypted_write_align as usize
        } else {
            4
        };
        let mut image = pad_to(task.data.clone(), align, 0xFF);

        if !self.is_stub() {
            // The ROM loader erases on write and cannot start mid-sector, so
            // the image grows erased filler down to the sector boundary
            let bytes_over = address % self.profile().flash_sector_size;
            if bytes_over != 0 {
                debug!(
                    "Flash address {address:#010x} is not sector aligned, \
                     {bytes_over:#x} bytes before it will be erased"
                );
                address -= bytes_over;
                let mut padded = vec![0xFF; bytes_over as usize];
                padded.extend_from_slice(&image);
                image = padded;
            }
        }

        let image = if patch_allowed {
            update_flash_params(self.profile(), address, patch_settings, &image)?.into_owned()
        } else {
            warn!("Security features enabled, so not changing any flash settings");
            image
        };

        let calc_md5 = Md5::digest(&image);
        let uncsize = image.len() as u32;

        let compressed = if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(&image)?;
            Some(encoder.finish()?)
        } else {
            None
        };

        let mut session = WriteSession::new();
        for attempt in 1..=WRITE_FLASH_ATTEMPTS {
            session.attempt = attempt;

            let result = self.stream_task(
                address,
                &image,
                compressed.as_deref(),
                encrypted,
                progress,
                &mut session,
            );

            match result {
                Ok(()) => break,
                Err(e) if e.is_transient() && !encrypted && attempt < WRITE_FLASH_ATTEMPTS => {
                    // The task restarts from its original, unmodified image;
                    // nothing of the partial progress is trusted
                    warn!("Lost connection, retrying '{}'...", task.name);
                    let was_stub = self.is_stub();
                    self.connection().reconnect()?;
                    if was_stub {
                        self.set_rom_session();
                        self.load_stub()?;
                    }
                    self.enable_flash()?;
                    session.rewind();
                }
                Err(e) => return Err(e),
            }
        }

        if self.is_stub() {
            // The stub acknowledges a block before its flash write finished;
            // an extra no-op read blocks until the last write truly landed
            let timeout = session.timeout;
            self.connection().with_timeout(timeout, |connection| {
                connection.command(Command::ReadReg {
                    address: CHIP_DETECT_MAGIC_REG_ADDR,
                })
            })?;
        }

        debug!(
            "Wrote {} bytes ({} on the wire) at {:#010x} in {:.1}s",
            session.bytes_written,
            session.bytes_sent,
            address,
            session.started.elapsed().as_secs_f32()
        );

        let verified = self.verify_written(
            address,
            uncsize,
            calc_md5.as_slice(),
            encrypted,
            options.no_verify,
        )?;

        Ok(WrittenRegion {
            address,
            size: uncsize,
            compressed_size: compressed.map(|compressed| compressed.len() as u32),
            attempts: session.attempt,
            elapsed: session.started.elapsed(),
            verified,
        })
    }

    /// One begin/stream pass over a task's image.
    fn stream_task(
        &mut self,
        address: u32,
        image: &[u8],
        compressed: Option<&[u8]>,
        encrypted: bool,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
        session: &mut WriteSession,
    ) -> Result<(), Error> {
        let block_size = self.flash_write_size();
        let sector_size = self.profile().flash_sector_size;
        let erase_size = (image.len() as u32).div_ceil(sector_size) * sector_size;

        // The begin-command payload only carries the encrypted word on ROM
        // loaders that understand it
        let takes_encrypted_word = !self.profile().encrypted_data_command && !self.is_stub();

        if let Some(compressed) = compressed {
            let blocks = compressed.len().div_ceil(block_size) as u32;
            // The ROM wants the write size rounded up to whole blocks, the
            // stub the exact byte count
            let write_size = if self.is_stub() {
                image.len() as u32
            } else {
                (image.len().div_ceil(block_size) * block_size) as u32
            };

            self.connection().with_timeout(
                CommandType::FlashDeflBegin.timeout_for_size(erase_size),
                |connection| {
                    connection.command(Command::FlashDeflBegin {
                        size: write_size,
                        blocks,
                        block_size: block_size as u32,
                        offset: address,
                        supports_encryption: takes_encrypted_word,
                    })
                },
            )?;

            let chunks = compressed.chunks(block_size);
            if let Some(cb) = progress.as_mut() {
                cb.init(address, chunks.len());
            }

            // Shadow-decompress each block to learn how many flash bytes it
            // expands to, which is what the write latency scales with
            let mut decoder = ZlibDecoder::new(Vec::new());
            let mut decoded_size = 0;
            let is_stub = self.is_stub();

            for block in chunks {
                decoder.write_all(block)?;
                decoder.flush()?;
                let block_uncompressed = decoder.get_ref().len() - decoded_size;
                decoded_size = decoder.get_ref().len();

                let block_timeout = CommandType::FlashDeflData
                    .timeout_for_size(block_uncompressed as u32);
                if !is_stub {
                    // The ROM writes the block to flash before acknowledging
                    session.timeout = block_timeout;
                }

                let sequence = session.sequence;
                let timeout = session.timeout;
                self.connection().with_timeout(timeout, |connection| {
                    connection.command(Command::FlashDeflData {
                        data: block,
                        pad_to: 0,
                        pad_byte: 0xFF,
                        sequence,
                    })
                })?;

                if is_stub {
                    // The stub acknowledges receipt, then writes this block
                    // to flash while receiving the next one
                    session.timeout = block_timeout;
                }

                session.bytes_sent += block.len();
                session.bytes_written += block_uncompressed;
                session.sequence += 1;

                if let Some(cb) = progress.as_mut() {
                    cb.update(session.sequence as usize);
                }
            }
        } else {
            let blocks = image.len().div_ceil(block_size) as u32;

            self.connection().with_timeout(
                CommandType::FlashBegin.timeout_for_size(erase_size),
                |connection| {
                    connection.command(Command::FlashBegin {
                        size: image.len() as u32,
                        blocks,
                        block_size: block_size as u32,
                        offset: address,
                        supports_encryption: takes_encrypted_word,
                        encrypt: encrypted,
                    })
                },
            )?;

            let chunks = image.chunks(block_size);
            if let Some(cb) = progress.as_mut() {
                cb.init(address, chunks.len());
            }

            let use_encrypted_command = encrypted && self.profile().encrypted_data_command;

            for block in chunks {
                let sequence = session.sequence;
                let timeout = session.timeout;
                self.connection().with_timeout(timeout, |connection| {
                    // The last block is padded with erased bytes up to the
                    // full block size
                    let command = if use_encrypted_command {
                        Command::FlashEncryptedData {
                            data: block,
                            pad_to: block_size,
                            pad_byte: 0xFF,
                            sequence,
                        }
                    } else {
                        Command::FlashData {
                            data: block,
                            pad_to: block_size,
                            pad_byte: 0xFF,
                            sequence,
                        }
                    };
                    connection.command(command)
                })?;

                session.bytes_sent += block_size;
                session.bytes_written += block_size;
                session.sequence += 1;

                if let Some(cb) = progress.as_mut() {
                    cb.update(session.sequence as usize);
                }
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish();
        }

        Ok(())
    }

    /// Check the written region against the device's digest of it.
    fn verify_written(
        &mut self,
        address: u32,
        size: u32,
        expected_md5: &[u8],
        encrypted: bool,
        no_verify: bool,
    ) -> Result<bool, Error> {
        if no_verify {
            return Ok(false);
        }
        if encrypted || self.secure_download_mode() {
            debug!("Cannot verify written data if encrypted or in secure download mode");
            return Ok(false);
        }

        let device_md5 = match self.flash_md5(address, size) {
            Ok(digest) => digest,
            Err(Error::Rom(e)) if e.kind().is_unsupported() => {
                warn!("This loader does not support flash digests, skipping verification");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let device_bytes = device_md5.to_be_bytes();
        if device_bytes.as_slice() == expected_md5 {
            debug!("Hash of data verified");
            return Ok(true);
        }

        // An untouched region hashes like erased flash; report that case
        // separately from a garbled write
        let erased_md5 = Md5::digest(vec![0xFF_u8; size as usize]);
        if device_bytes.as_slice() == erased_md5.as_slice() {
            return Err(Error::WriteFailedRegionEmpty { address });
        }

        Err(Error::DigestMismatch {
            expected: hex(expected_md5),
            actual: hex(device_bytes),
        })
    }

    /// Begin a plain (possibly zero-length) flash write.
    fn flash_begin_plain(&mut self, size: u32, blocks: u32, offset: u32) -> Result<(), Error> {
        let block_size = self.flash_write_size() as u32;
        let takes_encrypted_word = !self.profile().encrypted_data_command && !self.is_stub();
        self.connection().with_timeout(
            CommandType::FlashBegin.timeout_for_size(size),
            |connection| {
                connection.command(Command::FlashBegin {
                    size,
                    blocks,
                    block_size,
                    offset,
                    supports_encryption: takes_encrypted_word,
                    encrypt: false,
                })
            },
        )?;
        Ok(())
    }
}

/// Pad data with `pad` up to a multiple of `align`.
fn pad_to(mut data: Vec<u8>, align: usize, pad: u8) -> Vec<u8> {
    let padding = (align - data.len() % align) % align;
    data.extend(std::iter::repeat(pad).take(padding));
    data
}

fn format_revision(revision: u32) -> String {
    format!("v{}.{}", revision / 100, revision % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_to_is_identity_on_aligned_input() {
        assert_eq!(pad_to(vec![1, 2, 3, 4], 4, 0xFF), vec![1, 2, 3, 4]);
        assert_eq!(pad_to(vec![], 4, 0xFF), Vec::<u8>::new());
    }

    #[test]
    fn pad_to_fills_with_erased_bytes() {
        assert_eq!(pad_to(vec![1], 4, 0xFF), vec![1, 0xFF, 0xFF, 0xFF]);
        assert_eq!(pad_to(vec![1, 2, 3], 16, 0xFF).len(), 16);
    }

    #[test]
    fn revision_formatting() {
        assert_eq!(format_revision(0), "v0.0");
        assert_eq!(format_revision(101), "v1.1");
        assert_eq!(format_revision(205), "v2.5");
    }
}
