#![allow(dead_code)]

//! A scripted in-memory device for driving the flasher without hardware.
//!
//! [MockTransport] implements [Transport] on top of a shared [MockState]
//! which emulates the device side of the serial protocol: it decodes the
//! SLIP frames the flasher writes, runs a small model of the loader (flash
//! array, registers, transfer state) and queues the response frames the
//! flasher will read. Tests keep a handle to the state to script failures
//! and to assert on what reached the device.

use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, Read, Write},
    rc::Rc,
    time::Duration,
};

use esploader::Transport;
use flate2::write::ZlibDecoder;
use md5::{Digest, Md5};

pub const FLASH_LEN: usize = 4 * 1024 * 1024;
const MAGIC_REG: u32 = 0x4000_1000;
const SECTOR: u32 = 0x1000;

pub const ESP32_MAGIC: u32 = 0x00f0_1d83;
const ESP32C3_MAGIC: u32 = 0x1b31_506f;

/// A flash ID whose size byte decodes to 4 MB
pub const FLASH_ID_4MB: u32 = 0x0016_4020;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockChip {
    /// Identified by its magic word, no security info support
    Esp32,
    /// Identified by its chip ID through the security info command
    Esp32c3,
}

/// A begin command observed by the device
#[derive(Debug, Clone)]
pub struct Begin {
    pub op: u8,
    pub offset: u32,
    pub size: u32,
    pub blocks: u32,
    pub block_size: u32,
    pub encrypted: bool,
}

struct Transfer {
    offset: u32,
    written: usize,
    /// Present for compressed transfers
    decoder: Option<ZlibDecoder<Vec<u8>>>,
}

pub struct MockState {
    pub chip: MockChip,
    pub flash: Vec<u8>,
    pub reg_values: HashMap<u32, u32>,
    pub flash_id: u32,
    pub security_flags: u32,
    pub flash_crypt_cnt: u8,
    pub key_purposes: [u8; 7],
    /// Refuse register reads, like a chip locked in secure download mode
    pub secure_download_mode: bool,
    /// Accept data blocks but never commit them to flash
    pub drop_writes: bool,
    /// Corrupt every committed byte, to provoke digest mismatches
    pub corrupt_writes: bool,
    /// Simulate a disconnect when the Nth (1-based) data block arrives
    pub fail_on_data_block: Option<u32>,

    pub begins: Vec<Begin>,
    pub erased: Vec<(u32, u32)>,
    pub erase_all_count: u32,
    /// Count of commands that mutate flash contents
    pub mutation_commands: u32,
    pub open_count: u32,

    stub: bool,
    failed: bool,
    data_seen: u32,
    timeout: Duration,
    baud: u32,
    rx: Vec<u8>,
    frame: Vec<u8>,
    frame_active: bool,
    escape: bool,
    transfer: Option<Transfer>,
}

impl MockState {
    fn new(chip: MockChip) -> Self {
        MockState {
            chip,
            flash: vec![0xFF; FLASH_LEN],
            reg_values: HashMap::new(),
            flash_id: FLASH_ID_4MB,
            security_flags: 0,
            flash_crypt_cnt: 0,
            key_purposes: [0; 7],
            secure_download_mode: false,
            drop_writes: false,
            corrupt_writes: false,
            fail_on_data_block: None,
            begins: Vec::new(),
            erased: Vec::new(),
            erase_all_count: 0,
            mutation_commands: 0,
            open_count: 1,
            stub: false,
            failed: false,
            data_seen: 0,
            timeout: Duration::from_secs(3),
            baud: 115_200,
            rx: Vec::new(),
            frame: Vec::new(),
            frame_active: false,
            escape: false,
            transfer: None,
        }
    }

    fn magic(&self) -> u32 {
        match self.chip {
            MockChip::Esp32 => ESP32_MAGIC,
            MockChip::Esp32c3 => ESP32C3_MAGIC,
        }
    }

    fn spi_base(&self) -> u32 {
        match self.chip {
            MockChip::Esp32 => 0x3ff4_2000,
            MockChip::Esp32c3 => 0x6000_2000,
        }
    }

    fn spi_w0(&self) -> u32 {
        match self.chip {
            MockChip::Esp32 => self.spi_base() + 0x80,
            MockChip::Esp32c3 => self.spi_base() + 0x58,
        }
    }

    /// Decode inbound bytes, handling each completed SLIP frame.
    fn ingest(&mut self, buf: &[u8]) {
        for byte in buf {
            match *byte {
                0xC0 => {
                    if self.frame_active && !self.frame.is_empty() {
                        let frame = std::mem::take(&mut self.frame);
                        self.frame_active = false;
                        self.handle_frame(&frame);
                    } else {
                        self.frame_active = true;
                    }
                    self.escape = false;
                }
                0xDB if self.frame_active => self.escape = true,
                value if self.frame_active => {
                    let value = if self.escape {
                        self.escape = false;
                        match value {
                            0xDC => 0xC0,
                            0xDD => 0xDB,
                            other => other,
                        }
                    } else {
                        value
                    };
                    self.frame.push(value);
                }
                _ => {}
            }
        }
    }

    fn push_frame(&mut self, frame: &[u8]) {
        self.rx.push(0xC0);
        for byte in frame {
            match *byte {
                0xC0 => self.rx.extend([0xDB, 0xDC]),
                0xDB => self.rx.extend([0xDB, 0xDD]),
                other => self.rx.push(other),
            }
        }
        self.rx.push(0xC0);
    }

    fn respond(&mut self, op: u8, value: u32, payload: &[u8], error: Option<u8>) {
        let status_len = if self.stub { 2 } else { 4 };
        let mut frame = vec![0x01, op];
        frame.extend(((payload.len() + status_len) as u16).to_le_bytes());
        frame.extend(value.to_le_bytes());
        frame.extend(payload);
        match error {
            None => frame.extend([0, 0]),
            Some(code) => frame.extend([1, code]),
        }
        if status_len == 4 {
            frame.extend([0, 0]);
        }
        self.push_frame(&frame);
    }

    fn erase(&mut self, offset: u32, size: u32) {
        let erase_len = size.div_ceil(SECTOR) * SECTOR;
        let start = offset as usize;
        let end = (offset + erase_len).min(self.flash.len() as u32) as usize;
        self.flash[start..end].fill(0xFF);
        self.erased.push((offset, erase_len));
    }

    fn commit(&mut self, data: &[u8]) {
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        let start = transfer.offset as usize + transfer.written;
        transfer.written += data.len();
        if self.drop_writes {
            return;
        }
        let end = (start + data.len()).min(self.flash.len());
        for (i, byte) in data[..end - start].iter().enumerate() {
            self.flash[start + i] = if self.corrupt_writes {
                byte ^ 0x01
            } else {
                *byte
            };
        }
    }

    /// Returns true when the frame triggered a scripted disconnect.
    fn data_block_arrived(&mut self) -> bool {
        self.data_seen += 1;
        if self.fail_on_data_block == Some(self.data_seen) {
            self.fail_on_data_block = None;
            self.failed = true;
            return true;
        }
        false
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        if frame.len() < 8 || frame[0] != 0 {
            // raw ack frames from streamed reads, nothing to answer
            return;
        }
        let op = frame[1];
        let payload = &frame[8..];

        match op {
            // sync
            0x08 => self.respond(op, 0, &[], None),
            // read reg
            0x0A => {
                let addr = read_u32(payload, 0);
                if self.secure_download_mode {
                    self.respond(op, 0, &[], Some(0x05));
                    return;
                }
                let value = if addr == MAGIC_REG {
                    self.magic()
                } else {
                    *self.reg_values.get(&addr).unwrap_or(&0)
                };
                self.respond(op, value, &[], None);
            }
            // write reg
            0x09 => {
                let addr = read_u32(payload, 0);
                let value = read_u32(payload, 4);
                if addr == self.spi_base() && value == 1 << 18 {
                    // SPI command start: complete it immediately and latch
                    // the flash ID into the data register
                    self.reg_values.insert(addr, 0);
                    let w0 = self.spi_w0();
                    let flash_id = self.flash_id;
                    self.reg_values.insert(w0, flash_id);
                } else {
                    self.reg_values.insert(addr, value);
                }
                self.respond(op, 0, &[], None);
            }
            // get security info
            0x14 => {
                if self.chip == MockChip::Esp32 {
                    self.respond(op, 0, &[], Some(0x05));
                    return;
                }
                let mut info = Vec::new();
                info.extend(self.security_flags.to_le_bytes());
                info.push(self.flash_crypt_cnt);
                info.extend(self.key_purposes);
                info.extend(5_u32.to_le_bytes()); // chip id
                info.extend(0_u32.to_le_bytes()); // eco version
                self.respond(op, 0, &info, None);
            }
            // spi set params / spi attach
            0x0B | 0x0D => self.respond(op, 0, &[], None),
            // flash begin
            0x02 => {
                self.mutation_commands += 1;
                let size = read_u32(payload, 0);
                let blocks = read_u32(payload, 4);
                let block_size = read_u32(payload, 8);
                let offset = read_u32(payload, 12);
                let encrypted = payload.len() >= 20 && read_u32(payload, 16) == 1;
                self.begins.push(Begin {
                    op,
                    offset,
                    size,
                    blocks,
                    block_size,
                    encrypted,
                });
                if size > 0 {
                    self.erase(offset, size);
                }
                self.transfer = Some(Transfer {
                    offset,
                    written: 0,
                    decoder: None,
                });
                self.respond(op, 0, &[], None);
            }
            // flash deflate begin
            0x10 => {
                self.mutation_commands += 1;
                let size = read_u32(payload, 0);
                let blocks = read_u32(payload, 4);
                let block_size = read_u32(payload, 8);
                let offset = read_u32(payload, 12);
                self.begins.push(Begin {
                    op,
                    offset,
                    size,
                    blocks,
                    block_size,
                    encrypted: false,
                });
                if size > 0 {
                    self.erase(offset, size);
                }
                self.transfer = Some(Transfer {
                    offset,
                    written: 0,
                    decoder: Some(ZlibDecoder::new(Vec::new())),
                });
                self.respond(op, 0, &[], None);
            }
            // flash data / encrypted flash data
            0x03 | 0xD4 => {
                self.mutation_commands += 1;
                if self.data_block_arrived() {
                    return;
                }
                let size = read_u32(payload, 0) as usize;
                let data = payload[16..16 + size].to_vec();
                self.commit(&data);
                self.respond(op, 0, &[], None);
            }
            // flash deflate data
            0x11 => {
                self.mutation_commands += 1;
                if self.data_block_arrived() {
                    return;
                }
                let size = read_u32(payload, 0) as usize;
                let block = payload[16..16 + size].to_vec();

                let inflated = {
                    let Some(transfer) = self.transfer.as_mut() else {
                        return;
                    };
                    let Some(decoder) = transfer.decoder.as_mut() else {
                        return;
                    };
                    decoder.write_all(&block).unwrap();
                    decoder.flush().unwrap();
                    decoder.get_ref()[transfer.written..].to_vec()
                };
                self.commit(&inflated);
                self.respond(op, 0, &[], None);
            }
            // flash end / flash deflate end
            0x04 | 0x12 => {
                self.transfer = None;
                self.respond(op, 0, &[], None);
            }
            // flash md5
            0x13 => {
                let addr = read_u32(payload, 0) as usize;
                let size = read_u32(payload, 4) as usize;
                let digest = Md5::digest(&self.flash[addr..addr + size]);
                if self.stub {
                    self.respond(op, 0, &digest, None);
                } else {
                    let ascii: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                    self.respond(op, 0, ascii.as_bytes(), None);
                }
            }
            // erase flash
            0xD0 => {
                self.mutation_commands += 1;
                self.erase_all_count += 1;
                self.flash.fill(0xFF);
                self.respond(op, 0, &[], None);
            }
            // erase region
            0xD1 => {
                self.mutation_commands += 1;
                let offset = read_u32(payload, 0);
                let size = read_u32(payload, 4);
                self.erase(offset, size);
                self.respond(op, 0, &[], None);
            }
            // read flash (slow)
            0x0E => {
                let offset = read_u32(payload, 0) as usize;
                let size = read_u32(payload, 4) as usize;
                let mut chunk = self.flash[offset..offset + size].to_vec();
                chunk.resize(64, 0xFF);
                self.respond(op, 0, &chunk, None);
            }
            // mem begin / mem data
            0x05 | 0x07 => self.respond(op, 0, &[], None),
            // mem end: the stub comes up and greets us
            0x06 => {
                self.respond(op, 0, &[], None);
                self.push_frame(b"OHAI");
                self.stub = true;
            }
            // change baudrate
            0x0F => self.respond(op, 0, &[], None),
            _ => self.respond(op, 0, &[], Some(0x05)),
        }
    }
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap())
}

pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

/// Create a transport backed by a fresh device model, along with the state
/// handle used for scripting and assertions.
pub fn mock(chip: MockChip) -> (Box<MockTransport>, Rc<RefCell<MockState>>) {
    let state = Rc::new(RefCell::new(MockState::new(chip)));
    (
        Box::new(MockTransport {
            state: state.clone(),
        }),
        state,
    )
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.failed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
        }
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for (i, byte) in state.rx.drain(..n).enumerate() {
            buf[i] = byte;
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.failed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
        }
        state.ingest(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.open_count += 1;
        state.failed = false;
        state.rx.clear();
        state.frame.clear();
        state.frame_active = false;
        state.escape = false;
        state.transfer = None;
        state.stub = false;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn reset_to_download(&mut self, _extra_delay: bool) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.failed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
        }
        // the chip reboots into its ROM loader
        state.rx.clear();
        state.transfer = None;
        state.stub = false;
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.state.borrow_mut().timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.state.borrow().timeout
    }

    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.state.borrow_mut().baud = baud;
        Ok(())
    }

    fn baud(&self) -> io::Result<u32> {
        Ok(self.state.borrow().baud)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.borrow_mut().rx.clear();
        Ok(())
    }
}
