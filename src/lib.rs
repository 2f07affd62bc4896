//! A library for flashing Espressif devices over their serial bootloader.
//!
//! The entry point for working with an attached device is [Flasher], which
//! owns the serial [Transport], identifies the connected chip and exposes the
//! flash programming operations (write, read, verify, erase). The on-flash
//! application image format can also be assembled and inspected offline,
//! without any device attached, through the [image_format] module.
//!
//! ```no_run
//! use esploader::{Flasher, SerialTransport};
//!
//! let transport = SerialTransport::open("/dev/ttyUSB0", 115_200)?;
//! let mut flasher = Flasher::connect(Box::new(transport), None, true, None)?;
//! println!("connected to {}", flasher.chip());
//! # Ok::<(), esploader::Error>(())
//! ```

pub use self::{
    connection::{
        transport::{SerialTransport, Transport},
        Connection,
    },
    error::Error,
    flasher::{
        FlashFrequency, FlashMode, FlashSettings, FlashSize, FlashTask, Flasher, SizeSetting,
        Setting, WriteOptions, WriteReport,
    },
    target::{Chip, ChipProfile},
};

pub mod connection;
pub mod elf;
pub mod error;
pub mod flasher;
pub mod image_format;
pub mod progress;
pub mod target;
