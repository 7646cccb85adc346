//! HF2 command codes and the few replies that need parsing.

use scroll::{Pread, LE};

use crate::link::LinkError;

/// HID usage page HF2 devices advertise.
pub const HF2_USAGE_PAGE: u16 = 0xFF97;

pub const HF2_CMD_BININFO: u32 = 0x0001;
pub const HF2_CMD_INFO: u32 = 0x0002;
pub const HF2_CMD_RESET_INTO_APP: u32 = 0x0003;
pub const HF2_CMD_RESET_INTO_BOOTLOADER: u32 = 0x0004;
pub const HF2_CMD_WRITE_FLASH_PAGE: u32 = 0x0006;
pub const HF2_CMD_READ_WORDS: u32 = 0x0008;
pub const HF2_CMD_WRITE_WORDS: u32 = 0x0009;

/// Largest number of words moved by a single read or write command.
pub const MAX_WORDS_PER_COMMAND: u32 = 64;

/// What the device is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinMode {
    Bootloader,
    App,
    Unknown(u32),
}

impl From<u32> for BinMode {
    fn from(mode: u32) -> Self {
        match mode {
            1 => BinMode::Bootloader,
            2 => BinMode::App,
            other => BinMode::Unknown(other),
        }
    }
}

/// Reply to [`HF2_CMD_BININFO`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinInfo {
    pub mode: BinMode,
    pub flash_page_size: u32,
    pub flash_num_pages: u32,
    pub max_message_size: u32,
    /// Only reported by newer bootloaders.
    pub family_id: Option<u32>,
}

impl BinInfo {
    pub fn parse(reply: &[u8]) -> Result<Self, LinkError> {
        Ok(Self {
            mode: reply.pread_with::<u32>(0, LE)?.into(),
            flash_page_size: reply.pread_with(4, LE)?,
            flash_num_pages: reply.pread_with(8, LE)?,
            max_message_size: reply.pread_with(12, LE)?,
            family_id: reply.pread_with(16, LE).ok(),
        })
    }
}
