//! Debug commands and the debug-status cell understood by the device runtime.
//!
//! All payloads are sequences of little-endian 32-bit words.

use scroll::{Pread, LE};

use crate::link::LinkError;

/// Returns `[num_globals, globals_ptr]`.
pub const DBG_GET_GLOBAL_STATE: u32 = 0x53fc_66e0;
/// Continues execution. Acknowledged with an empty reply.
pub const DBG_RESUME: u32 = 0x27a5_5931;
/// Replaces the set of armed breakpoint addresses with the payload words.
pub const DBG_SET_BREAKPOINTS: u32 = 0x6f6a_1e17;
/// Unsolicited notification sent when the device halts. Payload starts with the PC.
pub const EV_DBG_PAUSED: u32 = 0x3692_f9fd;

/// Value of the debug-status cell, the first word of the globals area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DebugStatus {
    /// Run freely, debugging disabled.
    Disabled = 0,
    /// Run until any armed breakpoint is reached.
    Breakpoints = 1,
    /// Halt after one step, even without a breakpoint match.
    SingleStep = 3,
}

impl DebugStatus {
    pub fn as_word(self) -> u32 {
        self as u32
    }

    pub fn from_word(word: u32) -> Option<Self> {
        match word {
            0 => Some(Self::Disabled),
            1 => Some(Self::Breakpoints),
            3 => Some(Self::SingleStep),
            _ => None,
        }
    }
}

/// Serializes words as little-endian bytes.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

/// Parses little-endian words. The length must be a multiple of four.
pub fn bytes_to_words(bytes: &[u8]) -> Result<Vec<u32>, LinkError> {
    if bytes.len() % 4 != 0 {
        return Err(LinkError::Malformed(format!(
            "expected a multiple of 4 bytes, got {}",
            bytes.len()
        )));
    }

    bytes
        .chunks_exact(4)
        .map(|chunk| chunk.pread_with::<u32>(0, LE).map_err(LinkError::from))
        .collect()
}

/// Reads the word at `index`, failing if the reply is too short.
pub fn word_at(bytes: &[u8], index: usize) -> Result<u32, LinkError> {
    Ok(bytes.pread_with::<u32>(index * 4, LE)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_little_endian() {
        assert_eq!(
            words_to_bytes(&[0x1234_5678, 1]),
            vec![0x78, 0x56, 0x34, 0x12, 1, 0, 0, 0]
        );
        assert_eq!(
            bytes_to_words(&[0x00, 0x21, 0x00, 0x00]).unwrap(),
            vec![0x2100]
        );
    }

    #[test]
    fn truncated_words_are_rejected() {
        assert!(bytes_to_words(&[1, 2, 3]).is_err());
        assert!(word_at(&[1, 0, 0, 0], 1).is_err());
    }

    #[test]
    fn status_words() {
        assert_eq!(DebugStatus::SingleStep.as_word(), 3);
        assert_eq!(DebugStatus::from_word(1), Some(DebugStatus::Breakpoints));
        assert_eq!(DebugStatus::from_word(2), None);
    }
}
