//! HF2 framing over 64-byte HID reports.
//!
//! Every report starts with a header byte: the top two bits give the packet type and the
//! low six bits the number of payload bytes that follow. A message is split over any number
//! of [`INNER`] packets followed by one [`FINAL`] packet. Serial packets carry console
//! output and are never part of a message.

use scroll::{Pread, LE};

use crate::link::LinkError;

pub const REPORT_SIZE: usize = 64;
pub const MAX_PAYLOAD: usize = REPORT_SIZE - 1;

pub const INNER: u8 = 0x00;
pub const FINAL: u8 = 0x40;
pub const SERIAL_STDOUT: u8 = 0x80;
pub const SERIAL_STDERR: u8 = 0xC0;

const TYPE_MASK: u8 = 0xC0;
const LENGTH_MASK: u8 = 0x3F;

/// Set in the tag of a notification the device sends on its own.
const EVENT_FLAG: u16 = 0x8000;

/// Builds a command message: command id, tag and two reserved bytes, then the payload.
pub fn encode_command(command: u32, tag: u16, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(8 + payload.len());
    message.extend_from_slice(&command.to_le_bytes());
    message.extend_from_slice(&tag.to_le_bytes());
    message.extend_from_slice(&[0, 0]);
    message.extend_from_slice(payload);
    message
}

/// Splits a message into output reports, each prefixed with HID report id 0.
pub fn split_reports(message: &[u8]) -> Vec<[u8; REPORT_SIZE + 1]> {
    let chunks: Vec<&[u8]> = message.chunks(MAX_PAYLOAD).collect();
    let last = chunks.len().saturating_sub(1);

    chunks
        .iter()
        .enumerate()
        .map(|(position, chunk)| {
            let kind = if position == last { FINAL } else { INNER };
            let mut report = [0u8; REPORT_SIZE + 1];
            report[1] = kind | chunk.len() as u8;
            report[2..2 + chunk.len()].copy_from_slice(chunk);
            report
        })
        .collect()
}

/// A complete unit read from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Vec<u8>),
    Serial { stderr: bool, data: Vec<u8> },
}

/// Reassembles messages from input reports.
#[derive(Debug, Default)]
pub struct Assembler {
    buffer: Vec<u8>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one input report, without a report id.
    pub fn push(&mut self, report: &[u8]) -> Result<Option<Frame>, LinkError> {
        let Some((&header, rest)) = report.split_first() else {
            return Ok(None);
        };

        let length = (header & LENGTH_MASK) as usize;
        let data = rest.get(..length).ok_or_else(|| {
            LinkError::Malformed(format!(
                "packet announces {} bytes but the report holds {}",
                length,
                rest.len()
            ))
        })?;

        match header & TYPE_MASK {
            INNER => {
                self.buffer.extend_from_slice(data);
                Ok(None)
            }
            FINAL => {
                self.buffer.extend_from_slice(data);
                Ok(Some(Frame::Message(std::mem::take(&mut self.buffer))))
            }
            kind => Ok(Some(Frame::Serial {
                stderr: kind == SERIAL_STDERR,
                data: data.to_vec(),
            })),
        }
    }
}

/// A decoded device-to-host message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Response {
        tag: u16,
        status: u8,
        status_info: u8,
        payload: Vec<u8>,
    },
    /// The event code is the whole first word, tag flag included.
    Event { code: u32, payload: Vec<u8> },
}

pub fn decode_reply(message: &[u8]) -> Result<Reply, LinkError> {
    if message.len() < 4 {
        return Err(LinkError::Malformed(format!(
            "reply of {} bytes is shorter than its header",
            message.len()
        )));
    }

    let tag: u16 = message.pread_with(0, LE)?;
    let payload = message[4..].to_vec();
    if tag & EVENT_FLAG != 0 {
        return Ok(Reply::Event {
            code: message.pread_with(0, LE)?,
            payload,
        });
    }

    Ok(Reply::Response {
        tag,
        status: message[2],
        status_info: message[3],
        payload,
    })
}
