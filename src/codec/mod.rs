//! DNS wire codec.
//!
//! Encoding writes plain (uncompressed) names; decoding follows RFC 1035
//! compression pointers anywhere a domain name may appear, including inside
//! RDATA of name-shaped record types.

mod enums;
mod header;
mod message;
mod question;
mod record;

pub use enums::RecordType;
pub use header::Header;
pub use message::Message;
pub use question::Question;
pub use record::Record;

use thiserror::Error;

use crate::constants::MAX_COMPRESSION_JUMPS;

/// DNS class IN, the only class this resolver speaks.
pub const CLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_NXDOMAIN: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid DNS header")]
    InvalidHeader,
    #[error("invalid DNS label")]
    InvalidLabel,
    #[error("invalid resource record")]
    InvalidRecord,
    #[error("truncated DNS packet")]
    UnexpectedEnd,
    #[error("bit stream error: {0}")]
    BitStream(String),
}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        ParseError::BitStream(err.to_string())
    }
}

/// Parse a possibly-compressed domain name starting at `start`.
///
/// Returns the labels and the offset just past the name in the original run
/// (i.e. past the first pointer when one was followed).
pub(crate) fn parse_name(buf: &[u8], start: usize) -> Result<(Vec<String>, usize), ParseError> {
    let mut labels = Vec::new();
    let mut offset = start;
    let mut jumps = 0usize;
    let mut end_after_pointer = None;

    loop {
        let len = *buf.get(offset).ok_or(ParseError::UnexpectedEnd)? as usize;

        if len == 0 {
            offset += 1;
            break;
        }

        if len & 0xC0 == 0xC0 {
            let second = *buf.get(offset + 1).ok_or(ParseError::UnexpectedEnd)? as usize;
            if end_after_pointer.is_none() {
                end_after_pointer = Some(offset + 2);
            }
            jumps += 1;
            if jumps > MAX_COMPRESSION_JUMPS {
                return Err(ParseError::InvalidLabel);
            }
            offset = ((len & 0x3F) << 8) | second;
            continue;
        }

        if len > 63 {
            return Err(ParseError::InvalidLabel);
        }

        let bytes = buf
            .get(offset + 1..offset + 1 + len)
            .ok_or(ParseError::UnexpectedEnd)?;
        let label = String::from_utf8(bytes.to_vec()).map_err(|_| ParseError::InvalidLabel)?;
        labels.push(label);
        offset += 1 + len;

        if labels.len() > 128 {
            return Err(ParseError::InvalidLabel);
        }
    }

    Ok((labels, end_after_pointer.unwrap_or(offset)))
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = buf
        .get(offset..offset + 2)
        .ok_or(ParseError::UnexpectedEnd)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or(ParseError::UnexpectedEnd)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn write_labels(buf: &mut Vec<u8>, labels: &[String]) -> Result<(), ParseError> {
    for label in labels {
        if label.is_empty() || label.len() > 63 {
            return Err(ParseError::InvalidLabel);
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    Ok(())
}
