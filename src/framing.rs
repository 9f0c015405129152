//! Wire packet framing and CRC codec (spec §3, §4.1).
//!
//! ```text
//! sof(1) version(1) length(2) seq_num(4) cmd_id(2) cmd_type(1) sender_type(1)
//! reserved(6) crc16_h(2) crc32_d(4) payload(length - 24)
//! ```

use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISO_HDLC};

use crate::error::FramingError;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const SOF: u8 = 0xAA;
pub const HEADER_LEN: usize = 24;
/// Offset of `crc16_h`: the CRC-16 covers everything before this point.
const CRC16_OFFSET: usize = 18;
pub const MAX_PAYLOAD_LEN: usize = 1400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdType {
    Cmd = 0,
    Ack = 1,
}

impl CmdType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Cmd),
            1 => Some(Self::Ack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderType {
    Host = 0,
    Device = 1,
}

impl SenderType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Host),
            1 => Some(Self::Device),
            _ => None,
        }
    }
}

/// A logical packet ready to be framed, or the result of parsing a framed
/// datagram. `payload` borrows from the input buffer on the decode path so
/// parsing a rejected datagram allocates nothing.
#[derive(Debug, Clone, Copy)]
pub struct CmdPacket<'a> {
    pub version: u8,
    pub seq_num: u32,
    pub cmd_id: u16,
    pub cmd_type: CmdType,
    pub sender_type: SenderType,
    pub payload: &'a [u8],
}

impl<'a> CmdPacket<'a> {
    /// Encodes this packet into a freshly allocated framed datagram.
    ///
    /// # Errors
    /// Returns [`FramingError::PayloadTooLarge`] if `payload` exceeds
    /// [`MAX_PAYLOAD_LEN`].
    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FramingError::PayloadTooLarge(self.payload.len()));
        }

        let total_len = HEADER_LEN + self.payload.len();
        let mut buf = Vec::with_capacity(total_len);

        buf.push(SOF);
        buf.push(self.version);
        buf.extend_from_slice(&(total_len as u16).to_le_bytes());
        buf.extend_from_slice(&self.seq_num.to_le_bytes());
        buf.extend_from_slice(&self.cmd_id.to_le_bytes());
        buf.push(self.cmd_type as u8);
        buf.push(self.sender_type as u8);
        buf.extend_from_slice(&[0u8; 6]);

        debug_assert_eq!(buf.len(), CRC16_OFFSET);
        let crc16 = CRC16.checksum(&buf[..CRC16_OFFSET]);
        buf.extend_from_slice(&crc16.to_le_bytes());

        let crc32 = CRC32.checksum(self.payload);
        buf.extend_from_slice(&crc32.to_le_bytes());

        debug_assert_eq!(buf.len(), HEADER_LEN);
        buf.extend_from_slice(self.payload);

        Ok(buf)
    }

    /// Parses a framed datagram out of `input`.
    ///
    /// On success, the returned packet's `payload` borrows from `input`.
    /// On failure no partial state is produced: the caller gets back a
    /// reason and nothing else.
    pub fn parse(input: &'a [u8]) -> Result<Self, FramingError> {
        if input.len() < HEADER_LEN {
            return Err(FramingError::Truncated);
        }
        if input[0] != SOF {
            return Err(FramingError::BadSof);
        }

        let length = u16::from_le_bytes([input[2], input[3]]) as usize;
        if length > input.len() || length < HEADER_LEN {
            return Err(FramingError::LengthMismatch {
                declared: length,
                available: input.len(),
            });
        }

        let crc16_expected = u16::from_le_bytes([input[CRC16_OFFSET], input[CRC16_OFFSET + 1]]);
        let crc16_actual = CRC16.checksum(&input[..CRC16_OFFSET]);
        if crc16_actual != crc16_expected {
            return Err(FramingError::BadCrc16);
        }

        let payload = &input[HEADER_LEN..length];
        let crc32_expected = u32::from_le_bytes([
            input[20], input[21], input[22], input[23],
        ]);
        let crc32_actual = CRC32.checksum(payload);
        if crc32_actual != crc32_expected {
            return Err(FramingError::BadCrc32);
        }

        let version = input[1];
        let seq_num = u32::from_le_bytes([input[4], input[5], input[6], input[7]]);
        let cmd_id = u16::from_le_bytes([input[8], input[9]]);
        let cmd_type = CmdType::from_u8(input[10]).ok_or(FramingError::BadTypeTag)?;
        let sender_type = SenderType::from_u8(input[11]).ok_or(FramingError::BadTypeTag)?;

        Ok(Self {
            version,
            seq_num,
            cmd_id,
            cmd_type,
            sender_type,
            payload,
        })
    }
}
