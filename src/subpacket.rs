// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subpacket writer and the streaming subpacket reader

use crate::crc::{Crc16, Crc32};
use crate::error::Error;
use crate::escape;
use crate::header::Encoding;
use crate::{Buffer, OutBuffer, ZDLE};
use core::convert::TryFrom;
use core::fmt::{self, Display};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use tinyvec::ArrayVec;

/// The ZMODEM protocol subpacket type
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, EnumIter, PartialEq, Eq)]
pub enum Packet {
    ZCRCE = 0x68,
    ZCRCG = 0x69,
    ZCRCQ = 0x6a,
    ZCRCW = 0x6b,
}

impl TryFrom<u8> for Packet {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Packet::iter()
            .find(|e| value == *e as u8)
            .ok_or(Error::MalformedPacket)
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#02x}", *self as u8)
    }
}

/// Appends one subpacket to `out`: escaped data, the ZDLE-introduced
/// terminator and the escaped checksum over data plus terminator.
pub(crate) fn write_subpacket(out: &mut OutBuffer, encoding: Encoding, kind: Packet, data: &[u8]) {
    let kind_byte = kind as u8;
    escape::push_slice_escaped(out, data);
    out.push(ZDLE);
    out.push(kind_byte);
    let mut crc = [0u8; 4];
    let crc_len = if encoding == Encoding::ZBIN32 {
        let mut digest = Crc32::new();
        digest.update(data);
        digest.update_byte(kind_byte);
        crc.copy_from_slice(&digest.finalize().to_le_bytes());
        4
    } else {
        let mut digest = Crc16::new();
        digest.update(data);
        digest.update_byte(kind_byte);
        crc[..2].copy_from_slice(&digest.finalize().to_be_bytes());
        2
    };
    escape::push_slice_escaped(out, &crc[..crc_len]);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubpacketState {
    Idle,
    Reading,
    Writing,
    Crc,
}

/// Streaming reader for the data phase: unescapes bytes into the payload
/// buffer, recognizes the terminator and verifies the trailing checksum.
/// Partial subpackets persist across `feed` calls.
pub(crate) struct SubpacketReader {
    state: SubpacketState,
    buf: Buffer,
    crc16: Crc16,
    crc32: Crc32,
    encoding: Encoding,
    // ZDLE state is tracked separately for the payload phase and the
    // checksum phase: a ZDLE pair straddling the boundary must escape into
    // the checksum, not the payload.
    escape_data: bool,
    escape_crc: bool,
    crc_buf: ArrayVec<[u8; 4]>,
    terminator: Option<Packet>,
}

impl SubpacketReader {
    pub fn new() -> Self {
        Self {
            state: SubpacketState::Idle,
            buf: Buffer::new(),
            crc16: Crc16::new(),
            crc32: Crc32::new(),
            encoding: Encoding::ZBIN32,
            escape_data: false,
            escape_crc: false,
            crc_buf: ArrayVec::new(),
            terminator: None,
        }
    }

    pub fn state(&self) -> SubpacketState {
        self.state
    }

    /// Unescaped payload of the last completed subpacket.
    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    /// Begins a fresh subpacket under `encoding`, discarding any previous
    /// state.
    pub fn start(&mut self, encoding: Encoding) {
        self.clear();
        self.encoding = encoding;
        self.state = SubpacketState::Reading;
    }

    /// Releases the completed subpacket. Continues reading within the same
    /// frame after ZCRCG/ZCRCQ, goes idle after ZCRCE/ZCRCW.
    pub fn finish(&mut self) -> Option<Packet> {
        let terminator = self.terminator;
        let encoding = self.encoding;
        self.clear();
        self.encoding = encoding;
        self.state = match terminator {
            Some(Packet::ZCRCG | Packet::ZCRCQ) => SubpacketState::Reading,
            _ => SubpacketState::Idle,
        };
        terminator
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.crc16.reset();
        self.crc32.reset();
        self.crc_buf.clear();
        self.escape_data = false;
        self.escape_crc = false;
        self.terminator = None;
        self.state = SubpacketState::Idle;
    }

    fn update_crc(&mut self, value: u8) {
        if self.encoding == Encoding::ZBIN32 {
            self.crc32.update_byte(value);
        } else {
            self.crc16.update_byte(value);
        }
    }

    fn push_payload(&mut self, value: u8) -> Result<(), Error> {
        if self.buf.len() == self.buf.capacity() {
            self.clear();
            return Err(Error::OutOfMemory);
        }
        self.buf.push(value);
        self.update_crc(value);
        Ok(())
    }

    fn verify_crc(&mut self) -> Result<(), Error> {
        if self.encoding == Encoding::ZBIN32 {
            let mut received = [0u8; 4];
            received.copy_from_slice(&self.crc_buf);
            let received = u32::from_le_bytes(received);
            let computed = self.crc32.finalize();
            if received != computed {
                log::error!("subpacket CRC mismatch: {received:#010x} != {computed:#010x}");
                self.clear();
                return Err(Error::UnexpectedCrc32);
            }
        } else {
            let received = u16::from_be_bytes([self.crc_buf[0], self.crc_buf[1]]);
            let computed = self.crc16.finalize();
            if received != computed {
                log::error!("subpacket CRC mismatch: {received:#06x} != {computed:#06x}");
                self.clear();
                return Err(Error::UnexpectedCrc16);
            }
        }
        Ok(())
    }

    /// Consumes bytes from `input` until a subpacket completes or the input
    /// is exhausted. Returns the terminator (when a subpacket completed and
    /// its checksum verified) and the number of bytes consumed. After a
    /// completed subpacket the reader stays in `Writing` until `finish`.
    pub fn feed(&mut self, input: &[u8]) -> Result<(Option<Packet>, usize), Error> {
        for (i, byte) in input.iter().enumerate() {
            let byte = *byte;
            match self.state {
                SubpacketState::Reading => {
                    if self.escape_data {
                        self.escape_data = false;
                        if let Ok(kind) = Packet::try_from(byte) {
                            self.terminator = Some(kind);
                            self.update_crc(kind as u8);
                            self.state = SubpacketState::Crc;
                        } else {
                            self.push_payload(escape::unescape(byte))?;
                        }
                    } else if byte == ZDLE {
                        self.escape_data = true;
                    } else {
                        self.push_payload(byte)?;
                    }
                }
                SubpacketState::Crc => {
                    if self.escape_crc {
                        self.escape_crc = false;
                        self.crc_buf.push(escape::unescape(byte));
                    } else if byte == ZDLE {
                        self.escape_crc = true;
                    } else {
                        self.crc_buf.push(byte);
                    }
                    if self.crc_buf.len() == self.encoding.crc_len() {
                        self.verify_crc()?;
                        self.state = SubpacketState::Writing;
                        return Ok((self.terminator, i + 1));
                    }
                }
                SubpacketState::Idle | SubpacketState::Writing => {
                    return Ok((None, i));
                }
            }
        }
        Ok((None, input.len()))
    }
}
