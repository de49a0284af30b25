// SPDX-License-Identifier: MIT OR Apache-2.0
//! Header codec and the streaming header reader

use crate::crc::{crc16, crc32};
use crate::error::Error;
use crate::escape;
use crate::{OutBuffer, XON, ZDLE, ZPAD};
use bitflags::bitflags;
use core::convert::TryFrom;
use core::fmt::{self, Display};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use tinyvec::{array_vec, ArrayVec};

/// Buffer size with enough capacity for an escaped header.
const HEADER_SIZE: usize = 32;

pub(crate) const ZACK_HEADER: Header = Header::new(Encoding::ZHEX, Frame::ZACK, &[0; 4]);
pub(crate) const ZFIN_HEADER: Header = Header::new(Encoding::ZHEX, Frame::ZFIN, &[0; 4]);
pub(crate) const ZRPOS_HEADER: Header = Header::new(Encoding::ZHEX, Frame::ZRPOS, &[0; 4]);
pub(crate) const ZRQINIT_HEADER: Header = Header::new(Encoding::ZHEX, Frame::ZRQINIT, &[0; 4]);

/// The ZMODEM protocol frame encoding
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, EnumIter, PartialEq, Eq)]
pub enum Encoding {
    ZBIN = 0x41,
    ZHEX = 0x42,
    ZBIN32 = 0x43,
}

impl Encoding {
    /// Width in bytes of the trailing checksum under this encoding.
    #[must_use]
    pub const fn crc_len(self) -> usize {
        match self {
            Encoding::ZBIN | Encoding::ZHEX => 2,
            Encoding::ZBIN32 => 4,
        }
    }
}

impl TryFrom<u8> for Encoding {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Encoding::iter()
            .find(|e| value == *e as u8)
            .ok_or(Error::MalformedEncoding)
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#02x}", *self as u8)
    }
}

#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, EnumIter, PartialEq, Eq)]
/// Frame types
pub enum Frame {
    /// Request receive init
    ZRQINIT = 0,
    /// Receiver capabilities and packet size
    ZRINIT = 1,
    /// Send init sequence (optional)
    ZSINIT = 2,
    /// ACK to above
    ZACK = 3,
    /// File name from sender
    ZFILE = 4,
    /// To sender: skip this file
    ZSKIP = 5,
    /// Last packet was garbled
    ZNAK = 6,
    /// Abort batch transfers
    ZABORT = 7,
    /// Finish session
    ZFIN = 8,
    /// Resume data trans at this position
    ZRPOS = 9,
    /// Data packet(s) follow
    ZDATA = 10,
    /// End of file
    ZEOF = 11,
    /// Fatal Read or Write error Detected
    ZFERR = 12,
    /// Request for file CRC and response
    ZCRC = 13,
    /// Receiver's Challenge
    ZCHALLENGE = 14,
    /// Request is complete
    ZCOMPL = 15,
    /// Other end canned session with CAN*5
    ZCAN = 16,
    /// Request for free bytes on filesystem
    ZFREECNT = 17,
    /// Command from sending program
    ZCOMMAND = 18,
    /// Output to standard error, data follows
    ZSTDERR = 19,
}

impl TryFrom<u8> for Frame {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Frame::iter()
            .find(|t| value == *t as u8)
            .ok_or(Error::MalformedFrame)
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#02x}", *self as u8)
    }
}

bitflags! {
   /// `ZRINIT` flags
   pub struct Zrinit: u8 {
        /// Can send and receive in full-duplex
        const CANFDX = 0x01;
        /// Can receive data in parallel with disk I/O
        const CANOVIO = 0x02;
        /// Can send a break signal
        const CANBRK = 0x04;
        /// Can decrypt
        const CANCRY = 0x08;
        /// Can uncompress
        const CANLZW = 0x10;
        /// Can use 32-bit frame check
        const CANFC32 = 0x20;
        /// Expects control character to be escaped
        const ESCCTL = 0x40;
        /// Expects 8th bit to be escaped
        const ESC8 = 0x80;
    }
}

/// Data structure for holding a ZMODEM protocol header, which begins a frame,
/// and is followed optionally by a variable number of subpackets.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    encoding: Encoding,
    frame: Frame,
    flags: [u8; 4],
}

impl Header {
    /// Creates a new instance
    #[must_use]
    pub const fn new(encoding: Encoding, frame: Frame, flags: &[u8; 4]) -> Self {
        Self {
            encoding,
            frame,
            flags: *flags,
        }
    }

    /// Returns `Encoding` of the frame
    #[must_use]
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Returns `Frame`, containing the frame type
    #[must_use]
    pub const fn frame(&self) -> Frame {
        self.frame
    }

    /// Returns the raw flag bytes
    #[must_use]
    pub const fn flags(&self) -> &[u8; 4] {
        &self.flags
    }

    /// Returns count for the frame types using this field
    #[must_use]
    pub const fn count(&self) -> u32 {
        u32::from_le_bytes(self.flags)
    }

    /// Returns a new instance with the flags substituted with a count
    /// for the frame types using this field.
    #[must_use]
    pub const fn with_count(&self, count: u32) -> Self {
        Header::new(self.encoding, self.frame, &count.to_le_bytes())
    }

    /// Number of unescaped body bytes the reader must collect after the
    /// encoding byte: payload plus checksum, or the hex-character count for
    /// `ZHEX`.
    #[must_use]
    pub const fn read_size(encoding: Encoding) -> usize {
        match encoding {
            Encoding::ZBIN => 7,
            Encoding::ZBIN32 => 9,
            // The 7-byte body as two ASCII characters per byte:
            Encoding::ZHEX => 14,
        }
    }

    /// Appends the fully framed wire form to `out`: ZPAD preamble, ZDLE,
    /// encoding byte and the escaped (or hex-expanded) body with its
    /// checksum.
    ///
    /// # Errors
    ///
    /// * `Err(Error::MalformedHeader)` when the hex expansion does not fit
    ///   its staging buffer
    pub fn encode(&self, out: &mut OutBuffer) -> Result<(), Error> {
        out.push(ZPAD);
        if self.encoding == Encoding::ZHEX {
            out.push(ZPAD);
        }
        out.push(ZDLE);
        out.push(self.encoding as u8);
        let mut body = array_vec!([u8; HEADER_SIZE]);
        body.push(self.frame as u8);
        body.extend_from_slice(&self.flags);
        let mut crc = [0u8; 4];
        let crc_len = make_crc(&body, &mut crc, self.encoding);
        body.extend_from_slice(&crc[..crc_len]);
        if self.encoding == Encoding::ZHEX {
            let mut hexbuf = [0u8; HEADER_SIZE];
            let len = body.len() * 2;
            if len > hexbuf.len() {
                return Err(Error::MalformedHeader);
            }
            let hex = &mut hexbuf[..len];
            hex::encode_to_slice(&body, hex).map_err(|_| Error::MalformedHeader)?;
            body.truncate(0);
            body.extend_from_slice(hex);
        }
        // Identity on ZHEX bodies as hex characters are not in the escape
        // set:
        escape::push_slice_escaped(out, &body);
        if self.encoding == Encoding::ZHEX {
            // Add trailing CRLF for ZHEX transfer:
            out.push(b'\r');
            out.push(b'\n');
            if self.frame != Frame::ZACK && self.frame != Frame::ZFIN {
                out.push(XON);
            }
        }
        Ok(())
    }

    /// Decodes an unescaped header body (the `read_size` bytes following the
    /// encoding byte) and validates its checksum.
    ///
    /// # Errors
    ///
    /// * `Err(Error::MalformedHeader)` when the body is structurally broken
    /// * `Err(Error::UnexpectedCrc16)` / `Err(Error::UnexpectedCrc32)` on a
    ///   checksum mismatch
    /// * `Err(Error::MalformedFrame)` when the frame type byte is unknown
    pub fn decode(encoding: Encoding, body: &[u8]) -> Result<Header, Error> {
        if body.len() > HEADER_SIZE {
            return Err(Error::MalformedHeader);
        }
        let mut out = array_vec!([u8; HEADER_SIZE]);
        if encoding == Encoding::ZHEX {
            if body.len() % 2 != 0 {
                return Err(Error::MalformedHeader);
            }
            out.set_len(body.len() / 2);
            hex::decode_to_slice(body, &mut out).map_err(|_| Error::MalformedHeader)?;
        } else {
            out.extend_from_slice(body);
        }
        let crc_len = encoding.crc_len();
        if out.len() < 5 + crc_len {
            return Err(Error::MalformedHeader);
        }
        check_crc(&out[..5], &out[5..5 + crc_len], encoding)?;
        let frame = Frame::try_from(out[0])?;
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&out[1..=4]);
        Ok(Header::new(encoding, frame, &flags))
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.encoding, self.frame)
    }
}

fn make_crc(data: &[u8], out: &mut [u8], encoding: Encoding) -> usize {
    if encoding == Encoding::ZBIN32 {
        out[..4].copy_from_slice(&crc32(data).to_le_bytes());
        4
    } else {
        out[..2].copy_from_slice(&crc16(data).to_be_bytes());
        2
    }
}

fn check_crc(data: &[u8], crc: &[u8], encoding: Encoding) -> Result<(), Error> {
    let mut expected = [0u8; 4];
    let len = make_crc(data, &mut expected, encoding);
    if crc != &expected[..len] {
        log::error!("header CRC mismatch: {:?} != {:?}", crc, &expected[..len]);
        return Err(if encoding == Encoding::ZBIN32 {
            Error::UnexpectedCrc32
        } else {
            Error::UnexpectedCrc16
        });
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadState {
    SeekingZpad,
    ReadingEncoding,
    ReadingData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ZpadState {
    Idle,
    OneZpad,
    TwoZpads,
}

/// Extracts validated headers from a noisy byte stream. Arbitrary terminal
/// output before the ZPAD preamble is skipped; partial headers persist
/// across `feed` calls.
pub(crate) struct HeaderReader {
    state: ReadState,
    zpad: ZpadState,
    encoding: Encoding,
    body: ArrayVec<[u8; HEADER_SIZE]>,
    escape_pending: bool,
}

impl HeaderReader {
    pub fn new() -> Self {
        Self {
            state: ReadState::SeekingZpad,
            zpad: ZpadState::Idle,
            encoding: Encoding::ZBIN,
            body: ArrayVec::new(),
            escape_pending: false,
        }
    }

    pub fn reset(&mut self) {
        self.state = ReadState::SeekingZpad;
        self.zpad = ZpadState::Idle;
        self.body.clear();
        self.escape_pending = false;
    }

    /// Consumes bytes from `input` until a header completes or the input is
    /// exhausted. Returns the header (if one completed) and the number of
    /// bytes consumed. The reader resets itself on failure so that
    /// subsequent bytes can re-synchronize.
    pub fn feed(&mut self, input: &[u8]) -> Result<(Option<Header>, usize), Error> {
        for (i, byte) in input.iter().enumerate() {
            let byte = *byte;
            match self.state {
                ReadState::SeekingZpad => {
                    self.zpad = match (self.zpad, byte) {
                        (ZpadState::Idle, ZPAD) => ZpadState::OneZpad,
                        (ZpadState::OneZpad | ZpadState::TwoZpads, ZPAD) => ZpadState::TwoZpads,
                        (ZpadState::OneZpad | ZpadState::TwoZpads, ZDLE) => {
                            self.state = ReadState::ReadingEncoding;
                            ZpadState::Idle
                        }
                        _ => ZpadState::Idle,
                    };
                }
                ReadState::ReadingEncoding => match Encoding::try_from(byte) {
                    Ok(encoding) => {
                        self.encoding = encoding;
                        self.body.clear();
                        self.escape_pending = false;
                        self.state = ReadState::ReadingData;
                    }
                    Err(err) => {
                        self.reset();
                        return Err(err);
                    }
                },
                ReadState::ReadingData => {
                    if self.escape_pending {
                        self.escape_pending = false;
                        self.body.push(escape::unescape(byte));
                    } else if byte == ZDLE {
                        self.escape_pending = true;
                    } else {
                        self.body.push(byte);
                    }
                    if self.body.len() == Header::read_size(self.encoding) {
                        let result = Header::decode(self.encoding, &self.body);
                        self.reset();
                        let header = result?;
                        log::debug!("header in: {header}");
                        return Ok((Some(header), i + 1));
                    }
                }
            }
        }
        Ok((None, input.len()))
    }
}
