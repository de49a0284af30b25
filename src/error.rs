// SPDX-License-Identifier: MIT OR Apache-2.0
//! Protocol failure taxonomy

use core::fmt;

/// Failure kinds surfaced by `feed_incoming` and the other entry points.
/// All of them are fatal to the current session but leave the process and
/// any other machine instances intact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Encoding byte is not one of ZBIN, ZHEX or ZBIN32
    MalformedEncoding,
    /// Frame type byte is outside the defined range
    MalformedFrame,
    /// Header body is structurally broken: odd-length or non-hex ZHEX
    /// characters, or a body shorter than payload plus checksum
    MalformedHeader,
    /// Subpacket structure is broken
    MalformedPacket,
    /// ZFILE payload is missing the file name field
    MalformedFileName,
    /// ZFILE size field is not a valid decimal integer
    MalformedFileSize,
    /// CRC-16 mismatch on a header or subpacket
    UnexpectedCrc16,
    /// CRC-32 mismatch on a header or subpacket
    UnexpectedCrc32,
    /// File chunk fed to the sender was empty, longer than requested, or
    /// past the declared file size
    UnexpectedEof,
    /// A bounded buffer or the event queue would overflow
    OutOfMemory,
    /// Operation invoked in a state that does not allow it
    Unsupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Error::MalformedEncoding => "invalid encoding byte",
            Error::MalformedFrame => "invalid frame type byte",
            Error::MalformedHeader => "malformed header body",
            Error::MalformedPacket => "malformed subpacket",
            Error::MalformedFileName => "missing or invalid file name",
            Error::MalformedFileSize => "invalid file size field",
            Error::UnexpectedCrc16 => "CRC-16 mismatch",
            Error::UnexpectedCrc32 => "CRC-32 mismatch",
            Error::UnexpectedEof => "file chunk out of bounds",
            Error::OutOfMemory => "buffer capacity exceeded",
            Error::Unsupported => "operation not legal in this state",
        };
        write!(f, "{msg}")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
