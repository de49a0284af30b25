// SPDX-License-Identifier: MIT OR Apache-2.0
//! CRC-16-XMODEM and CRC-32-ISO-HDLC, one-shot and incremental

use crc::{Crc, Digest, CRC_16_XMODEM, CRC_32_ISO_HDLC};

/// CRC algorithm for `ZBIN` or `ZHEX` encoded transmissions.
static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC algorithm for `ZBIN32` encoded transmissions.
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// One-shot CRC-16-XMODEM over `data`.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// One-shot CRC-32-ISO-HDLC over `data`.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Incremental CRC-16-XMODEM, fed byte by byte from the unescape loops.
pub struct Crc16 {
    digest: Digest<'static, u16>,
}

impl Crc16 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            digest: CRC16.digest(),
        }
    }

    pub fn reset(&mut self) {
        self.digest = CRC16.digest();
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn update_byte(&mut self, value: u8) {
        self.digest.update(&[value]);
    }

    /// Returns the checksum of everything fed since the last reset, and
    /// resets.
    pub fn finalize(&mut self) -> u16 {
        core::mem::replace(&mut self.digest, CRC16.digest()).finalize()
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental CRC-32-ISO-HDLC, fed byte by byte from the unescape loops.
pub struct Crc32 {
    digest: Digest<'static, u32>,
}

impl Crc32 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }

    pub fn reset(&mut self) {
        self.digest = CRC32.digest();
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn update_byte(&mut self, value: u8) {
        self.digest.update(&[value]);
    }

    /// Returns the checksum of everything fed since the last reset, and
    /// resets.
    pub fn finalize(&mut self) -> u32 {
        core::mem::replace(&mut self.digest, CRC32.digest()).finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}
