// SPDX-License-Identifier: MIT OR Apache-2.0
//! Send side of the transfer: ZRQINIT through ZFILE, windowed ZDATA
//! subpackets, ZEOF and the ZFIN/"OO" close.

use crate::error::Error;
use crate::escape;
use crate::header::{
    Encoding, Frame, Header, HeaderReader, Zrinit, ZFIN_HEADER, ZRQINIT_HEADER,
};
use crate::subpacket::{write_subpacket, Packet};
use crate::{Event, EventQueue, OutBuffer, SUBPACKET_MAX_SIZE, SUBPACKET_PER_ACK};
use core::convert::TryFrom;
use core::str::FromStr;
use heapless::String;
use tinyvec::ArrayVec;

const MAX_SUBPACKET: u32 = SUBPACKET_MAX_SIZE as u32;

/// Worst-case framing overhead around one escaped subpacket: terminator pair
/// plus an escaped CRC-32.
const SUBPACKET_OVERHEAD: usize = 10;

/// Worst-case wire size of a binary ZDATA header.
const ZDATA_HEADER_OVERHEAD: usize = 24;

/// Stages of the send side, in protocol order. `Done` is absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderStage {
    /// Waiting for the peer's ZRINIT
    WaitReceiverInit,
    /// Session is up; no file in flight
    ReadyForFile,
    /// ZFILE sent, waiting for ZRPOS
    WaitFilePos,
    /// A `FileRequest` is published; waiting for `feed_file`
    NeedFileData,
    /// ZCRCW sent, waiting for the peer's ZACK
    WaitFileAck,
    /// ZEOF sent, waiting for the closing ZRINIT
    WaitFileDone,
    /// ZFIN sent, waiting for the echo
    WaitFinish,
    /// Session over
    Done,
}

/// A pull request for file bytes at `offset`. The caller answers with
/// `feed_file` carrying between 1 and `len` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileRequest {
    pub offset: u32,
    pub len: u32,
}

/// The sending state machine. Feed peer bytes with `feed_incoming`, drain
/// wire bytes with `drain_outgoing`, answer `poll_file` requests with
/// `feed_file`.
pub struct Sender {
    stage: SenderStage,
    headers: HeaderReader,
    out: OutBuffer,
    events: EventQueue,
    file_name: String<256>,
    file_size: u32,
    has_file: bool,
    pending: Option<FileRequest>,
    frame_remaining: u32,
    frame_needs_header: bool,
    max_subpacket_size: u32,
    max_subpackets_per_ack: u32,
    data_encoding: Encoding,
    finish_requested: bool,
}

impl Sender {
    /// Creates a new instance. An initiating sender opens with ZRQINIT; a
    /// non-initiating one stays quiet until the peer's ZRINIT arrives.
    #[must_use]
    pub fn new(initiator: bool) -> Self {
        let mut sender = Self {
            stage: SenderStage::WaitReceiverInit,
            headers: HeaderReader::new(),
            out: OutBuffer::new(),
            events: EventQueue::new(),
            file_name: String::new(),
            file_size: 0,
            has_file: false,
            pending: None,
            frame_remaining: 0,
            frame_needs_header: false,
            max_subpacket_size: MAX_SUBPACKET,
            max_subpackets_per_ack: SUBPACKET_PER_ACK,
            data_encoding: Encoding::ZBIN32,
            finish_requested: false,
        };
        if initiator {
            // A fixed ZHEX header always fits the empty queue.
            let _ = ZRQINIT_HEADER.encode(&mut sender.out);
        }
        sender
    }

    #[must_use]
    pub fn stage(&self) -> SenderStage {
        self.stage
    }

    /// Returns the outstanding file-byte request, if any.
    #[must_use]
    pub fn poll_file(&self) -> Option<FileRequest> {
        self.pending
    }

    /// Returns and consumes the next pending lifecycle event.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Returns the queued outgoing bytes and clears the queue. The caller is
    /// expected to write them to the peer before feeding further input.
    pub fn drain_outgoing(&mut self) -> OutBuffer {
        core::mem::take(&mut self.out)
    }

    /// Registers the file to transfer next.
    ///
    /// # Errors
    ///
    /// * `Err(Error::Unsupported)` outside `WaitReceiverInit` and
    ///   `ReadyForFile`
    /// * `Err(Error::MalformedFileName)` when the name does not fit
    pub fn start_file(&mut self, name: &str, size: u32) -> Result<(), Error> {
        if self.stage != SenderStage::WaitReceiverInit && self.stage != SenderStage::ReadyForFile {
            return Err(Error::Unsupported);
        }
        self.file_name = String::from_str(name).or(Err(Error::MalformedFileName))?;
        self.file_size = size;
        self.has_file = true;
        if self.stage == SenderStage::ReadyForFile && self.out.is_empty() {
            self.push_zfile()?;
            self.stage = SenderStage::WaitFilePos;
        }
        Ok(())
    }

    /// Requests the session to close once no file is in flight.
    ///
    /// # Errors
    ///
    /// * `Err(Error::MalformedHeader)` when the ZFIN header cannot be staged
    pub fn finish_session(&mut self) -> Result<(), Error> {
        self.finish_requested = true;
        if self.stage == SenderStage::ReadyForFile {
            self.push_header(&ZFIN_HEADER)?;
            self.stage = SenderStage::WaitFinish;
        }
        Ok(())
    }

    /// Parses headers out of `input` and advances the state machine,
    /// returning how many bytes were consumed. Stops early when outgoing
    /// bytes await draining, a file request awaits `feed_file`, or the
    /// session is over.
    ///
    /// # Errors
    ///
    /// Failures of the header reader and codec propagate unchanged; see
    /// `Error`.
    pub fn feed_incoming(&mut self, input: &[u8]) -> Result<usize, Error> {
        let mut consumed = 0;
        while consumed < input.len() {
            if !self.out.is_empty()
                || self.pending.is_some()
                || self.events.is_full()
                || self.stage == SenderStage::Done
            {
                break;
            }
            let (header, used) = self.headers.feed(&input[consumed..])?;
            consumed += used;
            if let Some(header) = header {
                self.handle_header(&header)?;
            }
        }
        Ok(consumed)
    }

    /// Answers the pending `FileRequest` with up to `request.len` bytes and
    /// stages the resulting ZDATA subpacket. The last subpacket of a window
    /// or of the file ends with ZCRCW, intermediate ones with ZCRCG.
    ///
    /// # Errors
    ///
    /// * `Err(Error::Unsupported)` when no request is pending
    /// * `Err(Error::UnexpectedEof)` when `data` is empty or longer than
    ///   the request allows
    /// * `Err(Error::OutOfMemory)` when the outgoing queue has not been
    ///   drained and cannot take another subpacket
    pub fn feed_file(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.stage != SenderStage::NeedFileData {
            return Err(Error::Unsupported);
        }
        let request = self.pending.ok_or(Error::Unsupported)?;
        let limit = request.len.min(self.file_size - request.offset);
        let len = u32::try_from(data.len()).or(Err(Error::UnexpectedEof))?;
        if len == 0 || len > limit {
            return Err(Error::UnexpectedEof);
        }
        let mut needed = escape::escaped_len(data) + SUBPACKET_OVERHEAD;
        if self.frame_needs_header {
            needed += ZDATA_HEADER_OVERHEAD;
        }
        if self.out.len() + needed > self.out.capacity() {
            return Err(Error::OutOfMemory);
        }
        if self.frame_needs_header {
            Header::new(self.data_encoding, Frame::ZDATA, &[0; 4])
                .with_count(request.offset)
                .encode(&mut self.out)?;
            self.frame_needs_header = false;
        }
        let next_offset = request.offset + len;
        self.frame_remaining -= 1;
        let kind = if next_offset >= self.file_size || self.frame_remaining == 0 {
            Packet::ZCRCW
        } else {
            Packet::ZCRCG
        };
        write_subpacket(&mut self.out, self.data_encoding, kind, data);
        log::debug!("subpacket out: {kind} at offset {}", request.offset);
        if kind == Packet::ZCRCW {
            self.pending = None;
            self.stage = SenderStage::WaitFileAck;
        } else {
            self.pending = Some(FileRequest {
                offset: next_offset,
                len: (self.file_size - next_offset).min(self.max_subpacket_size),
            });
        }
        Ok(())
    }

    fn handle_header(&mut self, header: &Header) -> Result<(), Error> {
        match header.frame() {
            Frame::ZRINIT => self.handle_zrinit(header),
            Frame::ZRPOS | Frame::ZACK => self.handle_position(header),
            Frame::ZFIN => {
                if self.stage == SenderStage::WaitFinish {
                    self.close_session();
                }
                Ok(())
            }
            _ => {
                if self.stage == SenderStage::WaitReceiverInit {
                    self.push_header(&ZRQINIT_HEADER)?;
                }
                Ok(())
            }
        }
    }

    fn handle_zrinit(&mut self, header: &Header) -> Result<(), Error> {
        let flags = header.flags();
        let caps = Zrinit::from_bits_truncate(flags[3]);
        let rx_buf_size = u32::from(u16::from_le_bytes([flags[0], flags[1]]));
        self.max_subpacket_size = if rx_buf_size == 0 {
            MAX_SUBPACKET
        } else {
            rx_buf_size.min(MAX_SUBPACKET)
        };
        self.max_subpackets_per_ack = if caps.contains(Zrinit::CANOVIO) {
            if rx_buf_size == 0 {
                SUBPACKET_PER_ACK
            } else {
                (rx_buf_size / self.max_subpacket_size).clamp(1, SUBPACKET_PER_ACK)
            }
        } else {
            1
        };
        self.data_encoding = if caps.contains(Zrinit::CANFC32) {
            Encoding::ZBIN32
        } else {
            Encoding::ZBIN
        };
        match self.stage {
            SenderStage::WaitReceiverInit => {
                if self.has_file {
                    self.push_zfile()?;
                    self.stage = SenderStage::WaitFilePos;
                } else if self.finish_requested {
                    self.push_header(&ZFIN_HEADER)?;
                    self.stage = SenderStage::WaitFinish;
                } else {
                    self.stage = SenderStage::ReadyForFile;
                }
            }
            SenderStage::WaitFileDone => {
                self.push_event(Event::FileComplete);
                self.has_file = false;
                if self.finish_requested {
                    self.push_header(&ZFIN_HEADER)?;
                    self.stage = SenderStage::WaitFinish;
                } else {
                    self.stage = SenderStage::ReadyForFile;
                }
            }
            SenderStage::WaitFinish => self.close_session(),
            _ => (),
        }
        Ok(())
    }

    fn handle_position(&mut self, header: &Header) -> Result<(), Error> {
        match self.stage {
            SenderStage::WaitReceiverInit => self.push_header(&ZRQINIT_HEADER),
            SenderStage::WaitFilePos | SenderStage::WaitFileAck | SenderStage::NeedFileData => {
                let offset = header.count();
                if offset >= self.file_size {
                    self.pending = None;
                    self.push_header(
                        &Header::new(self.data_encoding, Frame::ZEOF, &[0; 4]).with_count(offset),
                    )?;
                    self.stage = SenderStage::WaitFileDone;
                } else {
                    let remaining = self.file_size - offset;
                    self.frame_remaining = remaining
                        .div_ceil(self.max_subpacket_size)
                        .min(self.max_subpackets_per_ack);
                    self.frame_needs_header = true;
                    self.pending = Some(FileRequest {
                        offset,
                        len: remaining.min(self.max_subpacket_size),
                    });
                    self.stage = SenderStage::NeedFileData;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn close_session(&mut self) {
        self.out.extend_from_slice(b"OO");
        self.stage = SenderStage::Done;
        self.push_event(Event::SessionComplete);
        log::debug!("send: session closed");
    }

    fn push_zfile(&mut self) -> Result<(), Error> {
        let size = String::<17>::try_from(self.file_size).or(Err(Error::MalformedFileSize))?;
        let mut buf: ArrayVec<[u8; 512]> = ArrayVec::new();
        buf.extend_from_slice(self.file_name.as_bytes());
        buf.push(b'\0');
        buf.extend_from_slice(size.as_bytes());
        buf.push(b'\0');
        Header::new(self.data_encoding, Frame::ZFILE, &[0; 4]).encode(&mut self.out)?;
        write_subpacket(&mut self.out, self.data_encoding, Packet::ZCRCW, &buf);
        Ok(())
    }

    fn push_header(&mut self, header: &Header) -> Result<(), Error> {
        header.encode(&mut self.out)
    }

    fn push_event(&mut self, event: Event) {
        // feed_incoming stops before the queue can fill up
        let _ = self.events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{Sender, SenderStage};
    use crate::error::Error;
    use crate::{Event, ZDLE, ZPAD};

    #[test]
    fn test_initiator_opens_with_zrqinit() {
        let mut sender = Sender::new(true);
        let out = sender.drain_outgoing();
        assert_eq!(&out[..4], &[ZPAD, ZPAD, ZDLE, b'B']);
        assert!(sender.drain_outgoing().is_empty());
    }

    #[test]
    fn test_non_initiator_stays_quiet() {
        let mut sender = Sender::new(false);
        assert!(sender.drain_outgoing().is_empty());
        assert_eq!(sender.stage(), SenderStage::WaitReceiverInit);
    }

    #[test]
    fn test_start_file_rejected_mid_transfer() {
        let mut sender = Sender::new(true);
        sender.start_file("a.bin", 10).unwrap();
        // Still waiting for ZRINIT; a second registration is fine ...
        sender.start_file("b.bin", 20).unwrap();
        // ... but not once the session has moved on.
        sender.stage = SenderStage::WaitFilePos;
        assert_eq!(sender.start_file("c.bin", 30), Err(Error::Unsupported));
    }

    #[test]
    fn test_feed_file_without_request() {
        let mut sender = Sender::new(false);
        assert_eq!(sender.feed_file(b"data"), Err(Error::Unsupported));
    }

    #[test]
    fn test_poll_event_consumes() {
        let mut sender = Sender::new(false);
        sender.push_event(Event::FileComplete);
        assert_eq!(sender.poll_event(), Some(Event::FileComplete));
        assert_eq!(sender.poll_event(), None);
    }
}
