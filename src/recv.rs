// SPDX-License-Identifier: MIT OR Apache-2.0
//! Receive side of the transfer: ZRINIT advertisement, ZFILE metadata,
//! subpacketed data with per-terminator acking, ZEOF and ZFIN recognition.

use crate::error::Error;
use crate::header::{
    Encoding, Frame, Header, HeaderReader, Zrinit, ZACK_HEADER, ZFIN_HEADER, ZRPOS_HEADER,
};
use crate::subpacket::{Packet, SubpacketReader, SubpacketState};
use crate::{Buffer, Event, EventQueue, OutBuffer, SUBPACKET_MAX_SIZE};
use core::str::FromStr;

/// Stages of the receive side. `SessionEnd` is absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverStage {
    /// ZRINIT advertised, waiting for the session to open
    SessionBegin,
    /// Between files: waiting for ZFILE, ZDATA or ZFIN
    FileBegin,
    /// Reading the ZFILE metadata subpacket
    FileReadingMetadata,
    /// Reading data subpackets within a ZDATA frame
    FileReadingSubpacket,
    /// Between frames: waiting for the next ZDATA, ZEOF or ZFIN
    FileWaitingSubpacket,
    /// Session over
    SessionEnd,
}

/// The receiving state machine. Feed peer bytes with `feed_incoming`, drain
/// wire bytes with `drain_outgoing` and validated file bytes with
/// `drain_file`.
pub struct Receiver {
    stage: ReceiverStage,
    headers: HeaderReader,
    sub: SubpacketReader,
    out: OutBuffer,
    events: EventQueue,
    count: u32,
    file_name: heapless::Vec<u8, 256>,
    file_size: u32,
    file_drained: usize,
}

impl Receiver {
    /// Creates a new instance with the opening ZRINIT already queued.
    #[must_use]
    pub fn new() -> Self {
        let mut receiver = Self {
            stage: ReceiverStage::SessionBegin,
            headers: HeaderReader::new(),
            sub: SubpacketReader::new(),
            out: OutBuffer::new(),
            events: EventQueue::new(),
            count: 0,
            file_name: heapless::Vec::new(),
            file_size: 0,
            file_drained: 0,
        };
        // A fixed ZHEX header always fits the empty queue.
        let _ = receiver.push_zrinit();
        receiver
    }

    #[must_use]
    pub fn stage(&self) -> ReceiverStage {
        self.stage
    }

    /// Number of validated file bytes delivered to the caller for the
    /// current file.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Name of the current file as raw bytes. ZMODEM peers are not required
    /// to send UTF-8, so no decoding is applied.
    #[must_use]
    pub fn file_name(&self) -> &[u8] {
        &self.file_name
    }

    #[must_use]
    pub fn file_size(&self) -> u32 {
        self.file_size
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

    /// Returns the parked subpacket payload and releases it, letting the
    /// next `feed_incoming` continue past the drained subpacket.
    pub fn drain_file(&mut self) -> Buffer {
        let mut data = Buffer::new();
        if self.sub.state() == SubpacketState::Writing {
            data.extend_from_slice(&self.sub.payload()[self.file_drained..]);
            self.finish_subpacket();
        }
        data
    }

    /// Records that the caller consumed `n` bytes of the parked payload.
    /// Once the whole payload is consumed the subpacket is released.
    ///
    /// # Errors
    ///
    /// * `Err(Error::Unsupported)` when no payload is parked or `n` exceeds
    ///   what remains
    pub fn advance_file(&mut self, n: usize) -> Result<(), Error> {
        if self.sub.state() != SubpacketState::Writing {
            return Err(Error::Unsupported);
        }
        let len = self.sub.payload().len();
        if self.file_drained + n > len {
            return Err(Error::Unsupported);
        }
        self.file_drained += n;
        if self.file_drained == len {
            self.finish_subpacket();
        }
        Ok(())
    }

    /// Alternates between header parsing and subpacket parsing according to
    /// the current stage, returning how many bytes were consumed. Stops
    /// early when outgoing bytes await draining, file data awaits
    /// `drain_file`, or the event queue is full.
    ///
    /// # Errors
    ///
    /// Failures of the header and subpacket readers propagate unchanged;
    /// see `Error`.
    pub fn feed_incoming(&mut self, input: &[u8]) -> Result<usize, Error> {
        let mut consumed = 0;
        while consumed < input.len() {
            if !self.out.is_empty()
                || self.events.is_full()
                || self.stage == ReceiverStage::SessionEnd
            {
                break;
            }
            match self.stage {
                ReceiverStage::SessionBegin
                | ReceiverStage::FileBegin
                | ReceiverStage::FileWaitingSubpacket => {
                    let (header, used) = self.headers.feed(&input[consumed..])?;
                    consumed += used;
                    if let Some(header) = header {
                        self.handle_header(&header)?;
                    }
                }
                ReceiverStage::FileReadingMetadata | ReceiverStage::FileReadingSubpacket => {
                    if self.sub.state() == SubpacketState::Writing {
                        break;
                    }
                    let (packet, used) = self.sub.feed(&input[consumed..])?;
                    consumed += used;
                    if packet.is_some() {
                        if self.stage == ReceiverStage::FileReadingMetadata {
                            self.accept_metadata()?;
                        }
                        // Data subpackets stay parked until drained.
                    } else if used == 0 {
                        break;
                    }
                }
                ReceiverStage::SessionEnd => break,
            }
        }
        Ok(consumed)
    }

    fn handle_header(&mut self, header: &Header) -> Result<(), Error> {
        match header.frame() {
            Frame::ZRQINIT => {
                if self.stage == ReceiverStage::SessionBegin {
                    self.push_zrinit()?;
                }
            }
            Frame::ZFILE => {
                if matches!(
                    self.stage,
                    ReceiverStage::SessionBegin | ReceiverStage::FileBegin
                ) {
                    // The header encoding decides the CRC width of the
                    // metadata subpacket and of the ZDATA subpackets after
                    // it.
                    self.sub.start(header.encoding());
                    self.file_drained = 0;
                    self.stage = ReceiverStage::FileReadingMetadata;
                }
            }
            Frame::ZDATA => match self.stage {
                ReceiverStage::SessionBegin => self.push_zrinit()?,
                ReceiverStage::FileBegin | ReceiverStage::FileWaitingSubpacket => {
                    if header.count() == self.count {
                        self.sub.start(header.encoding());
                        self.file_drained = 0;
                        self.stage = ReceiverStage::FileReadingSubpacket;
                    } else {
                        log::error!(
                            "ZDATA offset mismatch: frame({}) != recv({})",
                            header.count(),
                            self.count
                        );
                        self.push_header(&ZRPOS_HEADER.with_count(self.count))?;
                    }
                }
                _ => (),
            },
            Frame::ZEOF => {
                // `FileBegin` is reachable here with an empty file: no ZDATA
                // ever arrives, the ZEOF comes straight after the metadata.
                if matches!(
                    self.stage,
                    ReceiverStage::FileWaitingSubpacket | ReceiverStage::FileBegin
                ) {
                    if header.count() == self.count {
                        self.push_zrinit()?;
                        self.stage = ReceiverStage::FileBegin;
                        self.push_event(Event::FileComplete);
                    } else {
                        // A fresh ZDATA for the missing range is coming.
                        log::error!(
                            "ZEOF offset mismatch: frame({}) != recv({})",
                            header.count(),
                            self.count
                        );
                    }
                }
            }
            Frame::ZFIN => {
                if matches!(
                    self.stage,
                    ReceiverStage::SessionBegin
                        | ReceiverStage::FileBegin
                        | ReceiverStage::FileWaitingSubpacket
                ) {
                    self.push_header(&ZFIN_HEADER)?;
                    self.stage = ReceiverStage::SessionEnd;
                    self.push_event(Event::SessionComplete);
                    log::debug!("recv: session closed");
                }
            }
            _ => (),
        }
        Ok(())
    }

    /// Completion hook for the ZFILE metadata subpacket: parse the fields,
    /// request data from offset zero and announce the file.
    fn accept_metadata(&mut self) -> Result<(), Error> {
        self.parse_zfile()?;
        self.sub.finish();
        self.count = 0;
        self.stage = ReceiverStage::FileBegin;
        self.push_header(&ZRPOS_HEADER.with_count(self.count))?;
        self.push_event(Event::FileStart);
        log::debug!("recv: file of {} bytes announced", self.file_size);
        Ok(())
    }

    /// The ZFILE payload is a run of null-terminated fields: the name, then
    /// a decimal size optionally followed by space-separated attributes.
    fn parse_zfile(&mut self) -> Result<(), Error> {
        let payload = self.sub.payload();
        let mut fields = payload.split(|b| *b == b'\0');
        let name = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or(Error::MalformedFileName)?;
        self.file_name = heapless::Vec::from_slice(name).or(Err(Error::MalformedFileName))?;
        let info = fields.next().ok_or(Error::MalformedFileSize)?;
        let size = info
            .split(|b| *b == b' ')
            .next()
            .ok_or(Error::MalformedFileSize)?;
        let size = core::str::from_utf8(size).or(Err(Error::MalformedFileSize))?;
        self.file_size = u32::from_str(size).or(Err(Error::MalformedFileSize))?;
        Ok(())
    }

    /// Releases the drained subpacket: advance `count`, ack according to
    /// the terminator and leave the reader ready for what follows.
    fn finish_subpacket(&mut self) {
        self.file_drained = 0;
        let payload_len = self.sub.payload().len() as u32;
        let terminator = self.sub.finish();
        self.count += payload_len;
        match terminator {
            Some(Packet::ZCRCW) => {
                self.push_ack();
                self.stage = ReceiverStage::FileWaitingSubpacket;
            }
            Some(Packet::ZCRCQ) => self.push_ack(),
            Some(Packet::ZCRCG) => (),
            Some(Packet::ZCRCE) | None => {
                self.stage = ReceiverStage::FileWaitingSubpacket;
            }
        }
    }

    fn push_ack(&mut self) {
        // A fixed ZHEX header always fits: the queue was drained before the
        // subpacket could be released.
        let _ = self.push_header(&ZACK_HEADER.with_count(self.count));
    }

    fn push_zrinit(&mut self) -> Result<(), Error> {
        let zrinit = Zrinit::CANFDX | Zrinit::CANFC32;
        let size = (SUBPACKET_MAX_SIZE as u16).to_le_bytes();
        self.push_header(&Header::new(
            Encoding::ZHEX,
            Frame::ZRINIT,
            &[size[0], size[1], 0, zrinit.bits()],
        ))
    }

    fn push_header(&mut self, header: &Header) -> Result<(), Error> {
        header.encode(&mut self.out)
    }

    fn push_event(&mut self, event: Event) {
        // feed_incoming stops before the queue can fill up
        let _ = self.events.push_back(event);
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}
