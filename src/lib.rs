// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transport-agnostic state machines for the ZMODEM file transfer protocol.
//! `zmcore::Sender` and `zmcore::Receiver` implement the wire-level rules of
//! ZMODEM (framing, ZDLE escaping, CRC-16/CRC-32 checksums, subpacket
//! windowing and the handshake state diagram) as pure data pumps. Neither
//! machine performs I/O: the caller feeds bytes that arrived from the peer,
//! drains bytes to be written to the peer, and moves file data through
//! separate channels.
//!
//! The usage can be described in the high-level with the following flow:
//!
//! 1. Create a `zmcore::Sender` or a `zmcore::Receiver`.
//! 2. Write everything `drain_outgoing` returns to the peer.
//! 3. Pass bytes read from the peer to `feed_incoming`.
//! 4. Service `poll_file`/`feed_file` (sending) or `drain_file` (receiving)
//!    and `poll_event`, then go back to step 2 until `SessionComplete`.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![cfg_attr(not(feature = "std"), no_std)]

mod crc;
mod error;
mod escape;
mod header;
mod recv;
mod send;
mod subpacket;

pub use crate::crc::{crc16, crc32, Crc16, Crc32};
pub use crate::error::Error;
pub use crate::header::{Encoding, Frame, Header, Zrinit};
pub use crate::recv::{Receiver, ReceiverStage};
pub use crate::send::{FileRequest, Sender, SenderStage};
pub use crate::subpacket::Packet;

use tinyvec::ArrayVec;

/// Size of the unescaped subpacket payload. The size was picked based on
/// maximum subpacket size in the original 1988 ZMODEM specification.
pub const SUBPACKET_MAX_SIZE: usize = 1024;

/// The number of subpackets to stream before soliciting an ACK.
pub const SUBPACKET_PER_ACK: u32 = 10;

/// Capacity of the outgoing byte queue. Sized for a fully escaped subpacket
/// plus its framing with room to spare.
const OUT_BUFFER_SIZE: usize = 4096;

/// Capacity of the pending-event queue.
const EVENT_QUEUE_DEPTH: usize = 4;

pub(crate) const ZPAD: u8 = b'*';
pub(crate) const ZDLE: u8 = 0x18;
pub(crate) const XON: u8 = 0x11;

/// Staging for a single unescaped subpacket payload. `drain_file` returns
/// it by value.
pub type Buffer = ArrayVec<[u8; SUBPACKET_MAX_SIZE]>;

/// Queue of bytes waiting to be written to the peer. `drain_outgoing`
/// returns it by value and leaves an empty queue behind.
pub type OutBuffer = ArrayVec<[u8; OUT_BUFFER_SIZE]>;

pub(crate) type EventQueue = heapless::Deque<Event, EVENT_QUEUE_DEPTH>;

/// Lifecycle notifications polled with `poll_event`. `FileStart` is only
/// produced by a `Receiver`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// File metadata has been accepted; name and size are available.
    FileStart,
    /// The current file has been fully transferred and acknowledged.
    FileComplete,
    /// The session has ended; the machine is in its terminal state.
    SessionComplete,
}
