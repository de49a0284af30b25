// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory loopback transfers between a `Sender` and a `Receiver`.

use zmcore::{
    Encoding, Event, Frame, Header, OutBuffer, Receiver, ReceiverStage, Sender, SenderStage,
    Zrinit,
};

const ZPAD: u8 = 0x2a;
const ZDLE: u8 = 0x18;

fn header_wire(header: &Header) -> OutBuffer {
    let mut out = OutBuffer::new();
    header.encode(&mut out).unwrap();
    out
}

fn zrinit_wire(buf_size: u16, caps: Zrinit) -> OutBuffer {
    let size = buf_size.to_le_bytes();
    header_wire(&Header::new(
        Encoding::ZHEX,
        Frame::ZRINIT,
        &[size[0], size[1], 0, caps.bits()],
    ))
}

/// Shuttles bytes, file data and events between the two machines until
/// `done` holds, feeding at most `mtu` bytes per call to exercise
/// resumption.
#[allow(clippy::too_many_arguments)]
fn pump_until<F>(
    sender: &mut Sender,
    receiver: &mut Receiver,
    data: &[u8],
    received: &mut Vec<u8>,
    sender_events: &mut Vec<Event>,
    receiver_events: &mut Vec<Event>,
    mtu: usize,
    mut done: F,
) where
    F: FnMut(&Sender, &Receiver) -> bool,
{
    let mut to_sender: Vec<u8> = Vec::new();
    let mut to_receiver: Vec<u8> = Vec::new();
    for _ in 0..100_000 {
        if done(sender, receiver) {
            return;
        }
        to_receiver.extend_from_slice(&sender.drain_outgoing());
        to_sender.extend_from_slice(&receiver.drain_outgoing());

        if let Some(request) = sender.poll_file() {
            let offset = request.offset as usize;
            let end = offset + request.len as usize;
            sender.feed_file(&data[offset..end]).unwrap();
            continue;
        }

        received.extend_from_slice(&receiver.drain_file());

        if !to_sender.is_empty() {
            let len = to_sender.len().min(mtu);
            let consumed = sender.feed_incoming(&to_sender[..len]).unwrap();
            to_sender.drain(..consumed);
        }
        if !to_receiver.is_empty() {
            let len = to_receiver.len().min(mtu);
            let consumed = receiver.feed_incoming(&to_receiver[..len]).unwrap();
            to_receiver.drain(..consumed);
        }

        while let Some(event) = sender.poll_event() {
            sender_events.push(event);
        }
        while let Some(event) = receiver.poll_event() {
            receiver_events.push(event);
        }
    }
    panic!("transfer did not converge");
}

fn session_over(sender: &Sender, receiver: &Receiver) -> bool {
    sender.stage() == SenderStage::Done && receiver.stage() == ReceiverStage::SessionEnd
}

#[test]
fn test_handshake() {
    let mut sender = Sender::new(true);
    let mut receiver = Receiver::new();

    let greeting = sender.drain_outgoing();
    assert_eq!(&greeting[..4], &[ZPAD, ZPAD, ZDLE, b'B']);

    let advert = receiver.drain_outgoing();
    assert_eq!(&advert[..4], &[ZPAD, ZPAD, ZDLE, b'B']);

    receiver.feed_incoming(&greeting).unwrap();
    let reply = receiver.drain_outgoing();
    assert_eq!(&reply[..4], &[ZPAD, ZPAD, ZDLE, b'B']);

    sender.feed_incoming(&advert).unwrap();
    assert_eq!(sender.stage(), SenderStage::ReadyForFile);
}

#[test]
fn test_sender_publishes_file_request_on_zrpos() {
    let mut sender = Sender::new(true);
    sender.drain_outgoing();
    sender
        .feed_incoming(&zrinit_wire(1024, Zrinit::CANFDX | Zrinit::CANFC32))
        .unwrap();
    assert_eq!(sender.stage(), SenderStage::ReadyForFile);

    sender.start_file("test.txt", 100).unwrap();
    assert_eq!(sender.stage(), SenderStage::WaitFilePos);
    let zfile = sender.drain_outgoing();
    assert!(!zfile.is_empty());

    sender
        .feed_incoming(&header_wire(
            &Header::new(Encoding::ZHEX, Frame::ZRPOS, &[0; 4]).with_count(0),
        ))
        .unwrap();
    let request = sender.poll_file().unwrap();
    assert_eq!(request.offset, 0);
    assert!(request.len > 0);
}

#[test]
fn test_sender_delivers_data_then_terminates() {
    let mut sender = Sender::new(true);
    sender.drain_outgoing();
    sender
        .feed_incoming(&zrinit_wire(1024, Zrinit::CANFDX | Zrinit::CANFC32))
        .unwrap();
    sender.start_file("test.txt", 100).unwrap();
    sender.drain_outgoing();
    sender
        .feed_incoming(&header_wire(
            &Header::new(Encoding::ZHEX, Frame::ZRPOS, &[0; 4]).with_count(0),
        ))
        .unwrap();

    let request = sender.poll_file().unwrap();
    sender.feed_file(&vec![0x41; request.len as usize]).unwrap();
    assert_eq!(sender.stage(), SenderStage::WaitFileAck);
    let zdata = sender.drain_outgoing();
    assert!(!zdata.is_empty());

    sender
        .feed_incoming(&header_wire(
            &Header::new(Encoding::ZHEX, Frame::ZACK, &[0; 4]).with_count(100),
        ))
        .unwrap();
    assert_eq!(sender.stage(), SenderStage::WaitFileDone);
    sender.drain_outgoing();

    sender
        .feed_incoming(&zrinit_wire(1024, Zrinit::CANFDX | Zrinit::CANFC32))
        .unwrap();
    assert_eq!(sender.poll_event(), Some(Event::FileComplete));
    assert_eq!(sender.stage(), SenderStage::ReadyForFile);

    sender.finish_session().unwrap();
    assert_eq!(sender.stage(), SenderStage::WaitFinish);
    sender.drain_outgoing();

    sender
        .feed_incoming(&header_wire(&Header::new(
            Encoding::ZHEX,
            Frame::ZFIN,
            &[0; 4],
        )))
        .unwrap();
    let closing = sender.drain_outgoing();
    assert_eq!(&closing[closing.len() - 2..], b"OO");
    assert_eq!(sender.poll_event(), Some(Event::SessionComplete));
    assert_eq!(sender.stage(), SenderStage::Done);
}

#[test]
fn test_receiver_announces_file_metadata() {
    // A sender produces the ZFILE frame the receiver is fed.
    let mut sender = Sender::new(true);
    sender.drain_outgoing();
    sender.start_file("hello.bin", 100).unwrap();
    sender
        .feed_incoming(&zrinit_wire(1024, Zrinit::CANFDX | Zrinit::CANFC32))
        .unwrap();
    let zfile = sender.drain_outgoing();

    let mut receiver = Receiver::new();
    receiver.drain_outgoing();
    receiver.feed_incoming(&zfile).unwrap();
    assert_eq!(receiver.poll_event(), Some(Event::FileStart));
    assert_eq!(receiver.file_name(), b"hello.bin");
    assert_eq!(receiver.file_size(), 100);
    // The response requests data from offset zero.
    let zrpos = receiver.drain_outgoing();
    assert_eq!(&zrpos[..4], &[ZPAD, ZPAD, ZDLE, b'B']);
}

#[test]
fn test_receiver_rejects_corrupted_subpacket() {
    let mut sender = Sender::new(true);
    sender.drain_outgoing();
    sender.start_file("hello.bin", 100).unwrap();
    sender
        .feed_incoming(&zrinit_wire(1024, Zrinit::CANFDX | Zrinit::CANFC32))
        .unwrap();
    let zfile = sender.drain_outgoing();
    sender
        .feed_incoming(&header_wire(
            &Header::new(Encoding::ZHEX, Frame::ZRPOS, &[0; 4]).with_count(0),
        ))
        .unwrap();
    sender.feed_file(&[0x41; 100]).unwrap();
    let mut zdata = sender.drain_outgoing();

    let mut receiver = Receiver::new();
    receiver.drain_outgoing();
    receiver.feed_incoming(&zfile).unwrap();
    receiver.drain_outgoing();
    receiver.poll_event();

    // Flip one bit inside the run of payload bytes.
    let pos = zdata
        .windows(8)
        .position(|w| w == [0x41; 8])
        .expect("payload run not found")
        + 4;
    zdata[pos] ^= 1;
    assert_eq!(
        receiver.feed_incoming(&zdata).unwrap_err(),
        zmcore::Error::UnexpectedCrc32
    );
    assert_eq!(receiver.count(), 0);
}

#[test]
fn test_crc16_fallback_without_canfc32() {
    // A peer that cannot do 32-bit frame checks gets ZBIN (CRC-16) framing
    // for ZFILE, ZDATA and ZEOF.
    let mut sender = Sender::new(true);
    sender.drain_outgoing();
    sender
        .feed_incoming(&zrinit_wire(1024, Zrinit::CANFDX))
        .unwrap();
    sender.start_file("legacy.bin", 64).unwrap();
    let zfile = sender.drain_outgoing();
    // ZBIN framing: single ZPAD, encoding byte 'A'
    assert_eq!(&zfile[..3], &[ZPAD, ZDLE, b'A']);

    sender
        .feed_incoming(&header_wire(
            &Header::new(Encoding::ZHEX, Frame::ZRPOS, &[0; 4]).with_count(0),
        ))
        .unwrap();
    let data: Vec<u8> = (0..64_u8).collect();
    sender.feed_file(&data).unwrap();
    let zdata = sender.drain_outgoing();
    assert_eq!(&zdata[..3], &[ZPAD, ZDLE, b'A']);

    // A receiver latches CRC-16 from the ZBIN headers and accepts both the
    // metadata subpacket and the data subpacket.
    let mut receiver = Receiver::new();
    receiver.drain_outgoing();
    receiver.feed_incoming(&zfile).unwrap();
    assert_eq!(receiver.poll_event(), Some(Event::FileStart));
    assert_eq!(receiver.file_name(), b"legacy.bin");
    receiver.drain_outgoing();
    receiver.feed_incoming(&zdata).unwrap();
    assert_eq!(&receiver.drain_file()[..], &data[..]);
    assert_eq!(receiver.count(), 64);

    // The rest of the exchange (ZACK, ZBIN ZEOF, ZFIN) closes cleanly.
    sender.finish_session().unwrap();
    let mut received = Vec::new();
    let mut sender_events = Vec::new();
    let mut receiver_events = Vec::new();
    pump_until(
        &mut sender,
        &mut receiver,
        &data,
        &mut received,
        &mut sender_events,
        &mut receiver_events,
        usize::MAX,
        session_over,
    );
    assert!(received.is_empty());
    assert_eq!(sender_events, [Event::FileComplete, Event::SessionComplete]);
    assert_eq!(receiver_events, [Event::FileComplete, Event::SessionComplete]);
}

#[test]
fn test_single_file_transfer() {
    let data: Vec<u8> = (0..100_usize).map(|i| (i * 7) as u8).collect();
    let mut sender = Sender::new(true);
    let mut receiver = Receiver::new();
    sender.start_file("test.bin", data.len() as u32).unwrap();
    sender.finish_session().unwrap();

    let mut received = Vec::new();
    let mut sender_events = Vec::new();
    let mut receiver_events = Vec::new();
    pump_until(
        &mut sender,
        &mut receiver,
        &data,
        &mut received,
        &mut sender_events,
        &mut receiver_events,
        usize::MAX,
        session_over,
    );

    assert_eq!(received, data);
    assert_eq!(sender_events, [Event::FileComplete, Event::SessionComplete]);
    assert_eq!(
        receiver_events,
        [Event::FileStart, Event::FileComplete, Event::SessionComplete]
    );
    assert_eq!(receiver.file_name(), b"test.bin");
}

#[test]
fn test_transfer_survives_fragmentation() {
    let data: Vec<u8> = (0..4096_usize).map(|i| (i * 31 + 7) as u8).collect();
    for mtu in [1, 7, 999] {
        let mut sender = Sender::new(true);
        let mut receiver = Receiver::new();
        sender.start_file("frag.bin", data.len() as u32).unwrap();
        sender.finish_session().unwrap();

        let mut received = Vec::new();
        let mut sender_events = Vec::new();
        let mut receiver_events = Vec::new();
        pump_until(
            &mut sender,
            &mut receiver,
            &data,
            &mut received,
            &mut sender_events,
            &mut receiver_events,
            mtu,
            session_over,
        );
        assert_eq!(received, data, "mtu {mtu}");
    }
}

#[test]
fn test_empty_file_transfer() {
    let mut sender = Sender::new(true);
    let mut receiver = Receiver::new();
    sender.start_file("empty", 0).unwrap();
    sender.finish_session().unwrap();

    let mut received = Vec::new();
    let mut sender_events = Vec::new();
    let mut receiver_events = Vec::new();
    pump_until(
        &mut sender,
        &mut receiver,
        &[],
        &mut received,
        &mut sender_events,
        &mut receiver_events,
        usize::MAX,
        session_over,
    );
    assert!(received.is_empty());
    assert_eq!(receiver.file_size(), 0);
    assert_eq!(sender_events, [Event::FileComplete, Event::SessionComplete]);
}

#[test]
fn test_two_file_batch() {
    let alpha: Vec<u8> = (0..2000_usize).map(|i| (i % 251) as u8).collect();
    let beta: Vec<u8> = (0..500_usize).map(|i| (i % 13) as u8).collect();

    let mut sender = Sender::new(true);
    let mut receiver = Receiver::new();
    sender.start_file("alpha.bin", alpha.len() as u32).unwrap();

    let mut received = Vec::new();
    let mut sender_events = Vec::new();
    let mut receiver_events = Vec::new();
    // `ReadyForFile` is first reached once alpha completes: the file was
    // registered before the handshake.
    pump_until(
        &mut sender,
        &mut receiver,
        &alpha,
        &mut received,
        &mut sender_events,
        &mut receiver_events,
        usize::MAX,
        |s, _| s.stage() == SenderStage::ReadyForFile,
    );
    assert_eq!(received, alpha);
    assert_eq!(receiver.file_name(), b"alpha.bin");

    sender.start_file("beta.bin", beta.len() as u32).unwrap();
    sender.finish_session().unwrap();
    let mut received_beta = Vec::new();
    pump_until(
        &mut sender,
        &mut receiver,
        &beta,
        &mut received_beta,
        &mut sender_events,
        &mut receiver_events,
        usize::MAX,
        session_over,
    );
    assert_eq!(received_beta, beta);
    assert_eq!(receiver.file_name(), b"beta.bin");
    assert_eq!(
        sender_events,
        [
            Event::FileComplete,
            Event::FileComplete,
            Event::SessionComplete
        ]
    );
    assert_eq!(
        receiver_events,
        [
            Event::FileStart,
            Event::FileComplete,
            Event::FileStart,
            Event::FileComplete,
            Event::SessionComplete
        ]
    );
}

#[test]
fn test_streaming_window_uses_zcrcg() {
    let data: Vec<u8> = (0..10_000_usize).map(|i| (i * 7) as u8).collect();
    let mut sender = Sender::new(false);
    sender.start_file("big.bin", data.len() as u32).unwrap();
    sender.finish_session().unwrap();
    // A streaming advert (no buffer bound, overlapped I/O) keeps the window
    // at the full ten subpackets per ACK.
    sender
        .feed_incoming(&zrinit_wire(
            0,
            Zrinit::CANFDX | Zrinit::CANOVIO | Zrinit::CANFC32,
        ))
        .unwrap();

    let mut receiver = Receiver::new();
    // Dropped so the streaming window negotiated above stays in effect.
    receiver.drain_outgoing();

    let mut received = Vec::new();
    let mut sender_events = Vec::new();
    let mut receiver_events = Vec::new();
    pump_until(
        &mut sender,
        &mut receiver,
        &data,
        &mut received,
        &mut sender_events,
        &mut receiver_events,
        usize::MAX,
        session_over,
    );
    assert_eq!(received, data);
    assert_eq!(
        receiver_events,
        [Event::FileStart, Event::FileComplete, Event::SessionComplete]
    );
}

#[test]
fn test_garbage_is_skipped_identically() {
    // Deterministic pseudo-random noise with ZPAD and ZDLE stripped so no
    // header preamble can form.
    let mut noise = Vec::new();
    let mut x: u32 = 0x2468_ace1;
    while noise.len() < 64 * 1024 {
        x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let b = (x >> 24) as u8;
        if b != ZPAD && b != ZDLE {
            noise.push(b);
        }
    }

    let mut totals = Vec::new();
    for chunk_size in [1_usize, 7, 999, noise.len()] {
        let mut receiver = Receiver::new();
        let initial = receiver.drain_outgoing();
        assert_eq!(&initial[..4], &[ZPAD, ZPAD, ZDLE, b'B']);

        let mut total = 0;
        for chunk in noise.chunks(chunk_size) {
            total += receiver.feed_incoming(chunk).unwrap();
        }
        totals.push(total);
        assert!(receiver.drain_file().is_empty());
        assert_eq!(receiver.poll_event(), None);
        // The initial ZRINIT is not re-queued by noise.
        assert!(receiver.drain_outgoing().is_empty());
        assert_eq!(receiver.stage(), ReceiverStage::SessionBegin);
    }
    assert!(totals.iter().all(|t| *t == noise.len()));
}
