//! Per connection command handling.
//!
//! Each transport owns one [`Session`]: a parser and an ACK buffer that are
//! never shared. Replies and streamed frames that go out over the same
//! connection are serialized through a [`SharedWriter`].

use crate::capture::{FrameSink, PollState, CAPTURE_CONTINUOUS, CAPTURE_START};
use crate::checksum::FrameChecksum;
use crate::dispatcher::Dispatcher;
use crate::error::FrameError;
use crate::lock;
use crate::parser::FrameParser;
use crate::protocol::RegisterAddress;
use log::*;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Size of one read from the transport. Larger than a frame, so oversized
/// input reaches the parser and is truncated there.
pub const RECEIVE_BUFFER_LEN: usize = 1024;

#[derive(Debug, Default)]
pub struct Session {
    parser: FrameParser,
    ack: Vec<u8>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one received chunk and returns the reply to send, if any.
    pub fn receive<C: FrameChecksum>(
        &mut self,
        chunk: &[u8],
        dispatcher: &Dispatcher<C>,
    ) -> Option<&[u8]> {
        self.ack.clear();
        match self.parser.feed(chunk).into_frame() {
            Ok(Some(frame)) => {
                let len = dispatcher.commit(&frame, &mut self.ack);
                (len > 0).then(|| &self.ack[..len])
            }
            Ok(None) => None,
            Err(error @ FrameError::ChecksumMismatch { .. }) => {
                debug!("Frame not dispatched: {error}");
                None
            }
            Err(error) => {
                trace!("{error}");
                None
            }
        }
    }

    /// Drops any partially received frame, for example after a disconnect.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.ack.clear();
    }
}

/// A writer shared by every producer of one connection.
#[derive(Debug)]
pub struct SharedWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for SharedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: Write> SharedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Writes `bytes` as one unit with respect to the other producers.
    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.lock();
        writer.write_all(bytes)?;
        writer.flush()
    }

    pub fn lock(&self) -> MutexGuard<'_, W> {
        lock(&self.inner)
    }
}

/// Serializes a raw sensor buffer as little endian words.
pub fn encode_raw_frame(raw: &[u16]) -> Vec<u8> {
    raw.iter().flat_map(|word| word.to_le_bytes()).collect()
}

/// The frame streaming endpoint. While a writer is attached the streaming
/// session is active and `POLL` is rejected on the other transports.
pub struct FrameStream<W> {
    writer: Mutex<Option<SharedWriter<W>>>,
    poll: Arc<PollState>,
}

impl<W: Write + Send> FrameStream<W> {
    pub fn new(poll: Arc<PollState>) -> Self {
        Self {
            writer: Mutex::new(None),
            poll,
        }
    }

    pub fn attach(&self, writer: SharedWriter<W>) {
        *lock(&self.writer) = Some(writer);
        self.poll.set_streaming(true);
        info!("Frame streaming started");
    }

    pub fn detach(&self) {
        if lock(&self.writer).take().is_some() {
            self.poll.set_streaming(false);
            info!("Frame streaming stopped");
        }
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.writer).is_some()
    }
}

impl<W: Write + Send> FrameSink for FrameStream<W> {
    fn send_frame(&self, raw: &[u16]) {
        let writer = lock(&self.writer).clone();
        let Some(writer) = writer else {
            return;
        };
        if let Err(error) = writer.write_all(&encode_raw_frame(raw)) {
            warn!("Frame client lost: {error}");
            self.detach();
        }
    }
}

/// Serves commands received from `reader` until the peer disconnects.
///
/// Replies are written through `writer`. The session is reset when the
/// connection ends, whatever the reason.
pub fn serve_connection<R, W, C>(
    mut reader: R,
    writer: &SharedWriter<W>,
    dispatcher: &Dispatcher<C>,
) -> io::Result<()>
where
    R: Read,
    W: Write,
    C: FrameChecksum,
{
    let mut session = Session::new();
    let mut buffer = [0u8; RECEIVE_BUFFER_LEN];
    let result = loop {
        let received = match reader.read(&mut buffer) {
            Ok(0) => break Ok(()),
            Ok(received) => received,
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(error) => break Err(error),
        };
        trace!("Received {received} bytes");
        if let Some(reply) = session.receive(&buffer[..received], dispatcher) {
            if let Err(error) = writer.write_all(reply) {
                break Err(error);
            }
        }
    };
    session.reset();
    result
}

/// Serves a client of the frame port.
///
/// Attaching the client starts continuous capture, and every frame is written
/// through `writer`. Commands received on `reader` are answered through the
/// same writer, so replies never split a frame. Capture stops and the stream
/// detaches when the client goes away.
pub fn serve_frame_client<R, W, C>(
    reader: R,
    writer: SharedWriter<W>,
    stream: &FrameStream<W>,
    dispatcher: &Dispatcher<C>,
) -> io::Result<()>
where
    R: Read,
    W: Write + Send,
    C: FrameChecksum,
{
    let capture_control = RegisterAddress::new(RegisterAddress::CAPTURE_CONTROL);
    stream.attach(writer.clone());
    dispatcher
        .broker()
        .write(capture_control, CAPTURE_START | CAPTURE_CONTINUOUS);

    let result = serve_connection(reader, &writer, dispatcher);

    stream.detach();
    dispatcher.broker().write(capture_control, 0);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisEngine, FrameGeometry};
    use crate::broker::{FirmwareVersion, MemoryRegisters, RegisterBroker, RegisterValue};
    use crate::capture::{CaptureTask, FrameSource};
    use crate::checksum::Crc16Xmodem;
    use crate::dispatcher::PollControl;
    use crate::registers::VirtualRegisterTable;
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::thread;

    /// Delivers one chunk per read.
    struct Chunks(VecDeque<Vec<u8>>);

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(chunk) = self.0.pop_front() else {
                return Ok(0);
            };
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    fn dispatcher(poll: Arc<PollState>) -> Dispatcher {
        let table = VirtualRegisterTable::load(FrameGeometry::default(), Box::new(MemoryStore::new()));
        let broker = RegisterBroker::new(
            Arc::new(Mutex::new(table)),
            Arc::new(Mutex::new(MemoryRegisters::new())),
            Arc::new(FirmwareVersion::default()),
        );
        Dispatcher::new(broker, poll, Crc16Xmodem)
    }

    #[test]
    fn session_replies_per_frame() {
        let dispatcher = dispatcher(Arc::new(PollState::new()));
        let mut session = Session::new();
        assert_eq!(session.receive(b"#000", &dispatcher), None);
        assert_eq!(
            session.receive(b"8WREGXXXX", &dispatcher),
            Some(&b"   #0008WREGE0BC\0"[..])
        );
        // Checksum mismatch, no reply.
        assert_eq!(session.receive(b"#000ARREGC20000", &dispatcher), None);
        assert_eq!(session.receive(b"#0008NOPEXXXX", &dispatcher), None);
    }

    #[test]
    fn session_reset_drops_partial_frame() {
        let dispatcher = dispatcher(Arc::new(PollState::new()));
        let mut session = Session::new();
        assert_eq!(session.receive(b"#0008WR", &dispatcher), None);
        session.reset();
        assert_eq!(session.receive(b"EGXXXX", &dispatcher), None);
        assert!(session.receive(b"#0008WREGXXXX", &dispatcher).is_some());
    }

    #[test]
    fn serve_until_disconnect() {
        let poll = Arc::new(PollState::new());
        let dispatcher = dispatcher(poll.clone());
        let reader = Chunks(VecDeque::from([
            b"#000APO".to_vec(),
            b"LL05XXXX".to_vec(),
            b"noise".to_vec(),
            b"#000ARREGC0XXXX".to_vec(),
        ]));
        let writer = SharedWriter::new(Vec::new());
        serve_connection(reader, &writer, &dispatcher).unwrap();
        assert_eq!(poll.poll_frequency_hz(), 5);

        let written = writer.lock().clone();
        assert!(written.starts_with(b"   #0008POLLBB50\0   #000CRREG0028"));
        assert_eq!(written.len(), 17 + 21);
    }

    #[test]
    fn frame_stream() {
        let poll = Arc::new(PollState::new());
        let stream = FrameStream::new(poll.clone());
        stream.send_frame(&[1, 2]);

        let writer = SharedWriter::new(Vec::new());
        stream.attach(writer.clone());
        assert!(poll.is_streaming_session_active());
        stream.send_frame(&[0x0102, 0xFFFF]);
        assert_eq!(*writer.lock(), vec![0x02, 0x01, 0xFF, 0xFF]);

        stream.detach();
        assert!(!stream.is_attached());
        assert!(!poll.is_streaming_session_active());
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn frame_stream_detaches_on_error() {
        let poll = Arc::new(PollState::new());
        let stream = FrameStream::new(poll.clone());
        stream.attach(SharedWriter::new(Broken));
        stream.send_frame(&[1]);
        assert!(!stream.is_attached());
        assert!(!poll.is_streaming_session_active());
    }

    #[test]
    fn streamed_frames_and_replies_do_not_interleave() {
        const FRAMES: usize = 50;
        const REPLIES: usize = 50;
        let ack = b"   #0008WREGE0BC\0";

        let poll = Arc::new(PollState::new());
        let dispatcher = dispatcher(poll.clone());
        let stream = FrameStream::new(poll.clone());
        let writer = SharedWriter::new(Vec::new());
        stream.attach(writer.clone());
        // 0x5A5A words serialize to 'Z' bytes, never the ' ' starting an ACK.
        let raw = vec![0x5A5A_u16; 64];

        thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..FRAMES {
                    stream.send_frame(&raw);
                }
            });
            scope.spawn(|| {
                let mut session = Session::new();
                for _ in 0..REPLIES {
                    if let Some(reply) = session.receive(b"#0008WREGXXXX", &dispatcher) {
                        writer.write_all(reply).unwrap();
                    }
                }
            });
        });

        let written = writer.lock().clone();
        let frame_len = raw.len() * 2;
        let (mut frames, mut replies) = (0, 0);
        let mut rest = written.as_slice();
        while !rest.is_empty() {
            if rest.starts_with(ack) {
                replies += 1;
                rest = &rest[ack.len()..];
            } else {
                assert!(
                    rest.len() >= frame_len && rest[..frame_len].iter().all(|b| *b == b'Z'),
                    "torn output at byte {}",
                    written.len() - rest.len()
                );
                frames += 1;
                rest = &rest[frame_len..];
            }
        }
        assert_eq!((frames, replies), (FRAMES, REPLIES));
    }

    struct Flat(u16);

    impl FrameSource for Flat {
        fn capture(&mut self) -> Option<Vec<u16>> {
            Some(vec![self.0; FrameGeometry::default().raw_len()])
        }
    }

    /// Runs one capture step ahead of every read, standing in for the
    /// capture thread.
    struct Stepping {
        task: CaptureTask<Flat>,
        chunks: VecDeque<Vec<u8>>,
    }

    impl Read for Stepping {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.task.step();
            let Some(chunk) = self.chunks.pop_front() else {
                return Ok(0);
            };
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn frame_client_starts_capture_and_shares_writer() {
        let table = Arc::new(Mutex::new(VirtualRegisterTable::load(
            FrameGeometry::default(),
            Box::new(MemoryStore::new()),
        )));
        let broker = RegisterBroker::new(
            table.clone(),
            Arc::new(Mutex::new(MemoryRegisters::new())),
            Arc::new(FirmwareVersion::default()),
        );
        let poll = Arc::new(PollState::new());
        let stream = Arc::new(FrameStream::new(poll.clone()));
        let task = CaptureTask::new(
            Flat(0x0102),
            AnalysisEngine::new(table),
            broker.clone(),
            poll.clone(),
        )
        .with_sink(stream.clone());
        let dispatcher = Dispatcher::new(broker.clone(), poll.clone(), Crc16Xmodem);
        let reader = Stepping {
            task,
            chunks: VecDeque::from([b"#000ARREGB1XXXX".to_vec()]),
        };

        let writer = SharedWriter::new(Vec::new());
        serve_frame_client(reader, writer.clone(), &stream, &dispatcher).unwrap();

        let frame_len = FrameGeometry::default().raw_len() * 2;
        let written = writer.lock().clone();
        assert_eq!(written.len(), 2 * frame_len + 19);
        assert!(written[..frame_len].chunks(2).all(|word| word == [0x02, 0x01]));
        // Capture control reads back as running while the client is attached.
        assert!(written[frame_len..].starts_with(b"   #000ARREG03"));
        assert!(written[frame_len + 19..].chunks(2).all(|word| word == [0x02, 0x01]));

        assert!(!stream.is_attached());
        assert!(!poll.is_streaming_session_active());
        assert_eq!(
            broker.read(RegisterAddress::new(RegisterAddress::CAPTURE_CONTROL)),
            RegisterValue::Narrow(0)
        );
    }
}
