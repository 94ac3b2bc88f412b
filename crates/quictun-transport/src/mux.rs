//! Stream multiplexer shared by every transport implementation
//!
//! The multiplexer only sees boxed `AsyncRead`/`AsyncWrite` halves. Data
//! streams are attached one by one, possibly while the transport is already
//! in use: writers pick among the attached slots and wait briefly when the
//! chosen slot is still empty.
//!
//! A data stream whose reader hits an error can no longer be framed, so the
//! whole transport is failed: pending and later calls report `StreamClosed`.

use crate::pool::{BufferPool, PooledBuffer};
use crate::{CloseReason, Transport, TransportError, TransportOptions, TransportResult};
use async_trait::async_trait;
use quictun_proto::{CommandCodec, ControlCommand, FrameCodec, FRAME_HEADER_LEN};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long a writer waits before picking again when it hit an empty slot
const SLOT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Tears down whatever carries the streams (a QUIC connection, a test pipe...)
#[async_trait]
pub trait SessionCloser: Send + Sync {
    async fn close(&self, reason: CloseReason);
}

/// Closer for transports whose streams need no further teardown
#[derive(Debug, Default)]
pub struct NullCloser;

#[async_trait]
impl SessionCloser for NullCloser {
    async fn close(&self, _reason: CloseReason) {}
}

/// A frame decoded in place: payload is `buffer[start..end]`
struct DecodedFrame {
    buffer: PooledBuffer,
    start: usize,
    end: usize,
}

/// Multiplexed transport over N data streams and one control stream
pub struct MuxTransport {
    slots: Vec<OnceLock<Mutex<BoxedWriter>>>,
    attached: AtomicUsize,
    frames_tx: std::sync::Mutex<Option<mpsc::Sender<DecodedFrame>>>,
    frames_rx: Mutex<mpsc::Receiver<DecodedFrame>>,
    sealed: AtomicBool,
    control_reader: Mutex<BoxedReader>,
    control_writer: Mutex<BoxedWriter>,
    pool: BufferPool,
    closer: Box<dyn SessionCloser>,
    closed: AtomicBool,
    max_payload: usize,
    cancel: CancellationToken,
    streams_cancel: CancellationToken,
}

impl MuxTransport {
    pub fn new(
        options: &TransportOptions,
        control_reader: BoxedReader,
        control_writer: BoxedWriter,
        closer: Box<dyn SessionCloser>,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(options.queue_capacity.max(1));
        let size = options.buffer_size;
        let pool = BufferPool::with_tester(
            options.pool_capacity,
            size,
            Box::new(move |buf: &[u8]| buf.len() == size),
        )
        .idle_timeout(options.pool_idle_timeout);
        let cancel = CancellationToken::new();
        let streams_cancel = cancel.child_token();

        Self {
            slots: (0..options.streams.max(1)).map(|_| OnceLock::new()).collect(),
            attached: AtomicUsize::new(0),
            frames_tx: std::sync::Mutex::new(Some(frames_tx)),
            frames_rx: Mutex::new(frames_rx),
            sealed: AtomicBool::new(false),
            control_reader: Mutex::new(control_reader),
            control_writer: Mutex::new(control_writer),
            pool,
            closer,
            closed: AtomicBool::new(false),
            max_payload: options.max_payload(),
            cancel,
            streams_cancel,
        }
    }

    /// Number of data stream slots
    pub fn stream_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of data streams attached so far
    pub fn attached_streams(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once closed, or once a data stream reader failed
    fn is_failed(&self) -> bool {
        self.is_closed() || self.cancel.is_cancelled()
    }

    /// Largest payload `write` accepts; the peer's pool buffers hold exactly this much
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Plug data stream `index` in and start its reader task
    pub fn attach_stream(
        &self,
        index: usize,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> TransportResult<()> {
        let slot = self.slots.get(index).ok_or_else(|| {
            TransportError::ConfigurationError(format!(
                "stream index {} out of range (0..{})",
                index,
                self.slots.len()
            ))
        })?;

        let frames = self
            .sender()
            .ok_or(TransportError::StreamClosed)?;

        slot.set(Mutex::new(writer)).map_err(|_| {
            TransportError::ProtocolError(format!("stream {} already attached", index))
        })?;
        self.attached.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(read_stream(
            index,
            reader,
            self.pool.clone(),
            frames,
            self.streams_cancel.clone(),
            self.cancel.clone(),
        ));
        trace!("Attached data stream {}", index);
        Ok(())
    }

    /// Stop accepting new streams
    ///
    /// Once sealed, the merge queue closes as soon as every reader task has
    /// exited, and `read` reports end-of-stream.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        let mut sender = match self.frames_tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sender.take();
    }

    /// Give up on the data plane after a stream failed to come up
    ///
    /// Every attached stream is shut down and the queue is sealed.
    pub async fn abandon_streams(&self) {
        warn!(
            "Abandoning data streams ({} of {} attached)",
            self.attached_streams(),
            self.slots.len()
        );
        self.streams_cancel.cancel();
        for slot in &self.slots {
            if let Some(writer) = slot.get() {
                if let Ok(mut writer) = writer.try_lock() {
                    let _ = writer.shutdown().await;
                }
            }
        }
        self.seal();
    }

    fn sender(&self) -> Option<mpsc::Sender<DecodedFrame>> {
        let sender = match self.frames_tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sender.clone()
    }

    async fn pick_writer(&self) -> TransportResult<&Mutex<BoxedWriter>> {
        loop {
            if self.is_failed() {
                return Err(TransportError::StreamClosed);
            }

            let index = rand::thread_rng().gen_range(0..self.slots.len());
            if let Some(writer) = self.slots[index].get() {
                return Ok(writer);
            }

            if self.sealed.load(Ordering::Acquire) {
                // No more streams are coming; choose among the ones we have
                let ready: Vec<&Mutex<BoxedWriter>> =
                    self.slots.iter().filter_map(|slot| slot.get()).collect();
                let chosen = ready.choose(&mut rand::thread_rng()).copied();
                return chosen.ok_or(TransportError::StreamClosed);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::StreamClosed),
                _ = tokio::time::sleep(SLOT_RETRY_DELAY) => {}
            }
        }
    }
}

async fn read_stream(
    index: usize,
    mut reader: BoxedReader,
    pool: BufferPool,
    frames: mpsc::Sender<DecodedFrame>,
    cancel: CancellationToken,
    fail_transport: CancellationToken,
) {
    loop {
        let mut buffer = tokio::select! {
            _ = cancel.cancelled() => break,
            borrowed = pool.borrow() => match borrowed {
                Ok(buffer) => buffer,
                Err(_) => break,
            },
        };

        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            result = FrameCodec::read_frame(&mut reader, &mut buffer[..]) => match result {
                Ok(len) => len,
                Err(e) => {
                    if !cancel.is_cancelled() {
                        warn!("Data stream {} unusable, failing transport: {}", index, e);
                        fail_transport.cancel();
                    }
                    break;
                }
            },
        };
        trace!("Stream {} decoded {} byte frame", index, len);

        let frame = DecodedFrame {
            buffer,
            start: FRAME_HEADER_LEN,
            end: FRAME_HEADER_LEN + len,
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = frames.send(frame) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for MuxTransport {
    async fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if self.is_failed() {
            return Err(TransportError::StreamClosed);
        }

        let frame = {
            let mut frames = self.frames_rx.lock().await;
            tokio::select! {
                _ = self.cancel.cancelled() => None,
                frame = frames.recv() => frame,
            }
        };
        let frame = frame.ok_or(TransportError::StreamClosed)?;

        let len = frame.end - frame.start;
        if len > buf.len() {
            return Err(TransportError::ShortBuffer {
                needed: len,
                available: buf.len(),
            });
        }
        buf[..len].copy_from_slice(&frame.buffer[frame.start..frame.end]);
        frame.buffer.give_back();
        Ok(len)
    }

    async fn write(&self, payload: &[u8]) -> TransportResult<usize> {
        if payload.len() > self.max_payload {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }

        let writer = self.pick_writer().await?;
        let mut writer = writer.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::StreamClosed),
            written = FrameCodec::write_frame(&mut *writer, payload) => {
                written?;
                Ok(payload.len())
            }
        }
    }

    async fn read_command(&self) -> TransportResult<ControlCommand> {
        if self.is_failed() {
            return Err(TransportError::StreamClosed);
        }
        let mut reader = self.control_reader.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::StreamClosed),
            command = CommandCodec::read_command(&mut *reader) => Ok(command?),
        }
    }

    async fn write_command(&self, command: &ControlCommand) -> TransportResult<()> {
        if self.is_failed() {
            return Err(TransportError::StreamClosed);
        }
        let mut writer = self.control_writer.lock().await;
        CommandCodec::write_command(&mut *writer, command).await?;
        Ok(())
    }

    async fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing transport: {}", reason);

        self.cancel.cancel();
        self.seal();
        self.pool.close();

        if let Ok(mut writer) = self.control_writer.try_lock() {
            let _ = writer.shutdown().await;
        }
        self.closer.close(reason).await;
    }

    fn stats(&self) -> String {
        self.pool.stats().to_string()
    }
}

impl Drop for MuxTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quictun_proto::{CommandType, MAX_PAYLOAD_LEN};
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    struct CountingCloser(Arc<AtomicUsize>);

    #[async_trait]
    impl SessionCloser for CountingCloser {
        async fn close(&self, _reason: CloseReason) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn options(streams: usize) -> TransportOptions {
        TransportOptions {
            streams,
            pool_capacity: 32,
            buffer_size: 4096,
            queue_capacity: 64,
            pool_idle_timeout: None,
        }
    }

    fn boxed(stream: DuplexStream) -> (BoxedReader, BoxedWriter) {
        let (r, w) = tokio::io::split(stream);
        (Box::new(r), Box::new(w))
    }

    fn transport(streams: usize, control: DuplexStream, closer: Box<dyn SessionCloser>) -> MuxTransport {
        let (r, w) = boxed(control);
        MuxTransport::new(&options(streams), r, w, closer)
    }

    /// Two transports wired back to back with in-memory pipes
    fn pair(streams: usize) -> (MuxTransport, MuxTransport) {
        let (ca, cb) = tokio::io::duplex(64 * 1024);
        let a = transport(streams, ca, Box::new(NullCloser));
        let b = transport(streams, cb, Box::new(NullCloser));
        for i in 0..streams {
            let (sa, sb) = tokio::io::duplex(256 * 1024);
            let (r, w) = boxed(sa);
            a.attach_stream(i, r, w).unwrap();
            let (r, w) = boxed(sb);
            b.attach_stream(i, r, w).unwrap();
        }
        a.seal();
        b.seal();
        (a, b)
    }

    #[tokio::test]
    async fn test_frame_crosses_transport() {
        let (a, b) = pair(4);
        let payload: Vec<u8> = (0..1400).map(|i| (i % 256) as u8).collect();

        assert_eq!(a.write(&payload).await.unwrap(), 1400);

        let mut buf = vec![0u8; 4096];
        let len = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &payload[..]);
        assert!(b.stats().starts_with("Borrowed: "));
        // Every returned buffer goes through the pool's check
        assert!(b.stats().contains("Returned: 1 "));
        assert!(b.stats().ends_with("Tested: 1"));
    }

    #[tokio::test]
    async fn test_control_commands() {
        let (a, b) = pair(1);
        let cmd = ControlCommand::new(CommandType::SubnetUpdate, "10.0.0.0/8").unwrap();

        a.write_command(&cmd).await.unwrap();
        assert_eq!(b.read_command().await.unwrap(), cmd);

        b.write_command(&ControlCommand::ok()).await.unwrap();
        assert!(a.read_command().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_short_caller_buffer() {
        let (a, b) = pair(2);
        a.write(&[1u8; 100]).await.unwrap();

        let mut small = [0u8; 10];
        let err = b.read(&mut small).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ShortBuffer {
                needed: 100,
                available: 10
            }
        ));
    }

    #[tokio::test]
    async fn test_oversize_write_rejected() {
        let (a, _b) = pair(1);
        let err = a.write(&vec![0u8; MAX_PAYLOAD_LEN + 1]).await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn test_write_limited_to_peer_buffer() {
        let (a, b) = pair(2);
        assert_eq!(a.max_payload(), 4094);

        let err = a.write(&[0xAB; 4096]).await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge(4096)));
        let err = a.write(&[0xAB; 4095]).await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge(4095)));

        a.write(&[0xCD; 4094]).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let len = tokio::time::timeout(Duration::from_secs(1), b.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 4094);
        assert!(buf[..len].iter().all(|byte| *byte == 0xCD));

        // Every stream still delivers afterwards
        for i in 0..40u8 {
            a.write(&[i]).await.unwrap();
        }
        for _ in 0..40 {
            let len = tokio::time::timeout(Duration::from_secs(1), b.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(len, 1);
        }
    }

    #[tokio::test]
    async fn test_undecodable_stream_fails_transport() {
        let (ca, _cb) = tokio::io::duplex(1024);
        let b = transport(2, ca, Box::new(NullCloser));
        let (s0, mut peer0) = tokio::io::duplex(64 * 1024);
        let (r, w) = boxed(s0);
        b.attach_stream(0, r, w).unwrap();
        let (s1, _peer1) = tokio::io::duplex(64 * 1024);
        let (r, w) = boxed(s1);
        b.attach_stream(1, r, w).unwrap();
        b.seal();

        // Valid on the wire, but larger than a pooled buffer
        FrameCodec::write_frame(&mut peer0, &[0xAB; 4096]).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let read = tokio::time::timeout(Duration::from_secs(1), b.read(&mut buf))
            .await
            .unwrap();
        assert!(read.unwrap_err().is_closed());

        let write = tokio::time::timeout(Duration::from_secs(1), b.write(b"x"))
            .await
            .unwrap();
        assert!(write.unwrap_err().is_closed());
        assert!(b.read_command().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_failed_stream_unblocks_stuck_write() {
        let (ca, _cb) = tokio::io::duplex(1024);
        let a = Arc::new(transport(2, ca, Box::new(NullCloser)));

        // Writers go into tiny pipes nobody drains, so writes block
        let (w0, _stuck0) = tokio::io::duplex(16);
        let (w1, _stuck1) = tokio::io::duplex(16);
        let (r0, _idle) = tokio::io::duplex(16);
        let (r1, mut broken) = tokio::io::duplex(16);
        a.attach_stream(0, Box::new(r0), Box::new(w0)).unwrap();
        a.attach_stream(1, Box::new(r1), Box::new(w1)).unwrap();
        a.seal();

        let writer = {
            let a = a.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = a.write(&[0u8; 1000]).await {
                        return e;
                    }
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        // Truncated header then EOF on one stream
        broken.write_all(&[0x10]).await.unwrap();
        drop(broken);

        let err = tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(err.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writes_spread_over_all_streams() {
        const STREAMS: usize = 8;
        const FRAMES: usize = 2000;

        let (ca, _cb) = tokio::io::duplex(1024);
        let a = transport(STREAMS, ca, Box::new(NullCloser));
        let counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..STREAMS).map(|_| AtomicUsize::new(0)).collect());

        for i in 0..STREAMS {
            let (sa, mut sb) = tokio::io::duplex(64 * 1024);
            let (r, w) = boxed(sa);
            a.attach_stream(i, r, w).unwrap();

            let counts = counts.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while FrameCodec::read_frame(&mut sb, &mut buf).await.is_ok() {
                    counts[i].fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        a.seal();

        for _ in 0..FRAMES {
            a.write(b"ping").await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let total: usize = counts.iter().map(|c| c.load(Ordering::SeqCst)).sum();
                if total == FRAMES {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        for (i, count) in counts.iter().enumerate() {
            let count = count.load(Ordering::SeqCst);
            assert!(count >= 100, "stream {} starved: {} frames", i, count);
        }
    }

    #[tokio::test]
    async fn test_write_waits_for_late_stream() {
        let (ca, _cb) = tokio::io::duplex(1024);
        let a = Arc::new(transport(2, ca, Box::new(NullCloser)));
        let (sa, mut sb) = tokio::io::duplex(1024);

        let writer = {
            let a = a.clone();
            tokio::spawn(async move { a.write(b"late").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (r, w) = boxed(sa);
        a.attach_stream(1, r, w).unwrap();

        let written = tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(written, 4);

        let mut buf = [0u8; 16];
        let len = FrameCodec::read_frame(&mut sb, &mut buf).await.unwrap();
        assert_eq!(&buf[2..2 + len], b"late");
    }

    #[tokio::test]
    async fn test_attach_twice_or_out_of_range() {
        let (ca, _cb) = tokio::io::duplex(1024);
        let a = transport(1, ca, Box::new(NullCloser));

        let (s1, _p1) = tokio::io::duplex(64);
        let (r, w) = boxed(s1);
        a.attach_stream(0, r, w).unwrap();

        let (s2, _p2) = tokio::io::duplex(64);
        let (r, w) = boxed(s2);
        assert!(a.attach_stream(0, r, w).is_err());

        let (s3, _p3) = tokio::io::duplex(64);
        let (r, w) = boxed(s3);
        assert!(a.attach_stream(5, r, w).is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (ca, _cb) = tokio::io::duplex(1024);
        let closes = Arc::new(AtomicUsize::new(0));
        let a = transport(1, ca, Box::new(CountingCloser(closes.clone())));
        let (s, _peer) = tokio::io::duplex(1024);
        let (r, w) = boxed(s);
        a.attach_stream(0, r, w).unwrap();
        a.seal();

        a.close(CloseReason::Graceful).await;
        a.close(CloseReason::Graceful).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let mut buf = [0u8; 16];
        assert!(a.read(&mut buf).await.unwrap_err().is_closed());
        assert!(a.write(b"x").await.unwrap_err().is_closed());
        assert!(a.read_command().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (a, _b) = pair(2);
        let a = Arc::new(a);

        let reader = {
            let a = a.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                a.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close(CloseReason::Graceful).await;

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_ends_read() {
        let (a, b) = pair(3);
        b.close(CloseReason::Graceful).await;
        drop(b);

        let mut buf = [0u8; 64];
        let result = tokio::time::timeout(Duration::from_secs(2), a.read(&mut buf))
            .await
            .unwrap();
        assert!(result.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_abandoned_setup_reports_closed() {
        let (ca, _cb) = tokio::io::duplex(1024);
        let a = transport(4, ca, Box::new(NullCloser));
        a.abandon_streams().await;

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(1), a.read(&mut buf))
            .await
            .unwrap();
        assert!(read.unwrap_err().is_closed());

        let write = tokio::time::timeout(Duration::from_secs(1), a.write(b"x"))
            .await
            .unwrap();
        assert!(write.unwrap_err().is_closed());
    }
}
