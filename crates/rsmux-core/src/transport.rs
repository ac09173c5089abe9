//! Outbound side of a connection.
//!
//! Frames are queued to a dedicated writer thread, so `send` never blocks on
//! the socket. The receive thread can answer the peer (REQUEST_N, KEEPALIVE,
//! ERROR) even while the peer is not reading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use rsmux_frame::{Frame, FrameConfig, FrameReader, FrameWriter};
use rsmux_transport::DuplexStream;

use crate::error::{MuxError, Result};
use crate::sync::lock;

/// Sending half of a duplex connection as seen by the multiplexer.
pub trait DuplexConnection: Send + Sync {
    /// Queue one frame.
    fn send(&self, frame: Frame) -> Result<()>;

    /// Queue frames that must reach the peer back to back (fragments of one
    /// payload).
    fn send_all(&self, frames: Vec<Frame>) -> Result<()> {
        for frame in frames {
            self.send(frame)?;
        }
        Ok(())
    }

    /// Stop accepting frames. Already queued frames are still written.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// `DuplexConnection` over a `DuplexStream` with a writer thread.
pub struct StreamTransport {
    outbound: Mutex<Option<Sender<Vec<Frame>>>>,
    closed: Arc<AtomicBool>,
    stream: DuplexStream,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    /// Start the writer thread and return the transport plus a reader for
    /// the receive thread.
    pub fn start(
        stream: DuplexStream,
        config: FrameConfig,
    ) -> Result<(Self, FrameReader<DuplexStream>)> {
        let reader = FrameReader::with_config_stream(stream.try_clone()?, config.clone())?;
        let writer = FrameWriter::with_config_stream(stream.try_clone()?, config)?;

        let (tx, rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let handle = {
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name("rsmux-writer".into())
                .spawn(move || write_loop(writer, rx, &closed))
                .map_err(|err| MuxError::Transport(err.into()))?
        };

        Ok((
            Self {
                outbound: Mutex::new(Some(tx)),
                closed,
                stream,
                writer: Mutex::new(Some(handle)),
            },
            reader,
        ))
    }

    fn enqueue(&self, frames: Vec<Frame>) -> Result<()> {
        let outbound = lock(&self.outbound);
        match outbound.as_ref() {
            Some(tx) if !self.is_closed() => tx
                .send(frames)
                .map_err(|_| MuxError::ConnectionClosed("writer stopped".into())),
            _ => Err(MuxError::ConnectionClosed("connection is closed".into())),
        }
    }

    /// Close and wait until queued frames are written and the socket is shut
    /// down.
    pub fn close_and_wait(&self) {
        self.close();
        if let Some(handle) = lock(&self.writer).take() {
            let _ = handle.join();
        }
    }

    /// Shut the socket down immediately, waking the receive thread.
    pub fn abort(&self) {
        self.close();
        if let Err(err) = self.stream.shutdown() {
            tracing::debug!(error = %err, "socket shutdown failed");
        }
    }
}

impl DuplexConnection for StreamTransport {
    fn send(&self, frame: Frame) -> Result<()> {
        self.enqueue(vec![frame])
    }

    fn send_all(&self, frames: Vec<Frame>) -> Result<()> {
        self.enqueue(frames)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.outbound).take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn write_loop(
    mut writer: FrameWriter<DuplexStream>,
    rx: Receiver<Vec<Frame>>,
    closed: &AtomicBool,
) {
    'batches: for batch in rx {
        for frame in batch {
            if let Err(err) = writer.write_frame(&frame) {
                tracing::warn!(
                    error = %err,
                    stream_id = frame.stream_id(),
                    frame_type = %frame.frame_type(),
                    "frame write failed"
                );
                closed.store(true, Ordering::Release);
                break 'batches;
            }
        }
    }
    if let Err(err) = writer.get_ref().shutdown() {
        tracing::debug!(error = %err, "socket shutdown failed");
    }
}
