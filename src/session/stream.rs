use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;

use crate::cache::CachedEngine;
use crate::{AudioChunk, ChunkControl, GenerateOutcome, SynthesisParams, TtsError};

/// Cancellation flag shared by a producer and its consumer.
///
/// Besides the flag, the token carries a channel that disconnects on
/// cancellation, so a thread blocked on a full or empty chunk channel can
/// `select!` on it and wake immediately.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    wake_tx: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                wake_tx: Mutex::new(Some(wake_tx)),
                wake_rx,
            }),
        }
    }

    /// Set the flag and wake blocked waiters. Returns `true` for the call
    /// that actually cancelled.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        drop(self.inner.wake_tx.lock().take());
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Becomes ready (disconnected) once the token is cancelled.
    pub(crate) fn wake(&self) -> &Receiver<()> {
        &self.inner.wake_rx
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The consumer's view of a producer: a blocking iterator of chunks.
///
/// Each `next` either yields the next chunk in production order or ends the
/// iteration, because the producer is done or because the token was
/// cancelled. Chunks still queued at cancellation are never yielded.
pub struct ChunkStream {
    chunks: Receiver<AudioChunk>,
    cancel: CancelToken,
}

impl ChunkStream {
    pub(crate) fn new(chunks: Receiver<AudioChunk>, cancel: CancelToken) -> Self {
        Self { chunks, cancel }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Iterator for ChunkStream {
    type Item = AudioChunk;

    fn next(&mut self) -> Option<AudioChunk> {
        if self.cancel.is_cancelled() {
            return None;
        }
        select! {
            recv(self.chunks) -> chunk => chunk.ok().filter(|_| !self.cancel.is_cancelled()),
            recv(self.cancel.wake()) -> _ => None,
        }
    }
}

/// Drive `engine` over `text`, pushing every chunk into `tx`.
///
/// Holds the engine for the whole call. Before handing off a chunk the
/// callback checks `cancel`; once it is set no further chunk is enqueued and
/// generation is told to stop. A full channel blocks until the consumer
/// makes room or the token is cancelled.
pub(crate) fn produce(
    engine: &CachedEngine,
    text: &str,
    params: &SynthesisParams,
    tx: &Sender<AudioChunk>,
    cancel: &CancelToken,
) -> Result<GenerateOutcome, TtsError> {
    let mut engine = engine.lock();
    engine.generate(text, params, &mut |chunk| {
        if cancel.is_cancelled() {
            return ChunkControl::Stop;
        }
        select! {
            send(tx, chunk.to_vec()) -> sent => match sent {
                Ok(()) => ChunkControl::Continue,
                Err(_) => ChunkControl::Stop,
            },
            recv(cancel.wake()) -> _ => ChunkControl::Stop,
        }
    })
}

/// Synthesize `text` on a worker thread and return its chunks as an iterator.
///
/// At most `capacity` chunks are produced ahead of the iterator. Cancelling
/// `cancel` ends both the iterator and the worker within one synthesis step.
pub fn stream_chunks(
    engine: Arc<CachedEngine>,
    text: impl Into<String>,
    params: SynthesisParams,
    capacity: usize,
    cancel: CancelToken,
) -> Result<(ChunkStream, JoinHandle<Result<GenerateOutcome, TtsError>>), TtsError> {
    let text = text.into();
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let producer_cancel = cancel.clone();
    let worker = thread::Builder::new()
        .name("tts-producer".to_string())
        .spawn(move || produce(&engine, &text, &params, &tx, &producer_cancel))?;
    Ok((ChunkStream::new(rx, cancel), worker))
}
