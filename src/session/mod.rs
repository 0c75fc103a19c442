//! One "speak this text" request, from synthesis to playback.
//!
//! A [`StreamingSession`] runs two workers connected by a bounded channel:
//!
//! ```text
//!  producer thread                                consumer thread
//! ┌─────────────────────┐   bounded channel   ┌──────────────────────────┐
//! │ engine.generate()   │──► chunk ─► chunk ──►│ × gain ─► sink.write()   │
//! │ polls CancelToken   │  (back-pressure)     │ ends on close or cancel  │
//! └─────────────────────┘                      └──────────────────────────┘
//! ```
//!
//! State machine: `Idle → Producing → Draining → Completed`, or
//! `Idle → Producing → Cancelled` on [`stop`](StreamingSession::stop), a
//! synthesis error or a sink error.

mod stream;

pub use stream::{stream_chunks, CancelToken, ChunkStream};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::cache::CachedEngine;
use crate::events::TtsEvent;
use crate::registry::VoiceParams;
use crate::sink::PlaybackSink;
use crate::{AudioChunk, GenerateOutcome, SynthesisParams, TtsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Producing,
    Draining,
    Completed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// How a session ended.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    /// Every chunk was written to the sink.
    Completed,
    /// Stopped by [`StreamingSession::stop`] or a [`SessionHandle`].
    Cancelled,
    /// Aborted by a synthesis or sink error.
    Failed(Arc<TtsError>),
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

struct SessionControl {
    state: Mutex<SessionState>,
    cancel: CancelToken,
    sink: Arc<dyn PlaybackSink>,
    language: String,
    failure: Mutex<Option<TtsError>>,
    outcome: Mutex<Option<SessionOutcome>>,
    /// Workers still running; the last one out resolves the outcome.
    running: AtomicUsize,
    events: Mutex<Option<Sender<TtsEvent>>>,
    started_at: Mutex<Option<Instant>>,
}

impl SessionControl {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        log::debug!("Session '{}': {from:?} -> {to:?}", self.language);
        true
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            log::debug!("Session '{}': {:?} -> Cancelled", self.language, *state);
            *state = SessionState::Cancelled;
        }
        self.cancel.cancel();
        self.sink.stop_and_flush();
    }

    /// Record the first error and tear the session down as if stopped.
    fn fail(&self, error: TtsError) {
        log::error!("Session '{}' failed: {error}", self.language);
        self.failure.lock().get_or_insert(error);
        self.stop();
    }

    fn emit(&self, event: TtsEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    fn finish(&self) {
        let outcome = match self.failure.lock().take() {
            Some(error) => SessionOutcome::Failed(Arc::new(error)),
            None if self.state() == SessionState::Completed => SessionOutcome::Completed,
            None => SessionOutcome::Cancelled,
        };
        if let Some(started) = *self.started_at.lock() {
            log::debug!(
                "Session '{}' finished in {:.2?}: {outcome:?}",
                self.language,
                started.elapsed()
            );
        }
        *self.outcome.lock() = Some(outcome.clone());
        self.emit(TtsEvent::SessionFinished {
            language: self.language.clone(),
            outcome,
        });
    }
}

/// Held by each worker; resolves the outcome when the last one exits.
struct WorkerExit(Arc<SessionControl>);

impl Drop for WorkerExit {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0
                .fail(TtsError::Synthesis("session worker panicked".to_string()));
        }
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.finish();
        }
    }
}

/// Cloneable handle for stopping a session from another thread.
#[derive(Clone)]
pub struct SessionHandle {
    control: Arc<SessionControl>,
}

impl SessionHandle {
    /// See [`StreamingSession::stop`].
    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    pub fn language(&self) -> &str {
        &self.control.language
    }

    /// The outcome, once both workers have exited.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.control.outcome.lock().clone()
    }
}

/// One synthesis-to-playback request.
///
/// Dropping a session that is still running stops it and waits for both
/// workers, so no thread outlives it blocked on the channel or the sink.
pub struct StreamingSession {
    control: Arc<SessionControl>,
    engine: Arc<CachedEngine>,
    voice: VoiceParams,
    capacity: usize,
    channels: u16,
    workers: Vec<JoinHandle<()>>,
}

impl StreamingSession {
    /// `voice` is captured here; later changes to the language's voice do not
    /// affect this session. `capacity` bounds the chunks in flight between
    /// producer and consumer.
    pub fn new(
        engine: Arc<CachedEngine>,
        voice: VoiceParams,
        sink: Arc<dyn PlaybackSink>,
        capacity: usize,
    ) -> Self {
        let control = SessionControl {
            state: Mutex::new(SessionState::Idle),
            cancel: CancelToken::new(),
            sink,
            language: engine.language().to_string(),
            failure: Mutex::new(None),
            outcome: Mutex::new(None),
            running: AtomicUsize::new(0),
            events: Mutex::new(None),
            started_at: Mutex::new(None),
        };
        Self {
            control: Arc::new(control),
            engine,
            voice,
            capacity: capacity.max(1),
            channels: 1,
            workers: Vec::new(),
        }
    }

    /// Number of channels the sink is opened with. Defaults to 1.
    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    /// Report start and finish on `events`.
    pub fn with_events(self, events: Sender<TtsEvent>) -> Self {
        *self.control.events.lock() = Some(events);
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    pub fn language(&self) -> &str {
        &self.control.language
    }

    /// Open the sink and launch the producer and consumer.
    ///
    /// Fails with [`TtsError::InvalidState`] unless the session is idle, and
    /// with [`TtsError::SinkUnavailable`] if the sink cannot be opened, in
    /// which case the session ends as failed.
    pub fn start(&mut self, text: &str) -> Result<(), TtsError> {
        if !self
            .control
            .transition(SessionState::Idle, SessionState::Producing)
        {
            return Err(TtsError::InvalidState("session already started"));
        }
        *self.control.started_at.lock() = Some(Instant::now());

        if let Err(e) = self
            .control
            .sink
            .open(self.engine.sample_rate(), self.channels)
        {
            let reason = match e {
                TtsError::SinkUnavailable(reason) => reason,
                other => other.to_string(),
            };
            self.abort(&reason);
            return Err(TtsError::SinkUnavailable(reason));
        }

        let (tx, rx) = crossbeam_channel::bounded(self.capacity);
        self.control.running.store(2, Ordering::SeqCst);
        self.control.emit(TtsEvent::SessionStarted {
            language: self.control.language.clone(),
        });
        log::debug!(
            "Session '{}' started: {} chars, gain {}, speed {}",
            self.control.language,
            text.chars().count(),
            self.voice.gain,
            self.voice.speed
        );

        // Each exit guard is moved into its worker; if a spawn fails the
        // dropped closure still releases it.
        let producer_exit = WorkerExit(Arc::clone(&self.control));
        let consumer_exit = WorkerExit(Arc::clone(&self.control));

        let producer = {
            let control = Arc::clone(&self.control);
            let engine = Arc::clone(&self.engine);
            let text = text.to_string();
            let params = self.voice.synthesis_params();
            thread::Builder::new()
                .name("tts-producer".to_string())
                .spawn(move || {
                    let _exit = producer_exit;
                    run_producer(&control, &engine, &text, &params, tx);
                })
        };
        match producer {
            Ok(handle) => self.workers.push(handle),
            Err(e) => {
                self.control.fail(TtsError::Io(e));
                return Err(TtsError::InvalidState("failed to spawn producer"));
            }
        }

        let consumer = {
            let control = Arc::clone(&self.control);
            let gain = self.voice.gain;
            thread::Builder::new()
                .name("tts-consumer".to_string())
                .spawn(move || {
                    let _exit = consumer_exit;
                    run_consumer(&control, rx, gain);
                })
        };
        match consumer {
            Ok(handle) => self.workers.push(handle),
            Err(e) => {
                self.control.fail(TtsError::Io(e));
                return Err(TtsError::InvalidState("failed to spawn consumer"));
            }
        }
        Ok(())
    }

    fn abort(&self, reason: &str) {
        log::error!(
            "Session '{}' aborted, sink unavailable: {reason}",
            self.control.language
        );
        *self.control.state.lock() = SessionState::Cancelled;
        self.control.cancel.cancel();
        *self.control.outcome.lock() = Some(SessionOutcome::Failed(Arc::new(
            TtsError::SinkUnavailable(reason.to_string()),
        )));
    }

    /// Cancel the session and discard buffered audio.
    ///
    /// Sets the cancellation flag, flushes the sink (releasing a blocked
    /// write) and wakes both workers. Idempotent, and a no-op once the
    /// session has completed.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Wait for both workers to exit and return the outcome.
    ///
    /// A session that was never started reports `Cancelled`.
    pub fn wait(mut self) -> SessionOutcome {
        self.join_workers();
        self.control
            .outcome
            .lock()
            .clone()
            .unwrap_or(SessionOutcome::Cancelled)
    }

    fn join_workers(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Session worker for '{}' panicked", self.control.language);
            }
        }
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.control.stop();
            self.join_workers();
        }
    }
}

fn run_producer(
    control: &SessionControl,
    engine: &CachedEngine,
    text: &str,
    params: &SynthesisParams,
    tx: Sender<AudioChunk>,
) {
    match stream::produce(engine, text, params, &tx, &control.cancel) {
        Ok(GenerateOutcome::Finished) => {
            control.transition(SessionState::Producing, SessionState::Draining);
        }
        Ok(GenerateOutcome::Stopped) => {}
        Err(e) => control.fail(e),
    }
    // Closing the channel lets the consumer drain and finish.
    drop(tx);
}

fn run_consumer(control: &SessionControl, rx: Receiver<AudioChunk>, gain: f32) {
    let mut chunks = 0usize;
    let mut samples = 0usize;
    for mut chunk in ChunkStream::new(rx, control.cancel.clone()) {
        for sample in chunk.iter_mut() {
            *sample *= gain;
        }
        match control.sink.write(&chunk) {
            Ok(written) => {
                chunks += 1;
                samples += written;
            }
            Err(e) => {
                control.fail(e);
                break;
            }
        }
    }
    log::debug!(
        "Session '{}' wrote {chunks} chunks ({samples} samples)",
        control.language
    );
    control.transition(SessionState::Draining, SessionState::Completed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::scripted::ScriptedEngine;
    use crate::sink::testing::{exclusive_output, ManualDevice, RecordingSink};
    use crate::sink::BufferedSink;
    use std::time::Duration;

    fn cached(engine: ScriptedEngine) -> Arc<CachedEngine> {
        Arc::new(CachedEngine::new("eng", Box::new(engine)))
    }

    fn voice(gain: f32) -> VoiceParams {
        VoiceParams {
            gain,
            ..VoiceParams::default()
        }
    }

    #[test]
    fn hello_writes_three_chunks_then_completes() {
        let sink = Arc::new(RecordingSink::default());
        let mut session = StreamingSession::new(
            cached(ScriptedEngine::numbered(22050, 3, 1024)),
            voice(1.0),
            sink.clone(),
            4,
        );
        session.start("hello").unwrap();
        let handle = session.handle();

        assert!(session.wait().is_completed());
        assert_eq!(handle.state(), SessionState::Completed);

        let writes = sink.writes();
        assert_eq!(writes.len(), 3);
        for (i, write) in writes.iter().enumerate() {
            assert_eq!(write.len(), 1024);
            assert!(write.iter().all(|&s| s == (i + 1) as f32));
        }
        assert_eq!(*sink.opened.lock(), vec![(22050, 1)]);
        assert_eq!(sink.flush_count(), 0);
    }

    #[test]
    fn chunks_arrive_in_order_through_a_small_channel() {
        let chunks: Vec<Vec<f32>> = (0..64).map(|i| vec![i as f32, -(i as f32)]).collect();
        let sink = Arc::new(RecordingSink::default());
        let mut session = StreamingSession::new(
            cached(ScriptedEngine::new(16000, chunks.clone())),
            voice(1.0),
            sink.clone(),
            1,
        );
        session.start("ordering").unwrap();
        assert!(session.wait().is_completed());
        assert_eq!(sink.writes(), chunks);
    }

    #[test]
    fn gain_scales_every_sample() {
        for gain in [0.0f32, 0.5, 1.0] {
            let chunks = vec![vec![0.25, -0.5, 1.0], vec![0.75]];
            let sink = Arc::new(RecordingSink::default());
            let mut session = StreamingSession::new(
                cached(ScriptedEngine::new(22050, chunks.clone())),
                voice(gain),
                sink.clone(),
                2,
            );
            session.start("gain").unwrap();
            assert!(session.wait().is_completed());

            let expected: Vec<Vec<f32>> = chunks
                .iter()
                .map(|c| c.iter().map(|s| s * gain).collect())
                .collect();
            assert_eq!(sink.writes(), expected, "gain {gain}");
        }
    }

    #[test]
    fn stop_during_production_cancels_promptly() {
        let scripted =
            ScriptedEngine::numbered(22050, 200, 64).with_step_delay(Duration::from_millis(5));
        let emitted = Arc::clone(&scripted.emitted);
        let sink = Arc::new(RecordingSink::default());
        let mut session = StreamingSession::new(cached(scripted), voice(1.0), sink.clone(), 2);
        session.start("a long text").unwrap();

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        session.stop();
        assert_eq!(session.state(), SessionState::Cancelled);

        assert!(matches!(session.wait(), SessionOutcome::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(emitted.load(Ordering::SeqCst) < 200);

        let writes = sink.writes();
        assert!(writes.len() <= emitted.load(Ordering::SeqCst));
        // Whatever reached the sink is a prefix of the production order.
        for (i, write) in writes.iter().enumerate() {
            assert_eq!(write[0], (i + 1) as f32);
        }
    }

    #[test]
    fn stop_twice_flushes_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut session = StreamingSession::new(
            cached(
                ScriptedEngine::numbered(22050, 100, 16).with_step_delay(Duration::from_millis(5)),
            ),
            voice(1.0),
            sink.clone(),
            2,
        );
        session.start("twice").unwrap();
        session.stop();
        session.stop();
        session.handle().stop();

        assert!(matches!(session.wait(), SessionOutcome::Cancelled));
        assert_eq!(sink.flush_count(), 1);
    }

    #[test]
    fn stop_after_completion_changes_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let mut session = StreamingSession::new(
            cached(ScriptedEngine::numbered(22050, 2, 16)),
            voice(1.0),
            sink.clone(),
            2,
        );
        session.start("done").unwrap();
        let handle = session.handle();
        assert!(session.wait().is_completed());

        handle.stop();
        assert_eq!(handle.state(), SessionState::Completed);
        assert!(handle.outcome().unwrap().is_completed());
        assert_eq!(sink.flush_count(), 0);
    }

    #[test]
    fn synthesis_error_ends_session_as_failed() {
        let sink = Arc::new(RecordingSink::default());
        let mut session = StreamingSession::new(
            cached(ScriptedEngine::numbered(22050, 5, 16).failing_at(2)),
            voice(1.0),
            sink.clone(),
            4,
        );
        session.start("broken").unwrap();
        let handle = session.handle();

        match session.wait() {
            SessionOutcome::Failed(e) => assert!(matches!(*e, TtsError::Synthesis(_))),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(handle.state(), SessionState::Cancelled);
        assert!(sink.writes().len() <= 2);
    }

    #[test]
    fn sink_error_ends_session_and_releases_producer() {
        let sink = Arc::new(RecordingSink::failing());
        let mut session = StreamingSession::new(
            cached(ScriptedEngine::numbered(22050, 50, 16)),
            voice(1.0),
            sink,
            1,
        );
        session.start("no device").unwrap();

        match session.wait() {
            SessionOutcome::Failed(e) => assert!(matches!(*e, TtsError::SinkUnavailable(_))),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn start_requires_idle() {
        let sink = Arc::new(RecordingSink::default());
        let mut session = StreamingSession::new(
            cached(ScriptedEngine::numbered(22050, 1, 16)),
            voice(1.0),
            sink,
            1,
        );
        session.start("once").unwrap();
        assert!(matches!(
            session.start("twice"),
            Err(TtsError::InvalidState(_))
        ));
        assert!(session.wait().is_completed());
    }

    #[test]
    fn dropping_a_running_session_stops_it() {
        let scripted =
            ScriptedEngine::numbered(22050, 500, 16).with_step_delay(Duration::from_millis(5));
        let emitted = Arc::clone(&scripted.emitted);
        let sink = Arc::new(RecordingSink::default());
        let mut session = StreamingSession::new(cached(scripted), voice(1.0), sink.clone(), 2);
        session.start("background").unwrap();
        let handle = session.handle();

        thread::sleep(Duration::from_millis(30));
        drop(session);

        assert_eq!(handle.state(), SessionState::Cancelled);
        assert!(matches!(handle.outcome(), Some(SessionOutcome::Cancelled)));
        assert!(emitted.load(Ordering::SeqCst) < 500);
    }

    #[test]
    fn stop_releases_consumer_blocked_on_full_sink() {
        let _guard = exclusive_output();
        let device = Arc::new(ManualDevice::default());
        // The device never renders, so the sink fills and blocks the writer.
        let sink = Arc::new(BufferedSink::new(Arc::clone(&device), 256));
        let mut session = StreamingSession::new(
            cached(ScriptedEngine::numbered(22050, 10, 1024)),
            voice(1.0),
            sink.clone(),
            2,
        );
        session.start("blocked").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(session.state(), SessionState::Producing);

        let start = Instant::now();
        session.stop();
        assert!(matches!(session.wait(), SessionOutcome::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(device.queue().is_empty());
    }

    /// Buffered sink whose second write is held back until `stop_and_flush`
    /// has run, so the write reaches the queue after the flush.
    struct LateWriteSink {
        inner: BufferedSink<Arc<ManualDevice>>,
        writes: AtomicUsize,
        stopped_tx: Sender<()>,
        stopped_rx: Receiver<()>,
    }

    impl PlaybackSink for LateWriteSink {
        fn open(&self, sample_rate: u32, channels: u16) -> Result<(), TtsError> {
            self.inner.open(sample_rate, channels)
        }

        fn write(&self, samples: &[f32]) -> Result<usize, TtsError> {
            if self.writes.fetch_add(1, Ordering::SeqCst) == 1 {
                let _ = self.stopped_rx.recv_timeout(Duration::from_secs(2));
            }
            self.inner.write(samples)
        }

        fn stop_and_flush(&self) {
            self.inner.stop_and_flush();
            let _ = self.stopped_tx.try_send(());
        }

        fn close(&self) {
            self.inner.close();
        }
    }

    #[test]
    fn write_landing_after_stop_is_not_played() {
        let _guard = exclusive_output();
        let device = Arc::new(ManualDevice::default());
        let (stopped_tx, stopped_rx) = crossbeam_channel::bounded(1);
        let sink = Arc::new(LateWriteSink {
            inner: BufferedSink::new(Arc::clone(&device), 4096),
            writes: AtomicUsize::new(0),
            stopped_tx,
            stopped_rx,
        });
        let mut session = StreamingSession::new(
            cached(ScriptedEngine::numbered(22050, 5, 64)),
            voice(1.0),
            sink.clone(),
            4,
        );
        session.start("late").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.writes.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sink.writes.load(Ordering::SeqCst), 2);
        assert_eq!(device.queue().len(), 64);

        session.stop();
        assert!(matches!(session.wait(), SessionOutcome::Cancelled));
        assert!(device.queue().is_empty());
    }

    #[test]
    fn voice_params_reach_the_engine() {
        let scripted = ScriptedEngine::numbered(22050, 2, 8);
        let params_seen = Arc::clone(&scripted.params_seen);
        let voice = VoiceParams {
            speaker_id: 2,
            speed: 1.5,
            gain: 1.0,
        };
        let mut session = StreamingSession::new(
            cached(scripted),
            voice,
            Arc::new(RecordingSink::default()),
            2,
        );
        session.start("params").unwrap();
        assert!(session.wait().is_completed());

        assert_eq!(
            *params_seen.lock(),
            vec![SynthesisParams {
                speaker_id: 2,
                speed: 1.5
            }]
        );
    }

    #[test]
    fn events_report_start_and_finish() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut session = StreamingSession::new(
            cached(ScriptedEngine::numbered(22050, 2, 8)),
            voice(1.0),
            Arc::new(RecordingSink::default()),
            2,
        )
        .with_events(tx);
        session.start("events").unwrap();
        assert!(session.wait().is_completed());

        assert!(matches!(
            rx.recv().unwrap(),
            TtsEvent::SessionStarted { language } if language == "eng"
        ));
        assert!(matches!(
            rx.recv().unwrap(),
            TtsEvent::SessionFinished { outcome: SessionOutcome::Completed, .. }
        ));
    }

    #[test]
    fn unopenable_sink_fails_start() {
        struct NoDevice;
        impl PlaybackSink for NoDevice {
            fn open(&self, _: u32, _: u16) -> Result<(), TtsError> {
                Err(TtsError::SinkUnavailable("no output device".to_string()))
            }
            fn write(&self, _: &[f32]) -> Result<usize, TtsError> {
                unreachable!()
            }
            fn stop_and_flush(&self) {}
            fn close(&self) {}
        }

        let mut session = StreamingSession::new(
            cached(ScriptedEngine::numbered(22050, 2, 8)),
            voice(1.0),
            Arc::new(NoDevice),
            2,
        );
        let err = session.start("silence").unwrap_err();
        assert!(matches!(err, TtsError::SinkUnavailable(_)));
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(matches!(session.wait(), SessionOutcome::Failed(_)));
    }
}
