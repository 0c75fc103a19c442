//! Asynchronous playback control surface.
//!
//! [`Speaker`] methods queue a command and return immediately. A dedicated
//! control thread executes the commands in order and reports what happened on
//! the [`TtsEvent`] receiver returned by [`Speaker::new`]. Serialising the
//! commands on one thread keeps the active language from being repointed
//! while a session is reading it: a language switch or a new utterance first
//! stops the running session and waits for it to wind down.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::cache::EngineCache;
use crate::config::TtsConfig;
use crate::events::TtsEvent;
use crate::registry::VoiceParams;
use crate::session::{SessionHandle, StreamingSession};
use crate::sink::PlaybackSink;
use crate::TtsError;

enum Command {
    Speak(String),
    Stop,
    SetLanguage(String),
    SetSpeed(f32),
    SetGain(f32),
    SetSpeakerId(u32),
    RemoveLanguage(String),
    Shutdown,
}

pub struct Speaker {
    cache: Arc<EngineCache>,
    commands: Sender<Command>,
    /// The latest session, reachable without a round trip through the
    /// control thread so `stop_speaking` takes effect immediately.
    current: Arc<Mutex<Option<SessionHandle>>>,
    worker: Option<JoinHandle<()>>,
}

impl Speaker {
    /// Start the control thread. Sessions write to `sink`, which is closed
    /// when the speaker is dropped.
    pub fn new(
        cache: Arc<EngineCache>,
        sink: Arc<dyn PlaybackSink>,
        config: &TtsConfig,
    ) -> Result<(Self, Receiver<TtsEvent>), TtsError> {
        config.validate()?;
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let (events, event_rx) = crossbeam_channel::unbounded();
        let current = Arc::new(Mutex::new(None));

        let worker = ControlWorker {
            cache: Arc::clone(&cache),
            sink,
            capacity: config.channel_capacity,
            channels: config.output_channels,
            events,
            current: Arc::clone(&current),
            session: None,
        };
        let worker = thread::Builder::new()
            .name("tts-control".to_string())
            .spawn(move || worker.run(command_rx))?;

        Ok((
            Self {
                cache,
                commands,
                current,
                worker: Some(worker),
            },
            event_rx,
        ))
    }

    /// Speak `text` with the active language, replacing anything playing.
    pub fn speak(&self, text: impl Into<String>) {
        self.send(Command::Speak(text.into()));
    }

    /// Stop the current utterance and discard its buffered audio.
    pub fn stop_speaking(&self) {
        if let Some(session) = self.current.lock().as_ref() {
            session.stop();
        }
        self.send(Command::Stop);
    }

    /// Switch to `language`, loading its engine if needed. Reports
    /// [`TtsEvent::LanguageChanged`], or an error with the previous language
    /// still active.
    pub fn set_language(&self, language: impl Into<String>) {
        self.send(Command::SetLanguage(language.into()));
    }

    /// Speech speed multiplier for the active language; must be positive.
    pub fn set_speed(&self, speed: f32) {
        self.send(Command::SetSpeed(speed));
    }

    /// Output gain for the active language; must be non-negative.
    pub fn set_gain(&self, gain: f32) {
        self.send(Command::SetGain(gain));
    }

    pub fn set_speaker_id(&self, speaker_id: u32) {
        self.send(Command::SetSpeakerId(speaker_id));
    }

    /// Uninstall `language`: stop it if it is speaking, evict its engine and
    /// drop it from the registry.
    pub fn remove_language(&self, language: impl Into<String>) {
        self.send(Command::RemoveLanguage(language.into()));
    }

    pub fn active_language(&self) -> Option<String> {
        self.cache.active().map(|active| active.language().to_string())
    }

    pub fn cache(&self) -> &Arc<EngineCache> {
        &self.cache
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("Speaker control thread is gone; command dropped");
        }
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        if let Some(session) = self.current.lock().as_ref() {
            session.stop();
        }
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Speaker control thread panicked");
            }
        }
    }
}

struct ControlWorker {
    cache: Arc<EngineCache>,
    sink: Arc<dyn PlaybackSink>,
    capacity: usize,
    channels: u16,
    events: Sender<TtsEvent>,
    current: Arc<Mutex<Option<SessionHandle>>>,
    session: Option<StreamingSession>,
}

impl ControlWorker {
    fn run(mut self, commands: Receiver<Command>) {
        for command in commands.iter() {
            match command {
                Command::Speak(text) => self.speak(&text),
                Command::Stop => self.finish_session(),
                Command::SetLanguage(language) => self.set_language(&language),
                Command::SetSpeed(speed) => {
                    if speed.is_finite() && speed > 0.0 {
                        self.update_voice(|voice| voice.speed = speed);
                    } else {
                        self.report(TtsError::InvalidParameter(format!(
                            "speed must be positive, got {speed}"
                        )));
                    }
                }
                Command::SetGain(gain) => {
                    if gain.is_finite() && gain >= 0.0 {
                        self.update_voice(|voice| voice.gain = gain);
                    } else {
                        self.report(TtsError::InvalidParameter(format!(
                            "gain must be non-negative, got {gain}"
                        )));
                    }
                }
                Command::SetSpeakerId(speaker_id) => {
                    self.update_voice(|voice| voice.speaker_id = speaker_id);
                }
                Command::RemoveLanguage(language) => self.remove_language(&language),
                Command::Shutdown => break,
            }
        }

        self.finish_session();
        self.sink.close();
        log::debug!("Speaker control thread exiting");
    }

    fn report(&self, error: TtsError) {
        log::warn!("{error}");
        let _ = self.events.send(TtsEvent::error(error));
    }

    /// Stop the running session, if any, and wait for its workers.
    fn finish_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop();
            session.wait();
        }
        *self.current.lock() = None;
    }

    fn speak(&mut self, text: &str) {
        if text.trim().is_empty() {
            self.report(TtsError::InvalidParameter("text is empty".to_string()));
            return;
        }
        self.finish_session();

        let Some(active) = self.cache.active() else {
            self.report(TtsError::NoActiveLanguage);
            return;
        };
        let mut session = StreamingSession::new(
            Arc::clone(active.engine()),
            active.voice(),
            Arc::clone(&self.sink),
            self.capacity,
        )
        .with_channels(self.channels)
        .with_events(self.events.clone());

        match session.start(text) {
            Ok(()) => {
                *self.current.lock() = Some(session.handle());
                self.session = Some(session);
            }
            Err(e) => self.report(e),
        }
    }

    fn set_language(&mut self, language: &str) {
        self.finish_session();
        match self.cache.set_active(language) {
            Ok(engine) => {
                let _ = self.events.send(TtsEvent::LanguageChanged {
                    language: language.to_string(),
                    sample_rate: engine.sample_rate(),
                });
            }
            Err(e) => self.report(e),
        }
    }

    fn update_voice(&mut self, update: impl FnOnce(&mut VoiceParams)) {
        match self.cache.update_active_voice(update) {
            Ok(active) => {
                let _ = self.events.send(TtsEvent::VoiceChanged {
                    language: active.language().to_string(),
                    voice: active.voice(),
                });
            }
            Err(e) => self.report(e),
        }
    }

    fn remove_language(&mut self, language: &str) {
        if self
            .session
            .as_ref()
            .is_some_and(|session| session.language() == language)
        {
            self.finish_session();
        }
        self.cache.evict(language);

        match self.cache.registry().remove(language) {
            Ok(true) => {
                log::info!("Removed language '{language}'");
                let _ = self.events.send(TtsEvent::LanguageRemoved {
                    language: language.to_string(),
                });
            }
            Ok(false) => self.report(TtsError::UnknownLanguage(language.to_string())),
            Err(e) => self.report(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::scripted::ScriptedEngine;
    use crate::engines::EngineLoader;
    use crate::registry::{JsonRegistry, LanguageProfile, LanguageRegistry, ModelType};
    use crate::session::SessionOutcome;
    use crate::sink::testing::RecordingSink;
    use crate::{SynthesisEngine, SynthesisParams};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        speaker: Speaker,
        events: Receiver<TtsEvent>,
        sink: Arc<RecordingSink>,
        registry: Arc<JsonRegistry>,
        /// Params passed to `generate` by either language, in call order.
        params: Arc<Mutex<Vec<SynthesisParams>>>,
    }

    /// "eng" speaks three short chunks; "deu" speaks slowly for a long time.
    fn fixture() -> Fixture {
        let registry = Arc::new(JsonRegistry::in_memory());
        for lang in ["eng", "deu"] {
            registry
                .add(LanguageProfile::new(lang, "", "model.onnx", ModelType::VitsPiper))
                .unwrap();
        }
        let params = Arc::new(Mutex::new(Vec::new()));
        let loader: Arc<dyn EngineLoader> = {
            let params = Arc::clone(&params);
            Arc::new(
                move |profile: &LanguageProfile| -> Result<Box<dyn SynthesisEngine>, TtsError> {
                    let mut engine = match profile.id() {
                        "eng" => ScriptedEngine::numbered(22050, 3, 1024),
                        _ => ScriptedEngine::numbered(16000, 100, 64)
                            .with_step_delay(Duration::from_millis(5)),
                    };
                    engine.params_seen = Arc::clone(&params);
                    Ok(Box::new(engine))
                },
            )
        };
        let cache = Arc::new(EngineCache::new(registry.clone(), loader));
        let sink = Arc::new(RecordingSink::default());
        let (speaker, events) =
            Speaker::new(cache, sink.clone(), &TtsConfig::default()).unwrap();
        Fixture {
            speaker,
            events,
            sink,
            registry,
            params,
        }
    }

    /// Wait for the first event matching `pred`, skipping others.
    fn expect_event(events: &Receiver<TtsEvent>, pred: impl Fn(&TtsEvent) -> bool) -> TtsEvent {
        loop {
            let event = events.recv_timeout(TIMEOUT).expect("timed out waiting for event");
            if pred(&event) {
                return event;
            }
        }
    }

    fn finished(events: &Receiver<TtsEvent>) -> SessionOutcome {
        match expect_event(events, |e| matches!(e, TtsEvent::SessionFinished { .. })) {
            TtsEvent::SessionFinished { outcome, .. } => outcome,
            _ => unreachable!(),
        }
    }

    #[test]
    fn speak_requires_an_active_language() {
        let f = fixture();
        f.speaker.speak("hello");
        let event = expect_event(&f.events, |_| true);
        assert!(matches!(event, TtsEvent::Error(e) if matches!(*e, TtsError::NoActiveLanguage)));
    }

    #[test]
    fn speak_plays_all_chunks_of_active_language() {
        let f = fixture();
        f.speaker.set_language("eng");
        let event = expect_event(&f.events, |_| true);
        assert!(matches!(
            event,
            TtsEvent::LanguageChanged { sample_rate: 22050, .. }
        ));
        assert_eq!(f.speaker.active_language().as_deref(), Some("eng"));

        f.speaker.speak("hello");
        assert!(finished(&f.events).is_completed());
        let writes = f.sink.writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w.len() == 1024));
    }

    #[test]
    fn blank_text_is_rejected() {
        let f = fixture();
        f.speaker.set_language("eng");
        f.speaker.speak("  \n");
        let event = expect_event(&f.events, |e| matches!(e, TtsEvent::Error(_)));
        assert!(matches!(event, TtsEvent::Error(e) if matches!(*e, TtsError::InvalidParameter(_))));
        assert!(f.sink.writes().is_empty());
    }

    #[test]
    fn gain_change_applies_to_next_session_and_persists() {
        let f = fixture();
        f.speaker.set_language("eng");
        f.speaker.set_gain(0.5);
        let event = expect_event(&f.events, |e| matches!(e, TtsEvent::VoiceChanged { .. }));
        assert!(matches!(event, TtsEvent::VoiceChanged { voice, .. } if voice.gain == 0.5));
        assert_eq!(f.registry.get("eng").unwrap().gain, 0.5);

        f.speaker.speak("quieter");
        assert!(finished(&f.events).is_completed());
        let writes = f.sink.writes();
        assert_eq!(writes[0][0], 0.5);
        assert_eq!(writes[2][0], 1.5);
    }

    #[test]
    fn voice_change_during_playback_waits_for_next_session() {
        let f = fixture();
        f.speaker.set_language("deu");
        f.speaker.speak("erster Satz");
        expect_event(&f.events, |e| matches!(e, TtsEvent::SessionStarted { .. }));
        f.speaker.set_gain(0.0);
        f.speaker.set_speed(2.0);

        let mut voice_changes = 0;
        let outcome = loop {
            match f.events.recv_timeout(TIMEOUT).expect("timed out waiting for event") {
                TtsEvent::VoiceChanged { .. } => voice_changes += 1,
                TtsEvent::SessionFinished { outcome, .. } => break outcome,
                _ => {}
            }
        };
        assert_eq!(voice_changes, 2);
        assert!(outcome.is_completed());

        // The running session kept the voice it started with.
        let writes = f.sink.writes();
        assert_eq!(writes.len(), 100);
        for (i, write) in writes.iter().enumerate() {
            assert!(write.iter().all(|&s| s == (i + 1) as f32));
        }
        assert_eq!(f.params.lock()[0].speed, 1.0);

        f.speaker.speak("zweiter Satz");
        assert!(finished(&f.events).is_completed());
        let params = f.params.lock().clone();
        assert_eq!(params.len(), 2);
        assert_eq!(params[1].speed, 2.0);
        let writes = f.sink.writes();
        assert_eq!(writes.len(), 200);
        assert!(writes[100..].iter().all(|w| w.iter().all(|&s| s == 0.0)));
    }

    #[test]
    fn speaker_id_and_speed_reach_the_engine() {
        let f = fixture();
        f.speaker.set_language("eng");
        f.speaker.set_speaker_id(4);
        f.speaker.set_speed(0.75);
        f.speaker.speak("hello");
        assert!(finished(&f.events).is_completed());

        assert_eq!(
            *f.params.lock(),
            vec![SynthesisParams {
                speaker_id: 4,
                speed: 0.75
            }]
        );
    }

    #[test]
    fn invalid_speed_is_reported() {
        let f = fixture();
        f.speaker.set_language("eng");
        f.speaker.set_speed(0.0);
        let event = expect_event(&f.events, |e| matches!(e, TtsEvent::Error(_)));
        assert!(matches!(event, TtsEvent::Error(e) if matches!(*e, TtsError::InvalidParameter(_))));
        assert_eq!(f.registry.get("eng").unwrap().speed, 1.0);
    }

    #[test]
    fn stop_speaking_cancels_current_session() {
        let f = fixture();
        f.speaker.set_language("deu");
        expect_event(&f.events, |e| matches!(e, TtsEvent::LanguageChanged { .. }));

        f.speaker.speak("ein langer Text");
        expect_event(&f.events, |e| matches!(e, TtsEvent::SessionStarted { .. }));
        thread::sleep(Duration::from_millis(30));
        f.speaker.stop_speaking();

        assert!(matches!(finished(&f.events), SessionOutcome::Cancelled));
        assert!(f.sink.flush_count() >= 1);
    }

    #[test]
    fn new_utterance_replaces_the_playing_one() {
        let f = fixture();
        f.speaker.set_language("deu");
        f.speaker.speak("first");
        expect_event(&f.events, |e| matches!(e, TtsEvent::SessionStarted { .. }));
        f.speaker.speak("second");

        assert!(matches!(finished(&f.events), SessionOutcome::Cancelled));
        expect_event(&f.events, |e| matches!(e, TtsEvent::SessionStarted { .. }));
        f.speaker.stop_speaking();
        assert!(matches!(finished(&f.events), SessionOutcome::Cancelled));
    }

    #[test]
    fn removing_the_speaking_language_stops_it_first() {
        let f = fixture();
        f.speaker.set_language("deu");
        f.speaker.speak("wird entfernt");
        expect_event(&f.events, |e| matches!(e, TtsEvent::SessionStarted { .. }));

        f.speaker.remove_language("deu");
        assert!(matches!(finished(&f.events), SessionOutcome::Cancelled));
        let event = expect_event(&f.events, |e| matches!(e, TtsEvent::LanguageRemoved { .. }));
        assert!(matches!(event, TtsEvent::LanguageRemoved { language } if language == "deu"));

        assert!(f.registry.get("deu").is_none());
        assert!(!f.speaker.cache().contains("deu"));
        assert!(f.speaker.active_language().is_none());
    }

    #[test]
    fn failed_switch_keeps_previous_language() {
        let f = fixture();
        f.speaker.set_language("eng");
        f.speaker.set_language("fra");
        let event = expect_event(&f.events, |e| matches!(e, TtsEvent::Error(_)));
        assert!(matches!(event, TtsEvent::Error(e) if matches!(*e, TtsError::UnknownLanguage(_))));
        assert_eq!(f.speaker.active_language().as_deref(), Some("eng"));
    }
}
