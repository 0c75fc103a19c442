//! Per-language engine cache and the active-language state.
//!
//! [`EngineCache`] holds at most one loaded engine per language identifier.
//! Construction is single-flight: while one caller loads a language, every
//! other caller for the same language waits and then shares the result.
//!
//! The cache also owns the process-wide active-language state. It is empty
//! until the first [`EngineCache::set_active`], only ever repointed by
//! `set_active`, cleared when the active language is evicted, and dropped
//! with the cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::engines::EngineLoader;
use crate::registry::{LanguageProfile, LanguageRegistry, VoiceParams};
use crate::{SynthesisEngine, TtsError};

/// How often `set_active` reloads an engine that was evicted under it.
const ACTIVATE_ATTEMPTS: usize = 3;

/// A loaded engine shared between the cache and the sessions using it.
///
/// The inner mutex is held by a session's producer for the whole of a
/// `generate` call, so at most one producer drives an engine at a time.
pub struct CachedEngine {
    language: String,
    sample_rate: u32,
    engine: Mutex<Box<dyn SynthesisEngine>>,
}

impl CachedEngine {
    pub fn new(language: impl Into<String>, engine: Box<dyn SynthesisEngine>) -> Self {
        Self {
            language: language.into(),
            sample_rate: engine.sample_rate(),
            engine: Mutex::new(engine),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Exclusive access to the engine, waiting for any running producer.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn SynthesisEngine>> {
        self.engine.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, Box<dyn SynthesisEngine>>> {
        self.engine.try_lock()
    }

    /// Whether a producer is currently generating with this engine.
    pub fn is_busy(&self) -> bool {
        self.engine.is_locked()
    }
}

impl std::fmt::Debug for CachedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEngine")
            .field("language", &self.language)
            .field("sample_rate", &self.sample_rate)
            .field("busy", &self.is_busy())
            .finish()
    }
}

/// Snapshot of the active language taken by [`EngineCache::set_active`].
#[derive(Debug, Clone)]
pub struct ActiveLanguage {
    profile: LanguageProfile,
    engine: Arc<CachedEngine>,
    voice: VoiceParams,
}

impl ActiveLanguage {
    pub fn language(&self) -> &str {
        self.profile.id()
    }

    /// The registry record as it was when the language was activated.
    pub fn profile(&self) -> &LanguageProfile {
        &self.profile
    }

    pub fn engine(&self) -> &Arc<CachedEngine> {
        &self.engine
    }

    /// Current voice defaults for new sessions.
    pub fn voice(&self) -> VoiceParams {
        self.voice
    }
}

enum Slot {
    Loading,
    Ready(Arc<CachedEngine>),
}

pub struct EngineCache {
    registry: Arc<dyn LanguageRegistry>,
    loader: Arc<dyn EngineLoader>,
    slots: Mutex<HashMap<String, Slot>>,
    /// Signalled whenever a `Loading` slot resolves.
    loaded: Condvar,
    active: Mutex<Option<ActiveLanguage>>,
}

/// Clears a `Loading` slot left behind by a failed or panicking load.
struct LoadingGuard<'a> {
    cache: &'a EngineCache,
    language: &'a str,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self.cache.slots.lock();
        if matches!(slots.get(self.language), Some(Slot::Loading)) {
            slots.remove(self.language);
        }
        drop(slots);
        self.cache.loaded.notify_all();
    }
}

impl EngineCache {
    pub fn new(registry: Arc<dyn LanguageRegistry>, loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            registry,
            loader,
            slots: Mutex::new(HashMap::new()),
            loaded: Condvar::new(),
            active: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<dyn LanguageRegistry> {
        &self.registry
    }

    /// Return the engine for `language`, loading it on first use.
    ///
    /// Blocks for the duration of a model load. Concurrent callers for the
    /// same language wait for the one load in progress and receive the same
    /// instance. A failed load leaves nothing cached, so a later call retries.
    pub fn get_or_create(&self, language: &str) -> Result<Arc<CachedEngine>, TtsError> {
        let mut slots = self.slots.lock();
        loop {
            match slots.get(language) {
                Some(Slot::Ready(engine)) => return Ok(Arc::clone(engine)),
                Some(Slot::Loading) => self.loaded.wait(&mut slots),
                None => break,
            }
        }
        slots.insert(language.to_string(), Slot::Loading);
        drop(slots);

        let _guard = LoadingGuard {
            cache: self,
            language,
        };
        let engine = self.construct(language)?;
        self.slots
            .lock()
            .insert(language.to_string(), Slot::Ready(Arc::clone(&engine)));
        Ok(engine)
    }

    fn construct(&self, language: &str) -> Result<Arc<CachedEngine>, TtsError> {
        let profile = self
            .registry
            .get(language)
            .ok_or_else(|| TtsError::UnknownLanguage(language.to_string()))?;

        log::info!("Loading engine for '{language}' ({:?})", profile.model_type);
        let start = Instant::now();
        let engine = self.loader.load(&profile).map_err(|e| {
            log::warn!("Engine for '{language}' failed to load: {e}");
            e
        })?;
        let engine = Arc::new(CachedEngine::new(language, engine));
        log::info!(
            "Engine for '{language}' ready in {:.2?} ({} Hz)",
            start.elapsed(),
            engine.sample_rate()
        );
        Ok(engine)
    }

    /// The cached engine for `language`, without loading it.
    pub fn get(&self, language: &str) -> Option<Arc<CachedEngine>> {
        match self.slots.lock().get(language) {
            Some(Slot::Ready(engine)) => Some(Arc::clone(engine)),
            _ => None,
        }
    }

    pub fn contains(&self, language: &str) -> bool {
        self.get(language).is_some()
    }

    /// Number of loaded engines.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Languages with a loaded engine, sorted.
    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(language, _)| language.clone())
            .collect();
        languages.sort();
        languages
    }

    /// Remove the engine for `language`.
    ///
    /// Waits for a load in progress and for any producer currently
    /// generating with the engine, then drops the cache's reference. The
    /// model is released once the last session holding it finishes. Evicting
    /// the active language clears the active state. Returns `false` if
    /// nothing was cached.
    pub fn evict(&self, language: &str) -> bool {
        let mut slots = self.slots.lock();
        while matches!(slots.get(language), Some(Slot::Loading)) {
            self.loaded.wait(&mut slots);
        }
        let engine = match slots.get(language) {
            Some(Slot::Ready(engine)) => Arc::clone(engine),
            _ => return false,
        };
        drop(slots);

        if engine.is_busy() {
            log::debug!("Waiting for in-flight synthesis before evicting '{language}'");
        }
        let idle = engine.lock();
        let removed = self.remove_slot(language, &engine);
        drop(idle);

        if removed {
            self.clear_active_if(&engine);
            log::info!("Evicted engine for '{language}'");
        }
        removed
    }

    /// Like [`evict`](Self::evict), but fails with
    /// [`TtsError::CacheContention`] instead of waiting when the engine is
    /// loading or generating.
    pub fn try_evict(&self, language: &str) -> Result<bool, TtsError> {
        let slots = self.slots.lock();
        let engine = match slots.get(language) {
            Some(Slot::Ready(engine)) => Arc::clone(engine),
            Some(Slot::Loading) => return Err(TtsError::CacheContention(language.to_string())),
            None => return Ok(false),
        };
        drop(slots);

        let idle = engine
            .try_lock()
            .ok_or_else(|| TtsError::CacheContention(language.to_string()))?;
        let removed = self.remove_slot(language, &engine);
        drop(idle);

        if removed {
            self.clear_active_if(&engine);
            log::info!("Evicted engine for '{language}'");
        }
        Ok(removed)
    }

    fn remove_slot(&self, language: &str, engine: &Arc<CachedEngine>) -> bool {
        let mut slots = self.slots.lock();
        let same = matches!(slots.get(language), Some(Slot::Ready(cached)) if Arc::ptr_eq(cached, engine));
        if same {
            slots.remove(language);
        }
        same
    }

    fn clear_active_if(&self, engine: &Arc<CachedEngine>) {
        let mut active = self.active.lock();
        if active
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(&a.engine, engine))
        {
            log::info!("Cleared active language '{}'", engine.language());
            *active = None;
        }
    }

    /// Make `language` the active language.
    ///
    /// Loads the engine if needed, marks the language current in the registry
    /// and snapshots its stored voice parameters as the defaults for new
    /// sessions. On failure the previous active language stays in place.
    pub fn set_active(&self, language: &str) -> Result<Arc<CachedEngine>, TtsError> {
        for attempt in 1..=ACTIVATE_ATTEMPTS {
            let engine = self.get_or_create(language)?;
            let profile = self
                .registry
                .get(language)
                .ok_or_else(|| TtsError::UnknownLanguage(language.to_string()))?;
            self.registry.set_current(language)?;

            // Publish only while the slot still holds this engine. An evict
            // that removes it afterwards clears the active state again.
            let slots = self.slots.lock();
            let cached = matches!(
                slots.get(language),
                Some(Slot::Ready(current)) if Arc::ptr_eq(current, &engine)
            );
            if !cached {
                drop(slots);
                log::debug!("'{language}' was evicted during activation (attempt {attempt})");
                continue;
            }
            let voice = profile.voice();
            *self.active.lock() = Some(ActiveLanguage {
                profile,
                engine: Arc::clone(&engine),
                voice,
            });
            drop(slots);

            log::info!("Active language is now '{language}'");
            return Ok(engine);
        }
        Err(TtsError::EngineUnavailable {
            language: language.to_string(),
            reason: "evicted while being activated".to_string(),
        })
    }

    pub fn active(&self) -> Option<ActiveLanguage> {
        self.active.lock().clone()
    }

    /// Adjust the active language's voice defaults and write them back to the
    /// registry. Returns the updated snapshot.
    pub fn update_active_voice(
        &self,
        update: impl FnOnce(&mut VoiceParams),
    ) -> Result<ActiveLanguage, TtsError> {
        let mut active = self.active.lock();
        let current = active.as_mut().ok_or(TtsError::NoActiveLanguage)?;

        let mut voice = current.voice;
        update(&mut voice);
        self.registry.update_voice(current.language(), voice)?;
        current.voice = voice;
        Ok(current.clone())
    }
}
