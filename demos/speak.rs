//! Install a bundled Piper voice and speak a line through the playback pipeline.
//!
//! ```text
//! cargo run --example speak --features piper,cpal -- models/vits-piper-en_US-amy-low eng "Hello there."
//! ```
//!
//! Without the `cpal` feature the audio goes to `output.wav`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tts_stream::{
    assets::install_model,
    cache::EngineCache,
    config::TtsConfigBuilder,
    engines::piper::PiperLoader,
    events::TtsEvent,
    registry::{JsonRegistry, LanguageProfile, LanguageRegistry, ModelType},
    sink::PlaybackSink,
    speaker::Speaker,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let bundle = PathBuf::from(args.next().unwrap_or_else(|| "models/vits-piper".to_string()));
    let lang = args.next().unwrap_or_else(|| "eng".to_string());
    let text = args
        .next()
        .unwrap_or_else(|| "Hello! This is an offline voice, streamed as it is synthesized.".to_string());

    let config = TtsConfigBuilder::default()
        .models_dir("tts-data/models")
        .registry_path(Some(PathBuf::from("tts-data/registry.json")))
        .build()?;
    let registry = Arc::new(JsonRegistry::from_config(&config)?);

    if registry.get(&lang).is_none() {
        let model_file = std::fs::read_dir(&bundle)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .find(|name| name.ends_with(".onnx"))
            .unwrap_or_else(|| "model.onnx".to_string());
        let profile = LanguageProfile::new(&lang, "", model_file, ModelType::VitsPiper);
        let dir = install_model(&bundle, &config.models_dir, profile, registry.as_ref())?;
        println!("Installed '{lang}' into {}", dir.display());
    }
    println!(
        "Installed languages: {:?}",
        registry
            .list_installed()
            .iter()
            .map(|p| p.id().to_string())
            .collect::<Vec<_>>()
    );

    let cache = Arc::new(EngineCache::new(
        registry.clone(),
        Arc::new(PiperLoader::from_config(&config)),
    ));
    let sink = output_sink(&config);
    let (speaker, events) = Speaker::new(cache, sink, &config)?;

    let load_start = Instant::now();
    speaker.set_language(&lang);
    speaker.speak(text);

    let mut speak_start = None;
    while let Ok(event) = events.recv_timeout(Duration::from_secs(120)) {
        match event {
            TtsEvent::LanguageChanged { language, sample_rate } => {
                println!(
                    "Loaded '{language}' ({sample_rate} Hz) in {:.2?}",
                    load_start.elapsed()
                );
            }
            TtsEvent::SessionStarted { .. } => speak_start = Some(Instant::now()),
            TtsEvent::SessionFinished { outcome, .. } => {
                if let Some(start) = speak_start {
                    println!("Finished in {:.2?}: {outcome:?}", start.elapsed());
                }
                break;
            }
            TtsEvent::Error(e) => {
                eprintln!("Error: {e}");
                break;
            }
            other => println!("{other:?}"),
        }
    }

    // Let the device drain what is still buffered.
    std::thread::sleep(Duration::from_millis(config.sink_buffer_ms as u64));
    Ok(())
}

#[cfg(feature = "cpal")]
fn output_sink(config: &tts_stream::config::TtsConfig) -> Arc<dyn PlaybackSink> {
    use tts_stream::sink::{BufferedSink, CpalDevice};
    Arc::new(BufferedSink::new(
        CpalDevice::new(),
        config.sink_buffer_samples(22050),
    ))
}

#[cfg(not(feature = "cpal"))]
fn output_sink(_config: &tts_stream::config::TtsConfig) -> Arc<dyn PlaybackSink> {
    println!("Writing audio to output.wav");
    Arc::new(tts_stream::sink::WavSink::new("output.wav"))
}
