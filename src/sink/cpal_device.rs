use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use super::{OutputDevice, OutputStream, SampleQueue};
use crate::TtsError;

/// Output through the default `cpal` host.
///
/// `cpal` streams are not `Send`, so each stream lives on its own thread and
/// is torn down when the returned handle drops.
#[derive(Debug, Clone, Default)]
pub struct CpalDevice {
    /// Output device name; `None` uses the host default.
    device_name: Option<String>,
}

impl CpalDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(device_name: impl Into<String>) -> Self {
        Self {
            device_name: Some(device_name.into()),
        }
    }

    fn find_device(&self) -> Result<cpal::Device, TtsError> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host
                .default_output_device()
                .ok_or_else(|| TtsError::SinkUnavailable("no audio output device".to_string())),
            Some(name) => host
                .output_devices()
                .map_err(|e| TtsError::SinkUnavailable(e.to_string()))?
                .find(|d| d.name().is_ok_and(|n| &n == name))
                .ok_or_else(|| {
                    TtsError::SinkUnavailable(format!("output device '{name}' not found"))
                }),
        }
    }
}

struct CpalStream {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl OutputStream for CpalStream {}

impl Drop for CpalStream {
    fn drop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Audio output thread panicked");
            }
        }
    }
}

impl OutputDevice for CpalDevice {
    fn start(
        &self,
        sample_rate: u32,
        channels: u16,
        queue: Arc<SampleQueue>,
    ) -> Result<Box<dyn OutputStream>, TtsError> {
        let device = self.find_device()?;
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), TtsError>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let thread = thread::Builder::new()
            .name("tts-audio-out".to_string())
            .spawn(move || run_stream(device, sample_rate, channels, queue, ready_tx, stop_rx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(TtsError::SinkUnavailable(
                "audio output thread exited during setup".to_string(),
            )),
        }
    }
}

fn run_stream(
    device: cpal::Device,
    sample_rate: u32,
    channels: u16,
    queue: Arc<SampleQueue>,
    ready_tx: Sender<Result<(), TtsError>>,
    stop_rx: Receiver<()>,
) {
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut mono = Vec::new();
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels as usize;
            mono.resize(frames, 0.0);
            queue.render(&mut mono);
            for (frame, &sample) in data.chunks_mut(channels as usize).zip(&mono) {
                frame.fill(sample);
            }
        },
        |error| log::error!("Audio output stream error: {error}"),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(TtsError::SinkUnavailable(e.to_string())));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(TtsError::SinkUnavailable(e.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    // Keep the stream alive until the handle is dropped.
    let _ = stop_rx.recv();
    drop(stream);
}
