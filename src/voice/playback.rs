//! Fragment playback to speakers

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};
use tokio::sync::mpsc;

use crate::client::Player;
use crate::{Error, Result};

/// Plays MP3 fragments on the default output device
///
/// Each fragment plays on its own thread; when it ends (or is stopped) its
/// id is sent on the `ended` channel.
pub struct SpeakerPlayer {
    ended: mpsc::UnboundedSender<u64>,
    active: Option<Arc<AtomicBool>>,
}

impl SpeakerPlayer {
    /// Create a player reporting finished fragments on `ended`
    ///
    /// # Errors
    ///
    /// Returns error if there is no output device
    pub fn new(ended: mpsc::UnboundedSender<u64>) -> Result<Self> {
        let device = output_device()?;
        tracing::debug!(device = device.name().unwrap_or_default(), "audio playback initialized");
        Ok(Self {
            ended,
            active: None,
        })
    }
}

impl Player for SpeakerPlayer {
    fn play(&mut self, id: u64, audio: &[u8]) -> Result<()> {
        self.stop();

        let (samples, sample_rate) = decode_mp3(audio)?;
        let stop = Arc::new(AtomicBool::new(false));
        self.active = Some(Arc::clone(&stop));

        let ended = self.ended.clone();
        std::thread::Builder::new()
            .name(format!("speaker-{id}"))
            .spawn(move || {
                if let Err(e) = play_blocking(samples, sample_rate, &stop) {
                    tracing::warn!(id, error = %e, "speaker playback failed");
                }
                let _ = ended.send(id);
            })?;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.active.take() {
            stop.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for SpeakerPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn output_device() -> Result<Device> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))
}

fn output_config(device: &Device, sample_rate: u32) -> Result<StreamConfig> {
    let supports = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
    };

    // Fall back to stereo, duplicating the mono signal
    let supported = supports(1)
        .or_else(|| supports(2))
        .ok_or_else(|| Error::Audio(format!("no output config for {sample_rate} Hz")))?;

    Ok(supported.with_sample_rate(SampleRate(sample_rate)).config())
}

/// Play mono samples until done or `stop` is raised
fn play_blocking(samples: Vec<f32>, sample_rate: u32, stop: &AtomicBool) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let device = output_device()?;
    let config = output_config(&device, sample_rate)?;
    let channels = usize::from(config.channels);

    let sample_count = samples.len();
    let finished = Arc::new(AtomicBool::new(false));
    let finished_cb = Arc::clone(&finished);
    let mut position = 0usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or_else(|| {
                        finished_cb.store(true, Ordering::SeqCst);
                        0.0
                    });
                    frame.fill(sample);
                    position = (position + 1).min(samples.len());
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let duration_ms = (sample_count as u64 * 1000) / u64::from(sample_rate);
    let timeout = Duration::from_millis(duration_ms + 500);
    let start = Instant::now();

    while !finished.load(Ordering::SeqCst) && !stop.load(Ordering::SeqCst) {
        if start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    drop(stream);
    tracing::trace!(samples = sample_count, stopped = stop.load(Ordering::SeqCst), "fragment playback ended");
    Ok(())
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
///
/// # Errors
///
/// Returns error if the data is not decodable MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|pair| {
                        let left = f32::from(pair[0]) / 32768.0;
                        let right = f32::from(pair.get(1).copied().unwrap_or(pair[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Audio("no MP3 frames found".to_string()));
    }
    Ok((samples, sample_rate))
}
