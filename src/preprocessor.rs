//! The audio end of the pipeline: the slicer stage cutting the
//! performance into overlapping frames, and the feature-extractor stage
//! turning each frame into a semitone spectrum.
//!
//! Both stages run on their own thread and talk through bounded
//! channels; `None` marks the end of a stream. The same machinery is
//! reused inline (no threads, no pacing) to build the score feature
//! sequence before the performance starts.
use crate::config::{Config, Mode};
use crate::cqt::{self, Extractor};
use crate::{ExtractedFeature, SegnoError, SegnoResult};
use log::debug;
use std::sync::mpsc::{Receiver, SyncSender};
use std::time::{Duration, Instant};

/// Fixed amount subtracted from every simulated-live sleep to absorb the
/// cost of slicing and sending itself.
const PACING_COMPENSATION: Duration = Duration::from_micros(500);

/// Emits successive frames of `frame_length` samples every `hop_length`
/// samples, zero-padding the tail, optionally paced to wall-clock as if
/// the audio were arriving live.
pub(crate) struct Slicer {
    audio: Vec<f32>,
    hop_length: usize,
    frame_length: usize,
    sample_rate: u32,
    simulate_performance: bool,
    output: SyncSender<Option<Vec<f32>>>,
}

impl Slicer {
    pub fn new(
        audio: Vec<f32>,
        hop_length: usize,
        frame_length: usize,
        sample_rate: u32,
        simulate_performance: bool,
        output: SyncSender<Option<Vec<f32>>>,
    ) -> Slicer {
        Slicer {
            audio,
            hop_length,
            frame_length,
            sample_rate,
            simulate_performance,
            output,
        }
    }

    pub fn start(self) {
        let rate = f64::from(self.sample_rate);
        let hop_gap = Duration::from_secs_f64(self.hop_length as f64 / rate);
        if self.simulate_performance {
            // A live source would need one full frame before the first
            // slice can exist.
            std::thread::sleep(Duration::from_secs_f64(self.frame_length as f64 / rate));
        }

        let mut last_emit = Instant::now();
        for start in (0..self.audio.len()).step_by(self.hop_length) {
            let end = self.audio.len().min(start + self.frame_length);
            let mut frame = self.audio[start..end].to_vec();
            frame.resize(self.frame_length, 0.);
            if self.output.send(Some(frame)).is_err() {
                debug!("slicer output closed, stopping early");
                return;
            }
            let emitted_at = Instant::now();
            if self.simulate_performance {
                let elapsed = emitted_at.duration_since(last_emit);
                if let Some(nap) = hop_gap
                    .checked_sub(elapsed)
                    .and_then(|gap| gap.checked_sub(PACING_COMPENSATION))
                {
                    std::thread::sleep(nap);
                }
            }
            last_emit = emitted_at;
        }
        let _ = self.output.send(None);
    }
}

/// Turns each incoming audio frame into one feature vector.
pub(crate) struct FeatureExtractor {
    extractor: Extractor,
    input: Receiver<Option<Vec<f32>>>,
    output: SyncSender<Option<ExtractedFeature>>,
}

impl FeatureExtractor {
    pub fn new(
        config: &Config,
        input: Receiver<Option<Vec<f32>>>,
        output: SyncSender<Option<ExtractedFeature>>,
    ) -> SegnoResult<FeatureExtractor> {
        let extractor = Extractor::online(
            config.cqt,
            config.fmin,
            config.fmax,
            config.frame_len(),
            config.hop_len,
            config.sample_rate,
        )?;
        Ok(FeatureExtractor {
            extractor,
            input,
            output,
        })
    }

    pub fn start(self) {
        loop {
            match self.input.recv() {
                Ok(Some(frame)) => {
                    let feature = self.extractor.extract(&frame);
                    if self.output.send(Some(feature)).is_err() {
                        debug!("feature output closed, stopping early");
                        return;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        let _ = self.output.send(None);
    }
}

/// Feature sequence for a whole waveform under `config`: used to build
/// the score sequence, and the performance sequence in offline mode.
///
/// In online mode this is exactly what the streaming stages would
/// produce frame by frame.
pub(crate) fn offline_features(
    config: &Config,
    audio: &[f32],
) -> SegnoResult<Vec<ExtractedFeature>> {
    if audio.is_empty() {
        return Err(SegnoError::AnalysisError(
            "cannot extract features from an empty waveform".to_string(),
        ));
    }
    match config.mode {
        Mode::Online => {
            let extractor = Extractor::online(
                config.cqt,
                config.fmin,
                config.fmax,
                config.frame_len(),
                config.hop_len,
                config.sample_rate,
            )?;
            Ok((0..audio.len())
                .step_by(config.hop_len)
                .map(|start| {
                    let end = audio.len().min(start + config.frame_len());
                    extractor.extract(&audio[start..end])
                })
                .collect())
        }
        Mode::Offline => cqt::extract_offline(
            config.cqt,
            audio,
            config.fmin,
            config.fmax,
            config.frame_len(),
            config.hop_len,
            config.sample_rate,
        ),
    }
}
