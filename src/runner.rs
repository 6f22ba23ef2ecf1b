//! Pipeline assembly: score preprocessing, stage spawning, shutdown.
use crate::backend::{Backend, Sink};
use crate::config::{Config, DtwKind, Mode};
use crate::dtw::classical::ClassicalDtw;
use crate::dtw::oltw::Oltw;
use crate::preprocessor::{offline_features, FeatureExtractor, Slicer};
use crate::score::{self, AdditiveSynth, Synthesiser};
use crate::{decoder, SegnoResult};
use log::info;
use std::sync::mpsc::sync_channel;
use std::thread;
use std::time::Instant;

/// Capacity of every inter-stage channel; a producer blocks once its
/// consumer falls this many records behind.
const CHANNEL_CAPACITY: usize = 64;

/// Follow the configured performance through the configured score.
///
/// Builds the score side (note onsets, synthesised waveform, feature
/// sequence), decodes the performance, then runs the pipeline matching
/// the configured mode. Returns once every stage has drained.
pub fn run(config: &Config) -> SegnoResult<()> {
    info!(
        "following '{}' through '{}' ({} mode, {} dtw, {} cqt)",
        config.perf_wave_path.display(),
        config.score_midi_path.display(),
        config.mode,
        config.dtw,
        config.cqt
    );
    info!("begin: preprocess score");
    let score_notes = score::process_midi_to_note_info(&config.score_midi_path)?;
    info!("extracted {} note onsets from the score", score_notes.len());
    let note_index = score::group_note_onsets(&score_notes);

    let synthesiser = AdditiveSynth {
        sample_rate: config.sample_rate,
    };
    let score_audio = synthesiser.synthesise(&config.score_midi_path)?;
    let score_features = offline_features(config, &score_audio)?;
    info!(
        "score: {} samples, {} feature frames",
        score_audio.len(),
        score_features.len()
    );

    let performance_audio = decoder::decode(&config.perf_wave_path, config.sample_rate)?;
    info!("performance: {} samples", performance_audio.len());

    match config.mode {
        Mode::Online => run_online(config, note_index, score_features, performance_audio),
        Mode::Offline => run_offline(config, note_index, score_features, performance_audio),
    }
}

fn run_online(
    config: &Config,
    note_index: score::NoteIndex,
    score_features: Vec<crate::ExtractedFeature>,
    performance_audio: Vec<f32>,
) -> SegnoResult<()> {
    let (slice_tx, slice_rx) = sync_channel(CHANNEL_CAPACITY);
    let (feature_tx, feature_rx) = sync_channel(CHANNEL_CAPACITY);
    let (record_tx, record_rx) = sync_channel(CHANNEL_CAPACITY);
    let (start_tx, start_rx) = sync_channel(1);

    let slicer = Slicer::new(
        performance_audio,
        config.hop_len,
        config.frame_len(),
        config.sample_rate,
        config.simulate_performance,
        slice_tx,
    );
    let extractor = FeatureExtractor::new(config, slice_rx, feature_tx)?;
    let follower = Oltw::new(
        score_features,
        feature_rx,
        record_tx,
        config.search_window,
        config.max_run_count,
        config.weights,
    )?;
    let sink = Sink::open(&config.backend_output)?;
    let backend = Backend::new(config, note_index, record_rx, start_rx, sink);

    // Start from the back so every consumer is ready before the first
    // slice exists.
    let backend_handle = thread::spawn(move || backend.start());
    let follower_handle = thread::spawn(move || follower.start());
    let extractor_handle = thread::spawn(move || extractor.start());

    info!("starting performance");
    let _ = start_tx.send(Instant::now());
    let slicer_handle = thread::spawn(move || slicer.start());

    slicer_handle.join().unwrap();
    extractor_handle.join().unwrap();
    let follower_result = follower_handle.join().unwrap();
    let backend_result = backend_handle.join().unwrap();
    info!("all stages joined");

    follower_result?;
    backend_result
}

fn run_offline(
    config: &Config,
    note_index: score::NoteIndex,
    score_features: Vec<crate::ExtractedFeature>,
    performance_audio: Vec<f32>,
) -> SegnoResult<()> {
    let performance_features = offline_features(config, &performance_audio)?;
    info!(
        "performance feature sequence has {} frames",
        performance_features.len()
    );

    let (record_tx, record_rx) = sync_channel(CHANNEL_CAPACITY);
    let (start_tx, start_rx) = sync_channel(1);
    let sink = Sink::open(&config.backend_output)?;
    let backend = Backend::new(config, note_index, record_rx, start_rx, sink);
    let backend_handle = thread::spawn(move || backend.start());
    let _ = start_tx.send(Instant::now());

    let alignment_result = match config.dtw {
        DtwKind::Classical => {
            let dtw = ClassicalDtw::new(&performance_features, &score_features, config.weights)?;
            for pair in dtw.path() {
                if record_tx.send(Some(pair)).is_err() {
                    break;
                }
            }
            let _ = record_tx.send(None);
            Ok(())
        }
        DtwKind::Oltw => {
            let (feature_tx, feature_rx) = sync_channel(CHANNEL_CAPACITY);
            let follower = Oltw::new(
                score_features,
                feature_rx,
                record_tx,
                config.search_window,
                config.max_run_count,
                config.weights,
            )?;
            let feeder = thread::spawn(move || {
                for feature in performance_features {
                    if feature_tx.send(Some(feature)).is_err() {
                        return;
                    }
                }
                let _ = feature_tx.send(None);
            });
            let result = follower.start();
            feeder.join().unwrap();
            result
        }
    };

    let backend_result = backend_handle.join().unwrap();
    alignment_result?;
    backend_result
}
