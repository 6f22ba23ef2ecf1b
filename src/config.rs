//! Runtime configuration for a following session, and its sanitisation.
//!
//! [Config::sanitize] reproduces the checks the command line performs
//! before a pipeline is allowed to start, including the quantisation of
//! the frequency bounds to the nearest equal-temperament note.
use crate::dtw::DirectionWeights;
use crate::utils::quantise_hz_midi;
use crate::{SegnoError, SegnoResult, DEFAULT_SAMPLE_RATE};
use log::info;
use std::path::PathBuf;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
/// Whether the performance is streamed or aligned as a whole.
pub enum Mode {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
/// Alignment algorithm.
pub enum DtwKind {
    /// Online time warping, the streaming follower.
    Oltw,
    /// Full-matrix dynamic time warping, offline only.
    Classical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
/// Feature-extractor variant.
pub enum CqtKind {
    /// Sliced constant-Q transform, the streaming default.
    Nsgt,
    /// Pseudo constant-Q: one full-resolution spectrum per frame.
    LibrosaPseudo,
    /// Hybrid constant-Q; shares the frame-spectrum approximation.
    LibrosaHybrid,
    /// Full constant-Q over the whole waveform, offline only.
    Librosa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
/// What the backend writes to its sink.
pub enum BackendKind {
    /// MIREX alignment lines, one per detected score note.
    Alignment,
    /// One score timestamp (decimal seconds) per accepted record.
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Where backend output goes.
pub enum SinkSpec {
    Stdout,
    Stderr,
    /// One line per UDP datagram, mirrored to stderr.
    Udp { host: String, port: u16 },
    /// Text file, truncated on open.
    File(PathBuf),
}

impl FromStr for SinkSpec {
    type Err = SegnoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(SinkSpec::Stdout),
            "stderr" => Ok(SinkSpec::Stderr),
            other => {
                if let Some(rest) = other.strip_prefix("udp:") {
                    let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
                        SegnoError::ConfigError(format!(
                            "udp sink must look like udp:<host>:<port>, got `{other}`"
                        ))
                    })?;
                    let port = port.parse::<u16>().map_err(|_| {
                        SegnoError::ConfigError(format!("invalid udp port in `{other}`"))
                    })?;
                    Ok(SinkSpec::Udp {
                        host: host.to_string(),
                        port,
                    })
                } else {
                    Ok(SinkSpec::File(PathBuf::from(other)))
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Everything a following session needs to know.
///
/// Build one with [Config::new], tweak fields, then call
/// [sanitize](Config::sanitize) before handing it to [crate::runner::run].
pub struct Config {
    pub mode: Mode,
    pub dtw: DtwKind,
    pub cqt: CqtKind,
    /// Anti-stall bound on consecutive single-direction follower moves.
    pub max_run_count: usize,
    /// Follower look-back, in frames, in both dimensions.
    pub search_window: usize,
    /// Lower CQT frequency bound (Hz).
    pub fmin: f64,
    /// Upper CQT frequency bound (Hz).
    pub fmax: f64,
    /// Samples between successive analysis frames.
    pub hop_len: usize,
    /// Frame length as a multiple of `hop_len`.
    pub slice_hop_ratio: usize,
    pub perf_wave_path: PathBuf,
    pub score_midi_path: PathBuf,
    pub backend: BackendKind,
    pub backend_output: SinkSpec,
    /// Whether the backend may emit for a score frame behind the previous one.
    pub backend_backtrack: bool,
    /// Report timestamps a frame ahead to compensate for the extractor's
    /// look-ahead region.
    pub backend_compensation: bool,
    /// Pace the slicer to wall-clock, as if the performance were live.
    pub simulate_performance: bool,
    pub sample_rate: u32,
    /// Path weights for the follower's cost recurrence.
    pub weights: DirectionWeights,
}

impl Config {
    /// A configuration with the library defaults for the given input files.
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(perf_wave_path: P, score_midi_path: Q) -> Self {
        Config {
            mode: Mode::Online,
            dtw: DtwKind::Oltw,
            cqt: CqtKind::Nsgt,
            max_run_count: 3,
            search_window: 250,
            fmin: 130.8,
            fmax: 4186.0,
            hop_len: 2048,
            slice_hop_ratio: 4,
            perf_wave_path: perf_wave_path.into(),
            score_midi_path: score_midi_path.into(),
            backend: BackendKind::Alignment,
            backend_output: SinkSpec::Stdout,
            backend_backtrack: false,
            backend_compensation: true,
            simulate_performance: false,
            sample_rate: DEFAULT_SAMPLE_RATE,
            weights: DirectionWeights::default(),
        }
    }

    /// Frame length in samples.
    pub fn frame_len(&self) -> usize {
        self.hop_len * self.slice_hop_ratio
    }

    /// Validate every option and quantise the frequency bounds.
    ///
    /// Returns the sanitised configuration, or a
    /// [ConfigError](SegnoError::ConfigError) describing the first
    /// offending option.
    pub fn sanitize(mut self) -> SegnoResult<Self> {
        fn fail<T>(msg: impl Into<String>) -> SegnoResult<T> {
            Err(SegnoError::ConfigError(msg.into()))
        }

        if self.max_run_count == 0 {
            return fail("max_run_count must be at least 1");
        }
        if self.search_window == 0 {
            return fail("search_window must be at least 1");
        }
        if self.fmin <= 0. {
            return fail("fmin must be positive");
        }
        if self.fmax <= 0. {
            return fail("fmax must be positive");
        }
        if self.fmax <= self.fmin {
            return fail("fmax > fmin not fulfilled");
        }
        if self.hop_len == 0 {
            return fail("hop_len must be at least 1");
        }
        if self.slice_hop_ratio == 0 {
            return fail("slice_hop_ratio must be at least 1");
        }
        if self.sample_rate == 0 {
            return fail("sample_rate must be at least 1");
        }
        if !(self.weights.w_a > 0. && self.weights.w_b > 0. && self.weights.w_c > 0.) {
            return fail("direction weights must all be positive");
        }
        if self.mode == Mode::Online {
            if self.dtw != DtwKind::Oltw {
                return fail("for `online` mode only `oltw` dtw is accepted");
            }
            if self.cqt == CqtKind::Librosa {
                return fail(
                    "for `online` mode only `nsgt`, `librosa_pseudo` or `librosa_hybrid` cqt is accepted",
                );
            }
        }
        if !self.perf_wave_path.is_file() {
            return fail(format!(
                "performance WAVE file ({}) does not exist",
                self.perf_wave_path.display()
            ));
        }
        if !self.score_midi_path.is_file() {
            return fail(format!(
                "score MIDI file ({}) does not exist",
                self.score_midi_path.display()
            ));
        }

        let fmin = quantise_hz_midi(self.fmin);
        info!("fmin quantised from {} to {}", self.fmin, fmin);
        self.fmin = fmin;

        let fmax = quantise_hz_midi(self.fmax);
        info!("fmax quantised from {} to {}", self.fmax, fmax);
        self.fmax = fmax;

        Ok(self)
    }
}
