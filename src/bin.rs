//! Command-line front end: parse flags, sanitise, run the pipeline.
use clap::Parser;
use log::error;
use segno::config::{BackendKind, CqtKind, DtwKind, Mode, SinkSpec};
use segno::dtw::DirectionWeights;
use segno::{runner, Config, SegnoError, SegnoResult, DEFAULT_SAMPLE_RATE};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "segno",
    version,
    about = "Follow a live or recorded performance through its score"
)]
struct Args {
    /// Mode: `online` or `offline`.
    #[arg(long, default_value = "online")]
    mode: String,

    /// DTW algorithm: `oltw` or `classical` (`classical` is offline only).
    #[arg(long, default_value = "oltw")]
    dtw: String,

    /// CQT variant: `nsgt`, `librosa_pseudo`, `librosa_hybrid` or
    /// `librosa` (`librosa` is offline only).
    #[arg(long, default_value = "nsgt")]
    cqt: String,

    /// Anti-stall bound on consecutive single-direction follower moves.
    #[arg(long, default_value_t = 3)]
    max_run_count: usize,

    /// Follower search window, in frames.
    #[arg(long, default_value_t = 250)]
    search_window: usize,

    /// Minimum frequency (Hz) for the CQT.
    #[arg(long, default_value_t = 130.8)]
    fmin: f64,

    /// Maximum frequency (Hz) for the CQT.
    #[arg(long, default_value_t = 4186.0)]
    fmax: f64,

    /// Samples between successive analysis frames.
    #[arg(long, default_value_t = 2048)]
    hop_len: usize,

    /// Frame length as a multiple of the hop length.
    #[arg(long, default_value_t = 4)]
    slice_hop_ratio: usize,

    /// Path to the performance WAVE file.
    #[arg(long)]
    perf_wave_path: PathBuf,

    /// Path to the score MIDI file.
    #[arg(long)]
    score_midi_path: PathBuf,

    /// Output format: `alignment` or `timestamp`.
    #[arg(long, default_value = "alignment")]
    backend: String,

    /// Output sink: `stdout`, `stderr`, `udp:<host>:<port>` or a file path.
    #[arg(long, default_value = "stdout")]
    backend_output: String,

    /// Allow the backend to go back in time over the score.
    #[arg(long)]
    backend_backtrack: bool,

    /// Report plain hop-aligned timestamps instead of compensating for
    /// the extractor's frame look-ahead.
    #[arg(long)]
    no_backend_compensation: bool,

    /// Stream the performance into the pipeline at wall-clock speed.
    #[arg(long)]
    simulate_performance: bool,

    /// Sample rate used to synthesise the score and decode the performance.
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    sample_rate: u32,

    /// Path weight for performance-direction steps.
    #[arg(long, default_value_t = 1.0)]
    w_a: f64,

    /// Path weight for score-direction steps.
    #[arg(long, default_value_t = 1.0)]
    w_b: f64,

    /// Path weight for diagonal steps.
    #[arg(long, default_value_t = 1.0)]
    w_c: f64,
}

fn build_config(args: Args) -> SegnoResult<Config> {
    let mut config = Config::new(args.perf_wave_path, args.score_midi_path);
    config.mode = args
        .mode
        .parse::<Mode>()
        .map_err(|_| SegnoError::ConfigError(format!("unknown mode: `{}`", args.mode)))?;
    config.dtw = args
        .dtw
        .parse::<DtwKind>()
        .map_err(|_| SegnoError::ConfigError(format!("unknown dtw: `{}`", args.dtw)))?;
    config.cqt = args
        .cqt
        .parse::<CqtKind>()
        .map_err(|_| SegnoError::ConfigError(format!("unknown cqt: `{}`", args.cqt)))?;
    config.backend = args
        .backend
        .parse::<BackendKind>()
        .map_err(|_| SegnoError::ConfigError(format!("unknown backend: `{}`", args.backend)))?;
    config.backend_output = args.backend_output.parse::<SinkSpec>()?;
    config.max_run_count = args.max_run_count;
    config.search_window = args.search_window;
    config.fmin = args.fmin;
    config.fmax = args.fmax;
    config.hop_len = args.hop_len;
    config.slice_hop_ratio = args.slice_hop_ratio;
    config.backend_backtrack = args.backend_backtrack;
    config.backend_compensation = !args.no_backend_compensation;
    config.simulate_performance = args.simulate_performance;
    config.sample_rate = args.sample_rate;
    config.weights = DirectionWeights {
        w_a: args.w_a,
        w_b: args.w_b,
        w_c: args.w_c,
    };
    config.sanitize()
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            error!("use the `--help` flag to show the help message");
            return ExitCode::FAILURE;
        }
    };

    match runner::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
