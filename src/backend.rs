//! The emission end of the pipeline: turns `(p_idx, s_idx)` alignment
//! records into timestamp or MIREX output lines on the configured sink.
use crate::config::{BackendKind, Config, Mode, SinkSpec};
use crate::score::{closest_notes_before, NoteIndex};
use crate::{SegnoError, SegnoResult};
use log::warn;
use noisy_float::prelude::*;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Write};
use std::net::UdpSocket;
use std::sync::mpsc::Receiver;
use std::time::Instant;

/// An opened output sink. Opening can fail; writing after a successful
/// open only ever logs.
pub(crate) enum Sink {
    Stdout,
    Stderr,
    Udp(UdpSocket),
    File(File),
}

impl Sink {
    pub fn open(spec: &SinkSpec) -> SegnoResult<Sink> {
        match spec {
            SinkSpec::Stdout => Ok(Sink::Stdout),
            SinkSpec::Stderr => Ok(Sink::Stderr),
            SinkSpec::Udp { host, port } => {
                let socket = UdpSocket::bind(("0.0.0.0", 0))
                    .map_err(|e| SegnoError::SinkError(format!("binding udp socket: {e}")))?;
                socket
                    .connect((host.as_str(), *port))
                    .map_err(|e| SegnoError::SinkError(format!("connecting to {host}:{port}: {e}")))?;
                Ok(Sink::Udp(socket))
            }
            SinkSpec::File(path) => {
                // Truncate on open, append per line afterwards.
                let file = File::create(path).map_err(|e| {
                    SegnoError::SinkError(format!("opening '{}': {e}", path.display()))
                })?;
                Ok(Sink::File(file))
            }
        }
    }

    /// Write one protocol line. Failures are transient: logged to stderr,
    /// never fatal.
    pub fn write_line(&mut self, line: &str) {
        if let Err(e) = self.try_write(line) {
            warn!("sink write failed: {e}");
        }
    }

    fn try_write(&mut self, line: &str) -> io::Result<()> {
        match self {
            Sink::Stdout => {
                let mut out = io::stdout().lock();
                writeln!(out, "{line}")?;
                out.flush()
            }
            Sink::Stderr => {
                let mut err = io::stderr().lock();
                writeln!(err, "{line}")?;
                err.flush()
            }
            Sink::Udp(socket) => {
                // One line per datagram, mirrored to stderr.
                socket.send(line.as_bytes())?;
                eprintln!("{line}");
                Ok(())
            }
            Sink::File(file) => {
                writeln!(file, "{line}")?;
                file.flush()
            }
        }
    }
}

/// Drops records whose score index does not move forward; with
/// backtracking enabled only exact repeats are dropped.
struct MonotoneFilter {
    backtrack: bool,
    prev_s: i64,
}

impl MonotoneFilter {
    fn new(backtrack: bool) -> MonotoneFilter {
        MonotoneFilter {
            backtrack,
            prev_s: -1,
        }
    }

    fn accept(&mut self, s: usize) -> bool {
        let s = s as i64;
        let accepted = if self.backtrack {
            s != self.prev_s
        } else {
            s > self.prev_s
        };
        if accepted {
            self.prev_s = s;
        }
        accepted
    }
}

/// The output stage.
pub(crate) struct Backend {
    mode: Mode,
    kind: BackendKind,
    hop_len: usize,
    frame_len: usize,
    sample_rate: u32,
    backtrack: bool,
    compensation: bool,
    note_index: NoteIndex,
    input: Receiver<Option<(usize, usize)>>,
    start_signal: Receiver<Instant>,
    sink: Sink,
}

impl Backend {
    pub fn new(
        config: &Config,
        note_index: NoteIndex,
        input: Receiver<Option<(usize, usize)>>,
        start_signal: Receiver<Instant>,
        sink: Sink,
    ) -> Backend {
        Backend {
            mode: config.mode,
            kind: config.backend,
            hop_len: config.hop_len,
            frame_len: config.frame_len(),
            sample_rate: config.sample_rate,
            backtrack: config.backend_backtrack,
            compensation: config.backend_compensation,
            note_index,
            input,
            start_signal,
            sink,
        }
    }

    pub fn start(self) -> SegnoResult<()> {
        match self.kind {
            BackendKind::Timestamp => self.run_timestamp(),
            BackendKind::Alignment => self.run_alignment(),
        }
    }

    fn run_timestamp(mut self) -> SegnoResult<()> {
        let mut filter = MonotoneFilter::new(self.backtrack);
        while let Ok(Some((_, s))) = self.input.recv() {
            if !filter.accept(s) {
                continue;
            }
            let timestamp = score_timestamp_seconds(
                self.compensation,
                self.frame_len,
                self.hop_len,
                self.sample_rate,
                s,
            );
            self.sink.write_line(&format!("{timestamp}"));
        }
        Ok(())
    }

    fn run_alignment(mut self) -> SegnoResult<()> {
        // Nothing can be reported before the performance clock exists.
        let performance_start = self.start_signal.recv().map_err(|_| {
            SegnoError::BackendError("performance start signal never arrived".to_string())
        })?;

        let rate = f64::from(self.sample_rate);
        let mut filter = MonotoneFilter::new(self.backtrack);
        let mut emitted: BTreeSet<N64> = BTreeSet::new();

        while let Ok(Some((p, s))) = self.input.recv() {
            if !filter.accept(s) {
                continue;
            }
            let t_p_ms = self.hop_len as f64 * p as f64 / rate * 1000.;
            let t_s_ms = self.hop_len as f64 * s as f64 / rate * 1000.;
            let det_ms = match self.mode {
                Mode::Online => performance_start.elapsed().as_secs_f64() * 1000.,
                // Without a live clock the detection time is the
                // performance time itself.
                Mode::Offline => t_p_ms,
            };

            let Some(notes) = closest_notes_before(&self.note_index, t_s_ms) else {
                continue;
            };
            let Some(first) = notes.first() else {
                continue;
            };
            if !emitted.insert(n64(first.note_start)) {
                continue;
            }
            for note in notes {
                self.sink.write_line(&format!(
                    "{} {} {} {}",
                    t_p_ms.round() as i64,
                    det_ms.round() as i64,
                    note.note_start.round() as i64,
                    note.midi_note_num,
                ));
            }
        }
        Ok(())
    }
}

/// Score position of frame `s` in seconds.
///
/// With compensation the extractor's first output is attributed to a
/// whole frame rather than a hop, so the reported time runs a frame
/// ahead: `(F + (s−1)·H) / R`. Without it the position is plainly
/// `s·H / R`.
fn score_timestamp_seconds(
    compensation: bool,
    frame_len: usize,
    hop_len: usize,
    sample_rate: u32,
    s: usize,
) -> f64 {
    let rate = f64::from(sample_rate);
    if compensation {
        (frame_len as f64 + (s as f64 - 1.) * hop_len as f64) / rate
    } else {
        hop_len as f64 * s as f64 / rate
    }
}
