//! Score handling: note extraction from MIDI, onset grouping, and the
//! synthesiser that turns the score into audio for feature extraction.
use crate::utils::midi_to_hz;
use crate::{SegnoError, SegnoResult};
use log::warn;
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use noisy_float::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
/// One score note: its MIDI pitch and its onset time in milliseconds.
pub struct NoteInfo {
    pub midi_note_num: u8,
    pub note_start: f64,
}

/// Score notes grouped by onset time, ordered by onset.
pub type NoteIndex = BTreeMap<N64, Vec<NoteInfo>>;

/// Extract every note onset from a score MIDI file, sorted by onset time
/// (stable for simultaneous notes).
///
/// Events are walked across all tracks; the tempo is taken from the
/// first tempo meta event of the first track, and only note-ons with a
/// positive velocity count as notes.
pub fn process_midi_to_note_info(path: &Path) -> SegnoResult<Vec<NoteInfo>> {
    let data = std::fs::read(path)
        .map_err(|e| SegnoError::MidiError(format!("'{}': {e}", path.display())))?;
    let smf = Smf::parse(&data)
        .map_err(|e| SegnoError::MidiError(format!("'{}': {e}", path.display())))?;
    process_smf(&smf)
}

fn process_smf(smf: &Smf) -> SegnoResult<Vec<NoteInfo>> {
    let ticks_per_beat = ticks_per_beat(&smf.header.timing)?;
    let meta_track = smf
        .tracks
        .first()
        .ok_or_else(|| SegnoError::MidiError("the MIDI file has no tracks".to_string()))?;
    let tempo = tempo_of(meta_track)?;
    let mut notes: Vec<NoteInfo> = smf
        .tracks
        .iter()
        .flat_map(|track| track_note_onsets(track, ticks_per_beat, tempo))
        .collect();
    notes.sort_by_key(|note| n64(note.note_start));
    Ok(notes)
}

fn ticks_per_beat(timing: &Timing) -> SegnoResult<f64> {
    match timing {
        Timing::Metrical(ticks) => Ok(f64::from(ticks.as_int())),
        Timing::Timecode(..) => Err(SegnoError::MidiError(
            "SMPTE timecode timing is not supported".to_string(),
        )),
    }
}

/// Microseconds per beat from the first tempo meta event.
fn tempo_of(meta_track: &[TrackEvent]) -> SegnoResult<u32> {
    for event in meta_track {
        if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
            return Ok(tempo.as_int());
        }
    }
    Err(SegnoError::MidiError(
        "cannot get track tempo".to_string(),
    ))
}

fn tick_to_ms(tick: u64, ticks_per_beat: f64, tempo: u32) -> f64 {
    tick as f64 * f64::from(tempo) / ticks_per_beat / 1000.
}

fn track_note_onsets(track: &[TrackEvent], ticks_per_beat: f64, tempo: u32) -> Vec<NoteInfo> {
    let mut notes = Vec::new();
    let mut current_tick: u64 = 0;
    for event in track {
        current_tick += u64::from(event.delta.as_int());
        if let TrackEventKind::Midi {
            message: MidiMessage::NoteOn { key, vel },
            ..
        } = event.kind
        {
            if vel.as_int() > 0 {
                notes.push(NoteInfo {
                    midi_note_num: key.as_int(),
                    note_start: tick_to_ms(current_tick, ticks_per_beat, tempo),
                });
            }
        }
    }
    notes
}

/// Group notes sharing an onset time, keyed by that onset.
pub fn group_note_onsets(notes: &[NoteInfo]) -> NoteIndex {
    let mut index = NoteIndex::new();
    for note in notes {
        index.entry(n64(note.note_start)).or_default().push(*note);
    }
    index
}

/// The most recent group of notes at or before `t_ms`, if any.
pub fn closest_notes_before(index: &NoteIndex, t_ms: f64) -> Option<&[NoteInfo]> {
    index
        .range(..=n64(t_ms))
        .next_back()
        .map(|(_, notes)| notes.as_slice())
}

/// Renders a score MIDI file to a waveform for feature extraction.
pub trait Synthesiser {
    fn synthesise(&self, score_midi_path: &Path) -> SegnoResult<Vec<f32>>;
}

/// Built-in synthesiser: additive sine synthesis with a handful of
/// harmonics and an ADSR envelope per note. Not pretty, but it puts
/// energy in the right semitone bins, which is all the follower needs.
pub struct AdditiveSynth {
    pub sample_rate: u32,
}

struct NoteSpan {
    start_s: f64,
    end_s: f64,
    key: u8,
    velocity: u8,
}

const HARMONICS: [(f64, f64); 4] = [(1., 1.), (2., 0.4), (3., 0.2), (4., 0.1)];
const ATTACK_S: f64 = 0.01;
const DECAY_S: f64 = 0.05;
const SUSTAIN_LEVEL: f64 = 0.75;
const RELEASE_S: f64 = 0.08;

impl AdditiveSynth {
    fn note_spans(smf: &Smf) -> SegnoResult<Vec<NoteSpan>> {
        let ticks_per_beat = ticks_per_beat(&smf.header.timing)?;
        let meta_track = smf
            .tracks
            .first()
            .ok_or_else(|| SegnoError::MidiError("the MIDI file has no tracks".to_string()))?;
        let tempo = tempo_of(meta_track)?;

        let mut spans = Vec::new();
        for track in &smf.tracks {
            let mut current_tick: u64 = 0;
            // Most recently opened note per pitch; nested re-triggers of
            // the same pitch close in reverse order.
            let mut open: HashMap<u8, Vec<NoteSpan>> = HashMap::new();
            for event in track {
                current_tick += u64::from(event.delta.as_int());
                let now_s = tick_to_ms(current_tick, ticks_per_beat, tempo) / 1000.;
                let TrackEventKind::Midi { message, .. } = event.kind else {
                    continue;
                };
                match message {
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        open.entry(key.as_int()).or_default().push(NoteSpan {
                            start_s: now_s,
                            end_s: now_s,
                            key: key.as_int(),
                            velocity: vel.as_int(),
                        });
                    }
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        match open.entry(key.as_int()).or_default().pop() {
                            Some(mut span) => {
                                span.end_s = now_s;
                                spans.push(span);
                            }
                            None => warn!("note-off for pitch {} with no note-on", key.as_int()),
                        }
                    }
                    _ => {}
                }
            }
            let track_end_s = tick_to_ms(current_tick, ticks_per_beat, tempo) / 1000.;
            for (_, dangling) in open {
                for mut span in dangling {
                    span.end_s = track_end_s;
                    spans.push(span);
                }
            }
        }
        Ok(spans)
    }

    fn envelope(t: f64, length: f64) -> f64 {
        if t < 0. || t > length + RELEASE_S {
            0.
        } else if t < ATTACK_S {
            t / ATTACK_S
        } else if t < ATTACK_S + DECAY_S {
            1. - (1. - SUSTAIN_LEVEL) * (t - ATTACK_S) / DECAY_S
        } else if t < length {
            SUSTAIN_LEVEL
        } else {
            SUSTAIN_LEVEL * (1. - (t - length) / RELEASE_S)
        }
    }
}

impl Synthesiser for AdditiveSynth {
    fn synthesise(&self, score_midi_path: &Path) -> SegnoResult<Vec<f32>> {
        let data = std::fs::read(score_midi_path)
            .map_err(|e| SegnoError::MidiError(format!("'{}': {e}", score_midi_path.display())))?;
        let smf = Smf::parse(&data)
            .map_err(|e| SegnoError::MidiError(format!("'{}': {e}", score_midi_path.display())))?;
        let spans = AdditiveSynth::note_spans(&smf)?;
        if spans.is_empty() {
            return Err(SegnoError::MidiError(format!(
                "'{}' contains no notes",
                score_midi_path.display()
            )));
        }

        let rate = f64::from(self.sample_rate);
        let total_s = spans
            .iter()
            .map(|span| span.end_s + RELEASE_S)
            .fold(0., f64::max);
        let mut buffer = vec![0_f32; (total_s * rate).ceil() as usize + 1];

        for span in &spans {
            let f0 = midi_to_hz(f64::from(span.key));
            let amplitude = f64::from(span.velocity) / 127. * 0.3;
            let length = (span.end_s - span.start_s).max(ATTACK_S);
            let first = (span.start_s * rate) as usize;
            let last = (((span.end_s + RELEASE_S) * rate) as usize).min(buffer.len() - 1);
            for (n, sample) in buffer[first..=last].iter_mut().enumerate() {
                let t = n as f64 / rate;
                let env = AdditiveSynth::envelope(t, length);
                if env == 0. {
                    continue;
                }
                let mut value = 0.;
                for (harmonic, weight) in HARMONICS {
                    value +=
                        weight * (2. * std::f64::consts::PI * f0 * harmonic * (t + span.start_s)).sin();
                }
                *sample += (amplitude * env * value) as f32;
            }
        }

        let peak = buffer.iter().fold(0_f32, |acc, &x| acc.max(x.abs()));
        if peak > 0.9 {
            let scale = 0.9 / peak;
            for sample in &mut buffer {
                *sample *= scale;
            }
        }
        Ok(buffer)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use midly::num::{u15, u24, u28, u4, u7};
    use midly::{Format, Header};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn note_on(delta: u32, key: u8, vel: u8) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(0),
                message: MidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(vel),
                },
            },
        }
    }

    fn end_of_track() -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        }
    }

    /// Two-track file at 120 bpm, 480 ticks per beat: C4 at 0 ms and
    /// D4 at 500 ms on one track, E4 at 0 ms on another.
    pub(crate) fn demo_smf() -> Smf<'static> {
        let mut smf = Smf::new(Header::new(
            Format::Parallel,
            Timing::Metrical(u15::new(480)),
        ));
        smf.tracks.push(vec![
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(500_000))),
            },
            end_of_track(),
        ]);
        smf.tracks.push(vec![
            note_on(0, 60, 100),
            note_on(480, 60, 0), // running-status note-off
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel: u4::new(0),
                    message: MidiMessage::NoteOn {
                        key: u7::new(62),
                        vel: u7::new(90),
                    },
                },
            },
            note_on(480, 62, 0),
            end_of_track(),
        ]);
        smf.tracks.push(vec![
            note_on(0, 64, 80),
            note_on(960, 64, 0),
            end_of_track(),
        ]);
        smf
    }

    pub(crate) fn write_demo_midi(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        demo_smf().save(&path).unwrap();
        path
    }

    #[test]
    fn test_process_midi_to_note_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_demo_midi(dir.path(), "demo.mid");

        let notes = process_midi_to_note_info(&path).unwrap();
        assert_eq!(
            notes,
            vec![
                NoteInfo {
                    midi_note_num: 60,
                    note_start: 0.
                },
                NoteInfo {
                    midi_note_num: 64,
                    note_start: 0.
                },
                NoteInfo {
                    midi_note_num: 62,
                    note_start: 500.
                },
            ]
        );
    }

    #[test]
    fn test_missing_tempo_is_an_error() {
        let mut smf = Smf::new(Header::new(
            Format::SingleTrack,
            Timing::Metrical(u15::new(480)),
        ));
        smf.tracks.push(vec![note_on(0, 60, 100), end_of_track()]);
        assert!(matches!(
            process_smf(&smf),
            Err(SegnoError::MidiError(msg)) if msg.contains("tempo")
        ));
    }

    #[test]
    fn test_closest_notes_before() {
        let index = group_note_onsets(&[
            NoteInfo {
                midi_note_num: 1,
                note_start: 100.,
            },
            NoteInfo {
                midi_note_num: 2,
                note_start: 200.,
            },
            NoteInfo {
                midi_note_num: 3,
                note_start: 300.,
            },
            NoteInfo {
                midi_note_num: 4,
                note_start: 400.,
            },
            NoteInfo {
                midi_note_num: 5,
                note_start: 400.,
            },
        ]);

        assert_eq!(closest_notes_before(&index, 0.), None);
        let cases = [
            (100., vec![1]),
            (150., vec![1]),
            (199., vec![1]),
            (201., vec![2]),
            (411., vec![4, 5]),
        ];
        for (t, pitches) in cases {
            let got: Vec<u8> = closest_notes_before(&index, t)
                .unwrap()
                .iter()
                .map(|n| n.midi_note_num)
                .collect();
            assert_eq!(got, pitches, "query at {t} ms");
        }
    }

    #[test]
    fn test_group_preserves_definition_order() {
        let notes = [
            NoteInfo {
                midi_note_num: 70,
                note_start: 10.,
            },
            NoteInfo {
                midi_note_num: 40,
                note_start: 10.,
            },
        ];
        let index = group_note_onsets(&notes);
        assert_eq!(index[&n64(10.)], notes.to_vec());
    }

    #[test]
    fn test_additive_synth_renders_audible_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_demo_midi(dir.path(), "demo.mid");

        let synth = AdditiveSynth { sample_rate: 8000 };
        let audio = synth.synthesise(&path).unwrap();
        // One second of notes plus release tail.
        assert!(audio.len() >= 8000);
        let peak = audio.iter().fold(0_f32, |acc, &x| acc.max(x.abs()));
        assert!(peak > 0.05 && peak <= 0.9 + 1e-6);
    }

    #[test]
    fn test_additive_synth_rejects_noteless_score() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.mid");
        let mut smf = Smf::new(Header::new(
            Format::SingleTrack,
            Timing::Metrical(u15::new(480)),
        ));
        smf.tracks.push(vec![
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(500_000))),
            },
            end_of_track(),
        ]);
        smf.save(&path).unwrap();

        let synth = AdditiveSynth { sample_rate: 8000 };
        assert!(synth.synthesise(&path).is_err());
    }
}
