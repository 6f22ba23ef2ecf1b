//! Semitone-spectrum feature extraction.
//!
//! Every extractor variant maps an audio frame to one vector with a bin
//! per equal-temperament semitone between the configured frequency
//! bounds, post-processed the same way: absolute value, time averaging
//! over the hop, L1 normalisation. The variants differ in how the
//! spectrum is obtained: the sliced transform keeps per-hop time
//! resolution inside each frame, the frame variants trade that for the
//! full frame's frequency resolution, and the offline full variant adds
//! onset-emphasising frame differencing.
use crate::config::CqtKind;
use crate::utils::{hann_window, hz_to_midi, l1_normalise_inplace, quantise_hz_midi, stft};
use crate::{ExtractedFeature, SegnoError, SegnoResult};
use ndarray::{Array1, Array2};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Number of semitone bins between `fmin` and `fmax`, once both are
/// quantised to the nearest equal-temperament note.
pub(crate) fn semitone_bin_count(fmin: f64, fmax: f64) -> usize {
    let start_midi = hz_to_midi(fmin).round();
    let end_midi = hz_to_midi(fmax).round();
    (end_midi - start_midi).max(0.) as usize
}

/// Weight matrix mapping an `n_fft`-point magnitude spectrum to semitone
/// bins, shape `(n_bins, n_fft / 2 + 1)`.
///
/// Each row is a gaussian response centred on one MIDI note, one
/// semitone wide in log-frequency; columns are L2-normalised so a pure
/// tone contributes the same energy wherever it falls.
fn semitone_filterbank(sample_rate: u32, n_fft: usize, fmin: f64, n_bins: usize) -> Array2<f64> {
    let start_midi = hz_to_midi(fmin).round();
    let n_freqs = n_fft / 2 + 1;
    let mut wts: Array2<f64> = Array2::zeros((n_bins, n_freqs));
    for k in 1..n_freqs {
        let freq_hz = k as f64 * f64::from(sample_rate) / n_fft as f64;
        let freq_midi = hz_to_midi(freq_hz);
        for b in 0..n_bins {
            let d = freq_midi - (start_midi + b as f64);
            wts[[b, k]] = (-0.5 * (2. * d) * (2. * d)).exp();
        }
    }
    for mut col in wts.columns_mut() {
        let mut sum = col.mapv(|x| x * x).sum().sqrt();
        if sum < f64::MIN_POSITIVE {
            sum = 1.;
        }
        col /= sum;
    }
    wts
}

/// Stateful sliced constant-Q engine: initialised once, fed one frame of
/// `slice_len` samples per hop of `tr_len` samples.
///
/// The transform's overlap-add slicing is rendered as two hop-length
/// sub-windows half a hop apart (the auxiliary frame axis); their spectra
/// are averaged before the filterbank, so each output stays localised to
/// its hop while the zero-padded FFT keeps semitone resolution.
pub(crate) struct SlicedCqt {
    slice_len: usize,
    tr_len: usize,
    window: Array1<f32>,
    fft: Arc<dyn Fft<f32>>,
    filterbank: Array2<f64>,
}

impl SlicedCqt {
    pub fn new(
        fmin: f64,
        fmax: f64,
        slice_len: usize,
        tr_len: usize,
        sample_rate: u32,
    ) -> SegnoResult<SlicedCqt> {
        if tr_len == 0 || slice_len < tr_len {
            return Err(SegnoError::AnalysisError(format!(
                "invalid slice/transition lengths: {slice_len}/{tr_len}"
            )));
        }
        let fmin = quantise_hz_midi(fmin);
        let n_bins = semitone_bin_count(fmin, fmax);
        if n_bins == 0 {
            return Err(SegnoError::AnalysisError(format!(
                "no semitone bins between {fmin} Hz and {fmax} Hz"
            )));
        }
        let mut planner = FftPlanner::new();
        Ok(SlicedCqt {
            slice_len,
            tr_len,
            window: hann_window(tr_len),
            fft: planner.plan_fft_forward(slice_len),
            filterbank: semitone_filterbank(sample_rate, slice_len, fmin, n_bins),
        })
    }

    pub fn extract(&self, frame: &[f32]) -> ExtractedFeature {
        let n_freqs = self.slice_len / 2 + 1;
        let mut spectrum: Array1<f64> = Array1::zeros(n_freqs);
        for offset in [0, self.tr_len / 2] {
            let mut buffer = vec![Complex::new(0_f32, 0.); self.slice_len];
            for n in 0..self.tr_len {
                let sample = frame.get(offset + n).copied().unwrap_or(0.);
                buffer[n] = Complex::new(sample * self.window[n], 0.);
            }
            self.fft.process(&mut buffer);
            for (bin, value) in buffer[..n_freqs].iter().enumerate() {
                spectrum[bin] += f64::from((value.re * value.re + value.im * value.im).sqrt());
            }
        }
        spectrum /= 2.;
        let mut feature = self.filterbank.dot(&spectrum);
        l1_normalise_inplace(&mut feature);
        feature
    }
}

/// Frame-resolution constant-Q: one windowed FFT over the whole frame.
pub(crate) struct FrameCqt {
    slice_len: usize,
    window: Array1<f32>,
    fft: Arc<dyn Fft<f32>>,
    filterbank: Array2<f64>,
}

impl FrameCqt {
    pub fn new(fmin: f64, fmax: f64, slice_len: usize, sample_rate: u32) -> SegnoResult<FrameCqt> {
        if slice_len == 0 {
            return Err(SegnoError::AnalysisError("empty analysis frame".to_string()));
        }
        let fmin = quantise_hz_midi(fmin);
        let n_bins = semitone_bin_count(fmin, fmax);
        if n_bins == 0 {
            return Err(SegnoError::AnalysisError(format!(
                "no semitone bins between {fmin} Hz and {fmax} Hz"
            )));
        }
        let mut planner = FftPlanner::new();
        Ok(FrameCqt {
            slice_len,
            window: hann_window(slice_len),
            fft: planner.plan_fft_forward(slice_len),
            filterbank: semitone_filterbank(sample_rate, slice_len, fmin, n_bins),
        })
    }

    pub fn extract(&self, frame: &[f32]) -> ExtractedFeature {
        let n_freqs = self.slice_len / 2 + 1;
        let mut buffer = vec![Complex::new(0_f32, 0.); self.slice_len];
        for n in 0..self.slice_len {
            let sample = frame.get(n).copied().unwrap_or(0.);
            buffer[n] = Complex::new(sample * self.window[n], 0.);
        }
        self.fft.process(&mut buffer);
        let spectrum: Array1<f64> = buffer[..n_freqs]
            .iter()
            .map(|value| f64::from((value.re * value.re + value.im * value.im).sqrt()))
            .collect();
        let mut feature = self.filterbank.dot(&spectrum);
        l1_normalise_inplace(&mut feature);
        feature
    }
}

/// A configured streaming extractor, one of the online-capable variants.
pub(crate) enum Extractor {
    Sliced(SlicedCqt),
    Frame(FrameCqt),
}

impl Extractor {
    /// The online extractor for `kind`; the full constant-Q only exists
    /// offline.
    pub fn online(
        kind: CqtKind,
        fmin: f64,
        fmax: f64,
        slice_len: usize,
        tr_len: usize,
        sample_rate: u32,
    ) -> SegnoResult<Extractor> {
        match kind {
            CqtKind::Nsgt => Ok(Extractor::Sliced(SlicedCqt::new(
                fmin,
                fmax,
                slice_len,
                tr_len,
                sample_rate,
            )?)),
            // The hybrid variant shares the frame-spectrum approximation
            // with the pseudo one.
            CqtKind::LibrosaPseudo | CqtKind::LibrosaHybrid => Ok(Extractor::Frame(FrameCqt::new(
                fmin,
                fmax,
                slice_len,
                sample_rate,
            )?)),
            CqtKind::Librosa => Err(SegnoError::AnalysisError(
                "the full constant-Q has no streaming form".to_string(),
            )),
        }
    }

    pub fn extract(&self, frame: &[f32]) -> ExtractedFeature {
        match self {
            Extractor::Sliced(sliced) => sliced.extract(frame),
            Extractor::Frame(frame_cqt) => frame_cqt.extract(frame),
        }
    }
}

/// Extract one feature per hop from a whole waveform.
pub(crate) fn extract_offline(
    kind: CqtKind,
    audio: &[f32],
    fmin: f64,
    fmax: f64,
    slice_len: usize,
    tr_len: usize,
    sample_rate: u32,
) -> SegnoResult<Vec<ExtractedFeature>> {
    if audio.is_empty() {
        return Err(SegnoError::AnalysisError(
            "cannot extract features from an empty waveform".to_string(),
        ));
    }
    match kind {
        CqtKind::Nsgt => {
            let engine = SlicedCqt::new(fmin, fmax, slice_len, tr_len, sample_rate)?;
            Ok(frames_of(audio, slice_len, tr_len)
                .map(|frame| engine.extract(frame))
                .collect())
        }
        CqtKind::LibrosaPseudo | CqtKind::LibrosaHybrid => {
            whole_waveform_features(audio, fmin, fmax, slice_len, tr_len, sample_rate)
        }
        CqtKind::Librosa => {
            let features =
                whole_waveform_features(audio, fmin, fmax, slice_len, tr_len, sample_rate)?;
            Ok(diff_clipped(features))
        }
    }
}

/// Successive frames of `slice_len` samples every `tr_len` samples; the
/// tail frames run past the end and are zero-padded by the extractors.
fn frames_of(audio: &[f32], slice_len: usize, tr_len: usize) -> impl Iterator<Item = &[f32]> {
    (0..audio.len())
        .step_by(tr_len)
        .map(move |start| &audio[start..audio.len().min(start + slice_len)])
}

fn whole_waveform_features(
    audio: &[f32],
    fmin: f64,
    fmax: f64,
    slice_len: usize,
    tr_len: usize,
    sample_rate: u32,
) -> SegnoResult<Vec<ExtractedFeature>> {
    let fmin = quantise_hz_midi(fmin);
    let n_bins = semitone_bin_count(fmin, fmax);
    if n_bins == 0 {
        return Err(SegnoError::AnalysisError(format!(
            "no semitone bins between {fmin} Hz and {fmax} Hz"
        )));
    }
    let spectrogram = stft(audio, slice_len, tr_len);
    let filterbank = semitone_filterbank(sample_rate, slice_len, fmin, n_bins);
    let raw = filterbank.dot(&spectrogram);
    Ok(raw
        .columns()
        .into_iter()
        .map(|column| {
            let mut feature = column.to_owned();
            l1_normalise_inplace(&mut feature);
            feature
        })
        .collect())
}

/// Replace every feature but the first with its clipped difference from
/// the previous one, emphasising note onsets.
fn diff_clipped(features: Vec<ExtractedFeature>) -> Vec<ExtractedFeature> {
    let mut out = Vec::with_capacity(features.len());
    for (idx, feature) in features.iter().enumerate() {
        if idx == 0 {
            out.push(feature.clone());
        } else {
            let mut diff = feature - &features[idx - 1];
            diff.mapv_inplace(|x| x.max(0.));
            out.push(diff);
        }
    }
    out
}
