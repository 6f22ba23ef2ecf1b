//! Numerical helpers shared by the feature extractors: short-time Fourier
//! transform, MIDI/frequency conversions and feature normalisation.
use ndarray::{s, Array, Array1, Array2};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::f32::consts::PI;

/// Periodic hann window of `window_length` samples.
pub(crate) fn hann_window(window_length: usize) -> Array1<f32> {
    let mut window = Array::zeros(window_length + 1);
    for n in 0..window_length {
        window[[n]] = 0.5 - 0.5 * f32::cos(2. * n as f32 * PI / (window_length as f32));
    }
    window.slice_move(s![0..window_length])
}

/// Magnitude spectrogram of `signal`, shape
/// `(window_length / 2 + 1, ceil(len / hop_length))`.
///
/// One column per hop, each window centred on its hop position; samples
/// past either edge of the signal read as zero, so signals shorter than
/// a window are fine.
pub(crate) fn stft(signal: &[f32], window_length: usize, hop_length: usize) -> Array2<f64> {
    let n_freqs = window_length / 2 + 1;
    let n_frames = (signal.len() as f64 / hop_length as f64).ceil() as usize;
    let half = window_length / 2;
    let window = hann_window(window_length);
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(window_length);

    let mut spectrogram: Array2<f64> = Array2::zeros((n_freqs, n_frames));
    let mut buffer = vec![Complex::new(0_f32, 0.); window_length];
    for (frame, mut column) in spectrogram.columns_mut().into_iter().enumerate() {
        let centre = frame * hop_length;
        for (n, slot) in buffer.iter_mut().enumerate() {
            let index = centre + n;
            let sample = if index < half {
                0.
            } else {
                signal.get(index - half).copied().unwrap_or(0.)
            };
            *slot = Complex::new(sample * window[n], 0.);
        }
        fft.process(&mut buffer);
        for (bin, value) in buffer[..n_freqs].iter().enumerate() {
            column[bin] = f64::from((value.re * value.re + value.im * value.im).sqrt());
        }
    }
    spectrogram
}

pub(crate) fn hz_to_midi(hz: f64) -> f64 {
    12. * (hz / 440.).log2() + 69.
}

pub(crate) fn midi_to_hz(midi: f64) -> f64 {
    440. * 2_f64.powf((midi - 69.) / 12.)
}

/// Round `hz` to the frequency of the nearest equal-temperament note.
pub fn quantise_hz_midi(hz: f64) -> f64 {
    midi_to_hz(hz_to_midi(hz).round())
}

/// Scale `feature` to unit L1 norm. An all-zero vector is left untouched,
/// and NaN entries are clipped to zero before the norm is taken.
pub(crate) fn l1_normalise_inplace(feature: &mut Array1<f64>) {
    feature.mapv_inplace(|x| if x.is_nan() { 0. } else { x });
    let norm = feature.iter().map(|x| x.abs()).sum::<f64>();
    if norm > 0. {
        *feature /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_hann_window_endpoints() {
        let window = hann_window(8);
        assert_eq!(window.len(), 8);
        assert!(window[0].abs() < 1e-7);
        assert!((window[4] - 1.).abs() < 1e-6);
    }

    #[test]
    fn test_stft_shape() {
        let signal = vec![0.1_f32; 2048];
        let spectrogram = stft(&signal, 512, 128);
        assert_eq!(spectrogram.shape(), &[257, 16]);
    }

    #[test]
    fn test_stft_short_signal_is_zero_padded() {
        // Shorter than one window: a single centred frame.
        let spectrogram = stft(&[0.5_f32; 100], 512, 128);
        assert_eq!(spectrogram.shape(), &[257, 1]);
        assert!(spectrogram.iter().any(|&x| x > 0.));
    }

    #[test]
    fn test_stft_sine_peak() {
        // 1 kHz sine at 44.1 kHz should peak near fft bin 1000 / (44100 / 512).
        let sample_rate: f64 = 44100.;
        let signal = (0..8192)
            .map(|n| (2. * std::f32::consts::PI * 1000. * n as f32 / sample_rate as f32).sin())
            .collect::<Vec<f32>>();
        let spectrogram = stft(&signal, 512, 512);
        let column = spectrogram.column(4);
        let max_bin = column
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(idx, _)| idx)
            .unwrap();
        let expected = (1000. / (sample_rate / 512.)).round() as usize;
        assert!((max_bin as i64 - expected as i64).abs() <= 1);
    }

    #[test]
    fn test_stft_silence_is_zero() {
        let spectrogram = stft(&[0.; 1024], 256, 64);
        assert!(spectrogram.iter().all(|&x| x == 0.));
    }

    #[test]
    fn test_hz_midi_roundtrip() {
        assert!((hz_to_midi(440.) - 69.).abs() < 1e-9);
        assert!((midi_to_hz(69.) - 440.).abs() < 1e-9);
        assert!((midi_to_hz(hz_to_midi(123.45)) - 123.45).abs() < 1e-9);
    }

    #[test]
    fn test_quantise_hz_midi() {
        // 130.8 Hz is a slightly flat C3 (130.8128 Hz).
        assert!((quantise_hz_midi(130.8) - midi_to_hz(48.)).abs() < 1e-9);
        assert!((quantise_hz_midi(4186.0) - midi_to_hz(108.)).abs() < 1e-9);
        // A quantised frequency is a fixed point.
        let quantised = quantise_hz_midi(446.);
        assert_eq!(quantised, quantise_hz_midi(quantised));
    }

    #[test]
    fn test_l1_normalise() {
        let mut feature = arr1(&[1., -3., f64::NAN, 4.]);
        l1_normalise_inplace(&mut feature);
        assert!((feature.iter().map(|x| x.abs()).sum::<f64>() - 1.).abs() < 1e-12);
        assert_eq!(feature[2], 0.);

        let mut zero = arr1(&[0., 0.]);
        l1_normalise_inplace(&mut zero);
        assert_eq!(zero, arr1(&[0., 0.]));
    }
}
