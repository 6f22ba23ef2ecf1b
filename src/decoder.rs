//! Audio input decoding.
//!
//! Turns a waveform file (the performance recording, or a synthesised
//! score written to disk) into a mono `f32` sample array at the
//! requested rate: symphonia does the decoding, rubato the resampling.
use crate::{SegnoError, SegnoResult};
use log::warn;
use rubato::{FftFixedIn, Resampler};
use std::f32::consts::SQRT_2;
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::{AudioBufferRef, SampleBuffer, SignalSpec};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units;
use symphonia::default::get_probe;

const MAX_DECODE_RETRIES: usize = 3;

fn decoding_error(path: &Path, what: impl std::fmt::Display) -> SegnoError {
    SegnoError::DecodingError(format!("'{}': {what}", path.display()))
}

struct AudioSource {
    decoder: Box<dyn Decoder>,
    format: Box<dyn FormatReader>,
    track_id: u32,
    buffer: SampleBuffer<f32>,
    offset: usize,
    spec: SignalSpec,
}

impl AudioSource {
    fn open(path: &Path) -> SegnoResult<AudioSource> {
        let file = File::open(path).map_err(|e| decoding_error(path, e))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = get_probe()
            .format(
                &Hint::new(),
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| decoding_error(path, e))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| decoding_error(path, "no track with a supported codec"))?;
        let track_id = track.id;
        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| decoding_error(path, e))?;

        // Decode up to the first audio-bearing packet so the signal spec
        // is known before iteration starts.
        let mut decode_errors = 0;
        let decoded = loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(e) => return Err(decoding_error(path, e)),
            };
            if packet.track_id() != track_id {
                continue;
            }
            match decoder.decode(&packet) {
                Ok(decoded) if decoded.frames() > 0 => break decoded,
                Ok(_) => continue,
                Err(Error::DecodeError(e)) => {
                    decode_errors += 1;
                    if decode_errors > MAX_DECODE_RETRIES {
                        return Err(decoding_error(path, e));
                    }
                }
                Err(e) => return Err(decoding_error(path, e)),
            }
        };
        let spec = decoded.spec().to_owned();
        let buffer = AudioSource::sample_buffer(decoded, &spec);
        Ok(AudioSource {
            decoder,
            format,
            track_id,
            buffer,
            offset: 0,
            spec,
        })
    }

    fn sample_buffer(decoded: AudioBufferRef, spec: &SignalSpec) -> SampleBuffer<f32> {
        let duration = units::Duration::from(decoded.capacity() as u64);
        let mut buffer = SampleBuffer::<f32>::new(duration, *spec);
        buffer.copy_interleaved_ref(decoded);
        buffer
    }

    /// Collapse the interleaved channels to mono. Stereo is averaged and
    /// scaled by √2, matching what ffmpeg does for a two-channel
    /// downmix; anything wider is plainly averaged.
    fn into_mono_samples(self) -> Vec<f32> {
        let num_channels = self.spec.channels.count();
        match num_channels {
            1 => self.collect(),
            2 => {
                let mut mono = Vec::new();
                let mut samples = self.peekable();
                while let Some(left) = samples.next() {
                    let right = samples.next().unwrap_or_default();
                    mono.push((left + right) * SQRT_2 / 2.0);
                }
                mono
            }
            _ => {
                warn!("audio source has {num_channels} channels, averaging them down to mono");
                let mut mono = Vec::new();
                let mut samples = self.peekable();
                while samples.peek().is_some() {
                    let sum = samples.by_ref().take(num_channels).sum::<f32>();
                    mono.push(sum / num_channels as f32);
                }
                mono
            }
        }
    }
}

impl Iterator for AudioSource {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buffer.len() {
            let mut decode_errors = 0;
            let decoded = loop {
                let packet = self.format.next_packet().ok()?;
                if packet.track_id() != self.track_id {
                    continue;
                }
                match self.decoder.decode(&packet) {
                    // Skip metadata-only packets, they carry no frames.
                    Ok(decoded) if decoded.frames() > 0 => break decoded,
                    Ok(_) => continue,
                    Err(_) => {
                        decode_errors += 1;
                        if decode_errors > MAX_DECODE_RETRIES {
                            return None;
                        }
                    }
                }
            };
            decoded.spec().clone_into(&mut self.spec);
            self.buffer = AudioSource::sample_buffer(decoded, &self.spec);
            self.offset = 0;
        }

        let sample = *self.buffer.samples().get(self.offset)?;
        self.offset += 1;
        Some(sample)
    }
}

/// Decode `path` to mono samples at `sample_rate` Hz.
///
/// Fails on unreadable or empty audio; resampling only happens when the
/// file's native rate differs from the requested one.
pub(crate) fn decode(path: &Path, sample_rate: u32) -> SegnoResult<Vec<f32>> {
    let source = AudioSource::open(path)?;
    let native_rate = source.spec.rate;
    let mut mono = source.into_mono_samples();
    if mono.is_empty() {
        return Err(decoding_error(path, "no audio samples decoded"));
    }

    if native_rate == sample_rate {
        mono.shrink_to_fit();
        return Ok(mono);
    }

    const CHUNK_SIZE: usize = 1024;
    let mut resampler =
        FftFixedIn::new(native_rate as usize, sample_rate as usize, CHUNK_SIZE, 1, 1)
            .map_err(|e| decoding_error(path, e))?;
    let delay = resampler.output_delay();
    let new_length = mono.len() * sample_rate as usize / native_rate as usize;

    let mut resampled = Vec::with_capacity(new_length + delay);
    let mut output_buffer = resampler.output_buffer_allocate(true);
    let mut input_buffer = Vec::with_capacity(CHUNK_SIZE);
    let mut samples = mono.into_iter().peekable();

    while samples.peek().is_some() {
        input_buffer.clear();
        input_buffer.extend(
            samples
                .by_ref()
                .chain(std::iter::repeat(0.0))
                .take(CHUNK_SIZE),
        );
        let (_, output_written) = resampler
            .process_into_buffer(&[&input_buffer], output_buffer.as_mut_slice(), None)
            .map_err(|e| decoding_error(path, e))?;
        resampled.extend_from_slice(&output_buffer[0][..output_written]);
    }

    // Flush the resampler's tail.
    if resampled.len() < new_length + delay {
        let (_, output_written) = resampler
            .process_partial_into_buffer(
                Option::<&[&[f32]]>::None,
                output_buffer.as_mut_slice(),
                None,
            )
            .map_err(|e| decoding_error(path, e))?;
        resampled.extend_from_slice(&output_buffer[0][..output_written]);
    }

    let end = resampled.len().min(new_length + delay);
    Ok(resampled[delay.min(end)..end].to_vec())
}
