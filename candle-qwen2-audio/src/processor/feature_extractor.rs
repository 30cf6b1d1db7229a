//! Whisper log-mel features.
//!
//! Waveforms are padded (or truncated) to a fixed 30 s window before the
//! STFT, so every clip yields the same number of frames; the number of frames
//! backed by real samples is reported alongside.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::config::FeatureExtractorConfig;

const MEL_FLOOR: f64 = 1e-10;

/// Log-mel features for one clip, row-major `(feature_size, frames)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub data: Vec<f32>,
    pub frames: usize,
    /// Frames covering real samples, the rest cover padding.
    pub valid_frames: usize,
}

pub struct WhisperFeatureExtractor {
    cfg: FeatureExtractorConfig,
    window: Vec<f64>,
    mel_filters: Vec<Vec<f64>>,
    fft: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for WhisperFeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperFeatureExtractor")
            .field("cfg", &self.cfg)
            .finish()
    }
}

impl WhisperFeatureExtractor {
    pub fn new(cfg: FeatureExtractorConfig) -> Self {
        let window = hann_window_periodic(cfg.n_fft);
        let mel_filters = mel_filter_bank_slaney(
            1 + cfg.n_fft / 2,
            cfg.feature_size,
            0.0,
            cfg.sampling_rate as f64 / 2.0,
            cfg.sampling_rate,
        );
        let fft = FftPlanner::<f64>::new().plan_fft_forward(cfg.n_fft);
        Self {
            cfg,
            window,
            mel_filters,
            fft,
        }
    }

    pub fn config(&self) -> &FeatureExtractorConfig {
        &self.cfg
    }

    /// Frames in the output window, padding included.
    pub fn frames(&self) -> usize {
        self.cfg.nb_max_frames()
    }

    /// Frames backed by the first `samples` samples, `ceil(samples / hop)`
    /// capped at the window length.
    pub fn valid_frames(&self, samples: usize) -> usize {
        samples.div_ceil(self.cfg.hop_length).min(self.frames())
    }

    pub fn extract(&self, wav: &[f32]) -> Features {
        let cfg = &self.cfg;
        let frames = self.frames();
        let valid_frames = self.valid_frames(wav.len());

        let mut signal: Vec<f64> = wav
            .iter()
            .take(cfg.n_samples)
            .map(|&x| f64::from(x))
            .collect();
        signal.resize(cfg.n_samples, f64::from(cfg.padding_value));

        let n_freq = 1 + cfg.n_fft / 2;
        let half = (cfg.n_fft / 2) as isize;
        let mut buf = vec![Complex::new(0.0, 0.0); cfg.n_fft];
        let mut power = vec![0.0f64; n_freq];
        let mut log_spec = vec![0f32; cfg.feature_size * frames];
        let mut max_log = f32::NEG_INFINITY;

        for frame in 0..frames {
            let start = (frame * cfg.hop_length) as isize - half;
            for (i, slot) in buf.iter_mut().enumerate() {
                let x = signal[reflect_index(start + i as isize, signal.len())];
                *slot = Complex::new(x * self.window[i], 0.0);
            }
            self.fft.process(&mut buf);
            for (p, c) in power.iter_mut().zip(buf.iter()) {
                *p = c.norm_sqr();
            }
            for (mel, filter) in self.mel_filters.iter().enumerate() {
                let energy: f64 = filter.iter().zip(power.iter()).map(|(w, p)| w * p).sum();
                let v = energy.max(MEL_FLOOR).log10() as f32;
                max_log = max_log.max(v);
                log_spec[mel * frames + frame] = v;
            }
        }

        let floor = max_log - 8.0;
        for v in log_spec.iter_mut() {
            *v = (v.max(floor) + 4.0) / 4.0;
        }
        Features {
            data: log_spec,
            frames,
            valid_frames,
        }
    }
}

fn hann_window_periodic(n: usize) -> Vec<f64> {
    let two_pi = std::f64::consts::PI * 2.0;
    (0..n)
        .map(|i| 0.5 - 0.5 * (two_pi * i as f64 / n as f64).cos())
        .collect()
}

fn reflect_index(i: isize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = (2 * (len - 1)) as isize;
    let j = i.rem_euclid(period);
    if j >= len as isize {
        (period - j) as usize
    } else {
        j as usize
    }
}

fn hertz_to_mel_slaney(freq: f64) -> f64 {
    let min_log_hertz = 1000.0;
    let min_log_mel = 15.0;
    let logstep = 27.0 / 6.4f64.ln();
    if freq >= min_log_hertz {
        min_log_mel + (freq / min_log_hertz).ln() * logstep
    } else {
        3.0 * freq / 200.0
    }
}

fn mel_to_hertz_slaney(mels: f64) -> f64 {
    let min_log_hertz = 1000.0;
    let min_log_mel = 15.0;
    let logstep = 6.4f64.ln() / 27.0;
    if mels >= min_log_mel {
        min_log_hertz * (logstep * (mels - min_log_mel)).exp()
    } else {
        200.0 * mels / 3.0
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (n as f64 - 1.0);
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Triangular filters on the slaney mel scale with slaney area
/// normalization, one row of `num_frequency_bins` weights per mel bin.
fn mel_filter_bank_slaney(
    num_frequency_bins: usize,
    num_mel_filters: usize,
    min_frequency: f64,
    max_frequency: f64,
    sampling_rate: u32,
) -> Vec<Vec<f64>> {
    let mel_freqs = linspace(
        hertz_to_mel_slaney(min_frequency),
        hertz_to_mel_slaney(max_frequency),
        num_mel_filters + 2,
    );
    let filter_freqs: Vec<f64> = mel_freqs.into_iter().map(mel_to_hertz_slaney).collect();
    let fft_freqs = linspace(0.0, sampling_rate as f64 / 2.0, num_frequency_bins);

    filter_freqs
        .windows(3)
        .map(|w| {
            let (left, center, right) = (w[0], w[1], w[2]);
            let enorm = 2.0 / (right - left).max(f64::MIN_POSITIVE);
            let down_width = (center - left).max(f64::MIN_POSITIVE);
            let up_width = (right - center).max(f64::MIN_POSITIVE);
            fft_freqs
                .iter()
                .map(|&f| {
                    let down = (f - left) / down_width;
                    let up = (right - f) / up_width;
                    down.min(up).max(0.0) * enorm
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> FeatureExtractorConfig {
        FeatureExtractorConfig {
            feature_size: 16,
            n_samples: 16_000,
            ..Default::default()
        }
    }

    #[test]
    fn default_window_is_three_thousand_frames() {
        let fe = WhisperFeatureExtractor::new(FeatureExtractorConfig::default());
        assert_eq!(fe.frames(), 3000);
        assert_eq!(fe.valid_frames(16_000), 100);
        assert_eq!(fe.valid_frames(16_001), 101);
        assert_eq!(fe.valid_frames(1), 1);
        assert_eq!(fe.valid_frames(0), 0);
        assert_eq!(fe.valid_frames(10 * 480_000), 3000);
    }

    #[test]
    fn silence_maps_to_the_floor() {
        let fe = WhisperFeatureExtractor::new(small_config());
        let features = fe.extract(&[]);
        assert_eq!(features.frames, 100);
        assert_eq!(features.valid_frames, 0);
        assert_eq!(features.data.len(), 16 * 100);
        // log10(1e-10) = -10, then (x + 4) / 4.
        assert!(features.data.iter().all(|&v| (v + 1.5).abs() < 1e-6));
    }

    #[test]
    fn dynamic_range_is_clamped_to_eight_decades() {
        let fe = WhisperFeatureExtractor::new(small_config());
        let wav: Vec<f32> = (0..8_000)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 16_000.0).sin() * 0.5)
            .collect();
        let features = fe.extract(&wav);
        assert_eq!(features.valid_frames, 50);
        let max = features.data.iter().copied().fold(f32::MIN, f32::max);
        let min = features.data.iter().copied().fold(f32::MAX, f32::min);
        assert!(max - min <= 2.0 + 1e-5, "range {min}..{max}");
        assert!(max > -1.5);
    }

    #[test]
    fn long_input_is_truncated() {
        let fe = WhisperFeatureExtractor::new(small_config());
        let long = vec![0.1f32; 40_000];
        let truncated = fe.extract(&long[..16_000]);
        let features = fe.extract(&long);
        assert_eq!(features.valid_frames, 100);
        assert_eq!(features, truncated);
    }

    #[test]
    fn mel_filters_are_triangles() {
        let filters = mel_filter_bank_slaney(201, 128, 0.0, 8000.0, 16_000);
        assert_eq!(filters.len(), 128);
        for row in filters.iter() {
            assert_eq!(row.len(), 201);
            assert!(row.iter().all(|&w| w >= 0.0));
            assert!(row.iter().any(|&w| w > 0.0));
        }
    }

    #[test]
    fn reflection_mirrors_without_repeating_the_edge() {
        assert_eq!(reflect_index(-1, 5), 1);
        assert_eq!(reflect_index(-2, 5), 2);
        assert_eq!(reflect_index(5, 5), 3);
        assert_eq!(reflect_index(2, 5), 2);
    }
}
