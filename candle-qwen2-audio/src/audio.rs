//! Fetching and decoding audio clips into mono waveforms.

use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::{Error, Result};

const KNOWN_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "ogg", "m4a", "aac", "opus", "webm"];

/// Where an audio clip comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    Url(String),
    Path(PathBuf),
}

impl fmt::Display for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

impl AudioSource {
    fn extension(&self) -> Option<String> {
        let ext = match self {
            Self::Url(url) => {
                let path = url.split(['?', '#']).next().unwrap_or(url);
                path.rsplit_once('.').map(|(_, ext)| ext.to_string())
            }
            Self::Path(path) => path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_string),
        }?;
        let ext = ext.to_ascii_lowercase();
        KNOWN_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
    }

    fn open(&self) -> Result<Box<dyn MediaSource>> {
        match self {
            Self::Url(url) => {
                let http_err = |source: reqwest::Error| Error::Http {
                    url: url.clone(),
                    source,
                };
                let bytes = reqwest::blocking::get(url)
                    .and_then(|resp| resp.error_for_status())
                    .and_then(|resp| resp.bytes())
                    .map_err(http_err)?;
                tracing::debug!(url, bytes = bytes.len(), "fetched audio");
                Ok(Box::new(Cursor::new(bytes.to_vec())))
            }
            Self::Path(path) => {
                let file = std::fs::File::open(path).map_err(Error::io(path))?;
                Ok(Box::new(file))
            }
        }
    }
}

/// Loads `source` as a mono waveform at `sample_rate` Hz.
pub fn load_waveform(source: &AudioSource, sample_rate: u32) -> Result<Vec<f32>> {
    let mss = MediaSourceStream::new(source.open()?, Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = source.extension() {
        hint.with_extension(&ext);
    }
    let (samples, source_rate, channels) = decode(mss, hint)?;
    let mono = to_mono(&samples, channels)?;
    tracing::debug!(
        %source,
        source_rate,
        channels,
        frames = mono.len(),
        "decoded audio"
    );
    resample(&mono, source_rate, sample_rate)
}

/// Decodes the default track into interleaved f32 samples, returning them
/// with the sample rate and channel count.
fn decode(mss: MediaSourceStream, hint: Hint) -> Result<(Vec<f32>, u32, usize)> {
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::Audio(format!("unsupported audio format: {e}")))?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| Error::Audio("no audio track".to_string()))?;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| Error::Audio("unknown sample rate".to_string()))?;
    // Some containers only know the layout once a packet is decoded.
    let declared_channels = track.codec_params.channels.map(|c| c.count());
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| Error::Audio(format!("no decoder for the audio track: {e}")))?;
    let track_id = track.id;

    let mut samples = Vec::new();
    let mut decoded_channels = None;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(e) => return Err(Error::Audio(format!("reading packet: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(Error::Audio(format!("decoding packet: {e}"))),
        };
        let spec = *decoded.spec();
        if decoded_channels.is_none() {
            decoded_channels = Some(spec.channels.count());
        }
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buf.samples());
    }
    let channels = decoded_channels.or(declared_channels).unwrap_or(1);
    Ok((samples, sample_rate, channels))
}

/// Averages interleaved channels into a single one.
pub fn to_mono(samples: &[f32], channels: usize) -> Result<Vec<f32>> {
    match channels {
        0 => Err(Error::Audio("zero channels".to_string())),
        1 => Ok(samples.to_vec()),
        _ if samples.len() % channels != 0 => Err(Error::Audio(format!(
            "{} samples do not split into {channels} channels",
            samples.len()
        ))),
        _ => Ok(samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()),
    }
}

/// Band-limited sinc resampling of a mono signal, the output holds
/// `ceil(len * to_hz / from_hz)` samples.
pub fn resample(samples: &[f32], from_hz: u32, to_hz: u32) -> Result<Vec<f32>> {
    if from_hz == 0 || to_hz == 0 {
        return Err(Error::Audio(format!(
            "cannot resample from {from_hz} Hz to {to_hz} Hz"
        )));
    }
    if from_hz == to_hz || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to_hz as f64 / from_hz as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, samples.len(), 1)
        .map_err(|e| Error::Audio(format!("resampler {from_hz} -> {to_hz}: {e}")))?;
    let resample_err = |e: rubato::ResampleError| Error::Audio(format!("resampling: {e}"));
    let waves_in = vec![samples.to_vec()];
    let mut out = resampler.process(&waves_in, None).map_err(resample_err)?;
    // The filter holds back the last samples until it is fed a zero chunk.
    let tail = resampler
        .process_partial(None::<&[Vec<f32>]>, None)
        .map_err(resample_err)?;
    let mut wav = out
        .pop()
        .ok_or_else(|| Error::Audio("resampler produced no channel".to_string()))?;
    wav.extend(tail.into_iter().flatten());
    let expected = (samples.len() as u64 * to_hz as u64).div_ceil(from_hz as u64);
    wav.truncate(expected as usize);
    Ok(wav)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_is_averaged() -> anyhow::Result<()> {
        let mono = to_mono(&[1.0, 0.0, 0.5, 0.5, -1.0, 1.0], 2)?;
        assert_eq!(mono, vec![0.5, 0.5, 0.0]);
        assert_eq!(to_mono(&[0.25, 0.5], 1)?, vec![0.25, 0.5]);
        assert!(to_mono(&[0.0; 5], 2).is_err());
        assert!(to_mono(&[0.0; 4], 0).is_err());
        Ok(())
    }

    #[test]
    fn same_rate_resample_is_identity() -> anyhow::Result<()> {
        let x = vec![0.0f32, 0.5, -0.25, 1.0];
        assert_eq!(resample(&x, 16_000, 16_000)?, x);
        assert!(resample(&x, 0, 16_000).is_err());
        Ok(())
    }

    #[test]
    fn downsampling_scales_the_length() -> anyhow::Result<()> {
        let x: Vec<f32> = (0..4800).map(|i| (i as f32 * 0.01).sin()).collect();
        let y = resample(&x, 48_000, 16_000)?;
        assert_eq!(y.len(), 1600);
        let y = resample(&x[..4799], 48_000, 16_000)?;
        assert_eq!(y.len(), 1600);
        let y = resample(&x[..1000], 8_000, 16_000)?;
        assert_eq!(y.len(), 2000);
        Ok(())
    }

    #[test]
    fn resampling_keeps_the_end_of_the_clip() -> anyhow::Result<()> {
        let x: Vec<f32> = (0..4800).map(|i| i as f32 / 4799.).collect();
        let y = resample(&x, 48_000, 16_000)?;
        // Output sample 1580 sits on input sample 4740.
        let expected = 4740. / 4799.;
        assert!(
            (y[1580] - expected).abs() < 0.02,
            "got {} instead of {expected}",
            y[1580]
        );
        Ok(())
    }

    fn write_pcm16_wav(
        path: &std::path::Path,
        rate: u32,
        channels: u16,
        frames: &[i16],
    ) -> anyhow::Result<()> {
        let data_len = (frames.len() * 2) as u32;
        let block_align = channels * 2;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for sample in frames {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    #[test]
    fn stereo_wav_is_decoded_to_mono() -> anyhow::Result<()> {
        let name = format!("qwen2_audio_stereo_{}.wav", std::process::id());
        let path = std::env::temp_dir().join(name);
        write_pcm16_wav(&path, 16_000, 2, &[16384, 0, 0, -16384, 8192, 8192])?;
        let wav = load_waveform(&AudioSource::Path(path.clone()), 16_000)?;
        std::fs::remove_file(&path)?;
        assert_eq!(wav, vec![0.25, -0.25, 0.25]);
        Ok(())
    }

    #[test]
    fn extension_hints() {
        let url = AudioSource::Url("https://host/glass-breaking.mp3?download=1".to_string());
        assert_eq!(url.extension().as_deref(), Some("mp3"));
        let path = AudioSource::Path(PathBuf::from("/tmp/clip.WAV"));
        assert_eq!(path.extension().as_deref(), Some("wav"));
        let unknown = AudioSource::Url("https://host/stream".to_string());
        assert_eq!(unknown.extension(), None);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let source = AudioSource::Path(PathBuf::from("/definitely/not/here.wav"));
        assert!(matches!(
            load_waveform(&source, 16_000),
            Err(Error::Io { .. })
        ));
    }
}
