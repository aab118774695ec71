use std::io::{Cursor, Seek, Write};
use std::path::Path;

use anyhow::Context;

use crate::export::AudioBuffer;

/// Float sample to 16-bit PCM: negative half scales by 0x8000, positive by
/// 0x7fff, so both -1.0 and 1.0 reach full scale.
pub fn quantize(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 { (s * 32768.0) as i16 } else { (s * 32767.0) as i16 }
}

fn spec(buffer: &AudioBuffer) -> hound::WavSpec {
    hound::WavSpec {
        channels:        1,
        sample_rate:     buffer.sample_rate(),
        bits_per_sample: 16,
        sample_format:   hound::SampleFormat::Int,
    }
}

fn write_samples<W: Write + Seek>(writer: W, buffer: &AudioBuffer) -> anyhow::Result<()> {
    let mut wav = hound::WavWriter::new(writer, spec(buffer)).context("failed to start wav stream")?;
    for &s in buffer.samples() {
        wav.write_sample(quantize(s)).context("failed to write wav sample")?;
    }
    wav.finalize().context("failed to finalize wav")?;
    Ok(())
}

pub fn write_wav(path: impl AsRef<Path>, buffer: &AudioBuffer) -> anyhow::Result<()> {
    let path = path.as_ref();
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create wav file: {}", path.display()))?;
    write_samples(std::io::BufWriter::new(file), buffer)?;
    log::info!("wrote {} ({:.2}s)", path.display(), buffer.duration_seconds());
    Ok(())
}

/// Encode to an in-memory WAV file.
pub fn wav_bytes(buffer: &AudioBuffer) -> anyhow::Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    write_samples(&mut cursor, buffer)?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_is_asymmetric_and_clamped() {
        assert_eq!(quantize(1.0), 32767);
        assert_eq!(quantize(-1.0), -32768);
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(3.0), 32767);
        assert_eq!(quantize(-0.5), -16384);
    }

    #[test]
    fn encoded_file_reads_back_as_mono_16_bit() {
        let buf = AudioBuffer::new(22_050, vec![0.0, 0.5, -1.0, 1.0]);
        let bytes = wav_bytes(&buf).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");

        let mut reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 22_050);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 16383, -32768, 32767]);
    }

    #[test]
    fn empty_buffer_is_still_a_valid_file() {
        let bytes = wav_bytes(&AudioBuffer::new(44_100, Vec::new())).unwrap();
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.duration(), 0);
    }
}
