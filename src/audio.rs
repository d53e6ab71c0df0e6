use std::borrow::Cow;

/// Sample rate of the telephony leg.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8_000;
const ULAW_BIAS: i16 = 33;
const ULAW_CLIP: i16 = 0x1FFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioFormat {
    /// G.711 mu-law, 8 kHz mono. What Twilio media streams carry.
    G711Ulaw,
    /// Signed 16-bit little-endian mono.
    Pcm16 { sample_rate: u32 },
}

impl AudioFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "g711_ulaw" | "mulaw" | "ulaw" => Some(AudioFormat::G711Ulaw),
            "pcm16" => Some(AudioFormat::Pcm16 { sample_rate: 24_000 }),
            _ => None,
        }
    }

    /// Name used in the voice model's session configuration.
    pub fn wire_name(&self) -> &'static str {
        match self {
            AudioFormat::G711Ulaw => "g711_ulaw",
            AudioFormat::Pcm16 { .. } => "pcm16",
        }
    }

    fn sample_rate(&self) -> u32 {
        match self {
            AudioFormat::G711Ulaw => TELEPHONY_SAMPLE_RATE,
            AudioFormat::Pcm16 { sample_rate } => *sample_rate,
        }
    }
}

pub fn ulaw_encode(sample: i16) -> u8 {
    let magnitude = if sample < 0 {
        ((!sample as u16) >> 2) as i16 + ULAW_BIAS
    } else {
        (sample >> 2) + ULAW_BIAS
    };
    let magnitude = magnitude.min(ULAW_CLIP);

    let mut segment = 1;
    let mut rest = magnitude >> 6;
    while rest != 0 {
        segment += 1;
        rest >>= 1;
    }
    let high = 0x08 - segment;
    let low = 0x0F - ((magnitude >> segment) & 0x0F);
    let mut encoded = (high << 4) | low;
    if sample >= 0 {
        encoded |= 0x80;
    }
    encoded as u8
}

pub fn ulaw_decode(encoded: u8) -> i16 {
    let sign = if encoded < 0x80 { -1 } else { 1 };
    let inverted = !encoded as i16;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = inverted & 0x0F;
    let step = 4 << (exponent + 1);
    sign * ((0x80 << exponent) + step * mantissa + step / 2 - 4 * ULAW_BIAS)
}

fn decode(frame: &[u8], format: AudioFormat) -> Vec<i16> {
    match format {
        AudioFormat::G711Ulaw => frame.iter().map(|b| ulaw_decode(*b)).collect(),
        AudioFormat::Pcm16 { .. } => frame
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect(),
    }
}

fn encode(samples: &[i16], format: AudioFormat) -> Vec<u8> {
    match format {
        AudioFormat::G711Ulaw => samples.iter().map(|s| ulaw_encode(*s)).collect(),
        AudioFormat::Pcm16 { .. } => samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
    }
}

/// Nearest-sample rate conversion; adequate for narrowband speech.
fn resample(samples: Vec<i16>, from: u32, to: u32) -> Vec<i16> {
    if from == to || samples.is_empty() {
        return samples;
    }
    let out_len = (samples.len() as u64 * u64::from(to) / u64::from(from)) as usize;
    (0..out_len)
        .map(|i| {
            let src = (i as u64 * u64::from(from) / u64::from(to)) as usize;
            samples[src.min(samples.len() - 1)]
        })
        .collect()
}

/// Re-encode one frame. Frames already in the target format are passed through untouched.
pub fn transcode(frame: &[u8], from: AudioFormat, to: AudioFormat) -> Cow<'_, [u8]> {
    if from == to {
        return Cow::Borrowed(frame);
    }
    let samples = resample(decode(frame, from), from.sample_rate(), to.sample_rate());
    Cow::Owned(encode(&samples, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_reference_values() {
        assert_eq!(ulaw_encode(0), 0xff);
        assert_eq!(ulaw_encode(128), 0xef);
        assert_eq!(ulaw_encode(1024), 0xcd);
        assert_eq!(ulaw_encode(-128), 0x6f);
        assert_eq!(ulaw_encode(-1024), 0x4d);
    }

    #[test]
    fn ulaw_is_close_to_input() {
        for sample in [0i16, 100, -100, 1_000, -1_000, 10_000, -10_000, i16::MAX, i16::MIN] {
            let decoded = ulaw_decode(ulaw_encode(sample));
            let error = (i32::from(decoded) - i32::from(sample)).abs();
            assert!(error < 2_000, "{sample} -> {decoded}");
        }
    }

    #[test]
    fn same_format_is_borrowed() {
        let frame = [0xffu8; 160];
        assert!(matches!(
            transcode(&frame, AudioFormat::G711Ulaw, AudioFormat::G711Ulaw),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn pcm24k_to_ulaw_downsamples() {
        let pcm = AudioFormat::Pcm16 { sample_rate: 24_000 };
        // 20ms at 24kHz
        let frame: Vec<u8> = std::iter::repeat(1_000i16.to_le_bytes())
            .take(480)
            .flatten()
            .collect();
        let out = transcode(&frame, pcm, AudioFormat::G711Ulaw);
        assert_eq!(out.len(), 160);
        assert!(out.iter().all(|b| *b == ulaw_encode(1_000)));

        let back = transcode(&out, AudioFormat::G711Ulaw, pcm);
        assert_eq!(back.len(), 960);
    }

    #[test]
    fn parse_formats() {
        assert_eq!(AudioFormat::parse("g711_ulaw"), Some(AudioFormat::G711Ulaw));
        assert_eq!(
            AudioFormat::parse("PCM16"),
            Some(AudioFormat::Pcm16 { sample_rate: 24_000 })
        );
        assert_eq!(AudioFormat::parse("opus"), None);
    }
}
