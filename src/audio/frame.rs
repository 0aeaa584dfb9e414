//! Raw PCM frame
//!
//! A frame is exactly what travels in one datagram: mono 16-bit signed
//! little-endian samples with no header.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::BYTES_PER_SAMPLE;
use crate::error::AudioError;

/// Immutable chunk of PCM samples. Empty means "nothing to send or play".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
}

impl AudioFrame {
    pub fn empty() -> Self {
        Self { data: Bytes::new() }
    }

    /// Wrap a raw buffer. Fails unless the length is a whole number of samples.
    pub fn from_bytes(data: Bytes) -> Result<Self, AudioError> {
        if data.len() % BYTES_PER_SAMPLE != 0 {
            return Err(AudioError::UnalignedFrame(data.len()));
        }
        Ok(Self { data })
    }

    /// Encode samples as little-endian PCM
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut buf = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for &sample in samples {
            buf.put_i16_le(sample);
        }
        Self { data: buf.freeze() }
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }

    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl TryFrom<Bytes> for AudioFrame {
    type Error = AudioError;

    fn try_from(data: Bytes) -> Result<Self, Self::Error> {
        Self::from_bytes(data)
    }
}

#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}
