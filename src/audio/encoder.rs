//! Capture format → wire format.
//!
//! Capture frames carry `f32` samples in [-1, 1]; the wire carries signed 16-bit
//! little-endian PCM with the same sample count and order.

use bytes::{BufMut, Bytes, BytesMut};

/// A block of mono capture samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The encoded form of one [`AudioFrame`]: one binary message on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pcm16: Vec<i16>,
}

impl WireFrame {
    pub fn pcm16(&self) -> &[i16] {
        &self.pcm16
    }

    pub fn len(&self) -> usize {
        self.pcm16.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcm16.is_empty()
    }

    /// Raw little-endian payload, no header.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.pcm16.len() * 2);
        for &s in &self.pcm16 {
            buf.put_i16_le(s);
        }
        buf.freeze()
    }

    /// Rebuild a frame from a binary payload. A trailing odd byte is ignored.
    pub fn from_le_bytes(data: &[u8]) -> Self {
        let pcm16 = data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Self { pcm16 }
    }

    /// Inverse of [`encode`]'s scaling.
    pub fn to_f32(&self) -> Vec<f32> {
        self.pcm16
            .iter()
            .map(|&s| {
                if s < 0 {
                    s as f32 / 32768.0
                } else {
                    s as f32 / 32767.0
                }
            })
            .collect()
    }
}

/// Encode one sample: clamp, then scale negatives by 32768 and the rest by 32767.
#[inline]
pub fn encode_sample(s: f32) -> i16 {
    // NaN 视为静音
    let s = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

pub fn encode_samples(samples: &[f32]) -> WireFrame {
    WireFrame {
        pcm16: samples.iter().map(|&s| encode_sample(s)).collect(),
    }
}

/// Consume a capture frame and produce its wire form.
pub fn encode(frame: AudioFrame) -> WireFrame {
    encode_samples(&frame.samples)
}
