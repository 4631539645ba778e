//! The unit of data that moves between pipeline stages.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Data kind carried by a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Audio,
    Text,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Audio => f.write_str("audio"),
            FrameKind::Text => f.write_str("text"),
        }
    }
}

/// One unit of audio or text.
///
/// Audio is raw 16-bit little-endian PCM; the bundled stages assume 16kHz mono.
/// A frame is moved, never shared: each hop hands ownership to exactly one
/// consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Audio(Bytes),
    Text(String),
}

impl Frame {
    pub fn audio(data: impl Into<Bytes>) -> Self {
        Frame::Audio(data.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Audio(_) => FrameKind::Audio,
            Frame::Text(_) => FrameKind::Text,
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Audio(data) => data.len(),
            Frame::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode little-endian 16-bit PCM bytes into samples. A trailing odd byte is ignored.
pub fn pcm_from_bytes(raw: &[u8]) -> Vec<i16> {
    raw.chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Decodes a PCM byte stream that arrives in arbitrary chunks.
///
/// A chunk ending mid-sample keeps its last byte until the next chunk
/// completes it, so sample alignment survives odd-length deliveries.
#[derive(Debug, Default)]
pub struct PcmAssembler {
    carry: Option<u8>,
}

impl PcmAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, raw: &[u8]) -> Vec<i16> {
        let mut raw = raw;
        let mut samples = Vec::with_capacity(raw.len().div_ceil(2));
        if let Some(low) = self.carry.take() {
            match raw.split_first() {
                Some((&high, rest)) => {
                    samples.push(i16::from_le_bytes([low, high]));
                    raw = rest;
                }
                None => {
                    self.carry = Some(low);
                    return samples;
                }
            }
        }
        samples.extend(pcm_from_bytes(raw));
        if raw.len() % 2 == 1 {
            self.carry = raw.last().copied();
        }
        samples
    }

    /// True while half a sample is waiting for its second byte.
    pub fn has_carry(&self) -> bool {
        self.carry.is_some()
    }

    pub fn clear(&mut self) {
        self.carry = None;
    }
}

/// Encode samples as little-endian 16-bit PCM bytes.
pub fn pcm_to_bytes(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind() {
        assert_eq!(Frame::audio(vec![0u8; 4]).kind(), FrameKind::Audio);
        assert_eq!(Frame::text("hi").kind(), FrameKind::Text);
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(Frame::audio(vec![1u8, 2, 3]).len(), 3);
        assert!(Frame::text("").is_empty());
    }

    #[test]
    fn test_pcm_conversion() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = pcm_to_bytes(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(pcm_from_bytes(&bytes), samples);
    }

    #[test]
    fn test_pcm_odd_trailing_byte_ignored() {
        assert_eq!(pcm_from_bytes(&[1, 0, 7]), vec![1]);
    }

    #[test]
    fn test_assembler_keeps_alignment_across_odd_chunks() {
        let samples = vec![1000i16, -1000, 1000, -1000, 42];
        let bytes = pcm_to_bytes(&samples);
        let mut assembler = PcmAssembler::new();

        let mut out = assembler.push(&bytes[..3]);
        assert_eq!(out, vec![1000]);
        assert!(assembler.has_carry());
        out.extend(assembler.push(&bytes[3..4]));
        out.extend(assembler.push(&bytes[4..]));
        assert_eq!(out, samples);
        assert!(!assembler.has_carry());
    }

    #[test]
    fn test_assembler_empty_chunk_keeps_carry() {
        let mut assembler = PcmAssembler::new();
        assert!(assembler.push(&[0x34]).is_empty());
        assert!(assembler.push(&[]).is_empty());
        assert_eq!(assembler.push(&[0x12]), vec![0x1234]);

        assembler.push(&[9]);
        assembler.clear();
        assert_eq!(assembler.push(&[1, 0]), vec![1]);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(FrameKind::Audio.to_string(), "audio");
        assert_eq!(FrameKind::Text.to_string(), "text");
    }
}
