//! Reassembly of per-chunk audio into one waveform.

use std::collections::BTreeMap;

use crate::audio::AudioBuffer;
use crate::config::{AssemblyConfig, GapPolicy};
use crate::error::{Result, VoiceCloneError};

/// Audio for one successfully synthesized chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub index: usize,
    pub audio: AudioBuffer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledAudio {
    pub audio: AudioBuffer,
    /// Indices of chunks that had no segment, ascending
    pub gaps: Vec<usize>,
}

/// Concatenates segments in chunk-index order.
#[derive(Debug, Clone, Default)]
pub struct SegmentAssembler {
    config: AssemblyConfig,
}

impl SegmentAssembler {
    pub fn new(config: AssemblyConfig) -> Self {
        Self { config }
    }

    /// Join `segments` (in any order) for a text of `expected_chunk_count` chunks.
    ///
    /// # Errors
    ///
    /// - [`VoiceCloneError::IncompatibleSegments`] on mixed sample rates or
    ///   channel counts, duplicate indices, or indices outside the chunk range
    /// - [`VoiceCloneError::AllChunksFailed`] when there is nothing to join
    pub fn assemble(
        &self,
        segments: Vec<AudioSegment>,
        expected_chunk_count: usize,
    ) -> Result<AssembledAudio> {
        let mut by_index: BTreeMap<usize, AudioBuffer> = BTreeMap::new();
        for segment in segments {
            if segment.index >= expected_chunk_count {
                return Err(VoiceCloneError::IncompatibleSegments(format!(
                    "segment index {} is outside 0..{}",
                    segment.index, expected_chunk_count
                )));
            }
            if by_index.insert(segment.index, segment.audio).is_some() {
                return Err(VoiceCloneError::IncompatibleSegments(format!(
                    "duplicate segment for chunk {}",
                    segment.index
                )));
            }
        }

        let Some(first) = by_index.values().next() else {
            return Err(VoiceCloneError::AllChunksFailed {
                chunk_count: expected_chunk_count,
            });
        };
        let (sample_rate, channels) = (first.sample_rate, first.channels);
        if let Some((idx, bad)) = by_index
            .iter()
            .find(|(_, a)| a.sample_rate != sample_rate || a.channels != channels)
        {
            return Err(VoiceCloneError::IncompatibleSegments(format!(
                "chunk {idx} is {} Hz/{}ch but earlier chunks are {sample_rate} Hz/{channels}ch",
                bad.sample_rate, bad.channels
            )));
        }

        let padding = (self.config.inter_segment_silence_secs > 0.0).then(|| {
            AudioBuffer::silence(self.config.inter_segment_silence_secs, sample_rate, channels)
        });
        let gap_fill = match self.config.gap_policy {
            GapPolicy::Skip => None,
            GapPolicy::Silence { secs } => Some(AudioBuffer::silence(secs, sample_rate, channels)),
        };

        let total: usize = by_index.values().map(|a| a.len()).sum();
        let mut output = AudioBuffer::with_channels(Vec::with_capacity(total), sample_rate, channels);
        let mut gaps = Vec::new();
        let mut pieces = 0;

        for idx in 0..expected_chunk_count {
            let piece = match by_index.get(&idx) {
                Some(audio) => audio,
                None => {
                    tracing::warn!("Chunk {idx} has no audio; leaving a gap");
                    gaps.push(idx);
                    match &gap_fill {
                        Some(silence) => silence,
                        None => continue,
                    }
                }
            };
            if pieces > 0 {
                if let Some(pad) = &padding {
                    output.extend_from(pad)?;
                }
            }
            output.extend_from(piece)?;
            pieces += 1;
        }

        tracing::info!(
            "Assembled {} segment(s) into {:.2}s ({} gap(s))",
            by_index.len(),
            output.duration(),
            gaps.len()
        );
        Ok(AssembledAudio {
            audio: output,
            gaps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(index: usize, value: f32, len: usize) -> AudioSegment {
        AudioSegment {
            index,
            audio: AudioBuffer::new(vec![value; len], 24000),
        }
    }

    #[test]
    fn test_orders_by_index() {
        let assembler = SegmentAssembler::default();
        let result = assembler
            .assemble(
                vec![segment(2, 0.3, 2), segment(0, 0.1, 2), segment(1, 0.2, 2)],
                3,
            )
            .unwrap();
        assert_eq!(result.audio.samples, vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
        assert!(result.gaps.is_empty());
    }

    #[test]
    fn test_duration_is_sum() {
        let assembler = SegmentAssembler::default();
        let result = assembler
            .assemble(
                vec![segment(0, 0.1, 24000), segment(1, 0.1, 12000)],
                2,
            )
            .unwrap();
        assert!((result.audio.duration() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_gap_skip_and_silence() {
        let segments = vec![segment(0, 0.5, 3), segment(2, 0.5, 3)];

        let skipped = SegmentAssembler::default()
            .assemble(segments.clone(), 3)
            .unwrap();
        assert_eq!(skipped.audio.len(), 6);
        assert_eq!(skipped.gaps, vec![1]);

        let filled = SegmentAssembler::new(AssemblyConfig {
            gap_policy: GapPolicy::Silence { secs: 0.001 },
            ..Default::default()
        })
        .assemble(segments, 3)
        .unwrap();
        assert_eq!(filled.audio.len(), 6 + 24);
        assert_eq!(filled.audio.samples[3], 0.0);
        assert_eq!(filled.gaps, vec![1]);
    }

    #[test]
    fn test_inter_segment_silence() {
        let assembler = SegmentAssembler::new(AssemblyConfig {
            inter_segment_silence_secs: 0.25,
            ..Default::default()
        });
        let result = assembler
            .assemble(vec![segment(0, 0.1, 100), segment(1, 0.1, 100)], 2)
            .unwrap();
        assert_eq!(result.audio.len(), 200 + 6000);
    }

    #[test]
    fn test_mismatched_rate_rejected() {
        let mut odd = segment(1, 0.1, 10);
        odd.audio.sample_rate = 16000;
        let err = SegmentAssembler::default()
            .assemble(vec![segment(0, 0.1, 10), odd], 2)
            .unwrap_err();
        assert!(matches!(err, VoiceCloneError::IncompatibleSegments(_)));
    }

    #[test]
    fn test_mismatched_channels_rejected() {
        let stereo = AudioSegment {
            index: 1,
            audio: AudioBuffer::with_channels(vec![0.0; 10], 24000, 2),
        };
        assert!(SegmentAssembler::default()
            .assemble(vec![segment(0, 0.1, 10), stereo], 2)
            .is_err());
    }

    #[test]
    fn test_duplicate_and_out_of_range() {
        let assembler = SegmentAssembler::default();
        assert!(matches!(
            assembler.assemble(vec![segment(0, 0.1, 1), segment(0, 0.2, 1)], 2),
            Err(VoiceCloneError::IncompatibleSegments(_))
        ));
        assert!(matches!(
            assembler.assemble(vec![segment(5, 0.1, 1)], 2),
            Err(VoiceCloneError::IncompatibleSegments(_))
        ));
    }

    #[test]
    fn test_nothing_to_assemble() {
        assert!(matches!(
            SegmentAssembler::default().assemble(vec![], 4),
            Err(VoiceCloneError::AllChunksFailed { chunk_count: 4 })
        ));
    }
}
