use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use log::debug;

use super::TensorChunk;
use crate::err::{PipelineError, PipelineResult};

/// Splits a payload into `ceil(len / chunk_size)` frames, lazily. Frames share
/// the payload's buffer, so producing them never copies data.
#[derive(Debug)]
pub struct ChunkEncoder {
    payload: Bytes,
    chunk_size: usize,
    offset: usize,
    finished: bool,
}

impl ChunkEncoder {
    pub fn new(payload: impl Into<Bytes>, chunk_size: usize) -> Self {
        Self {
            payload: payload.into(),
            chunk_size: chunk_size.max(1),
            offset: 0,
            finished: false,
        }
    }

    /// Number of frames the encoder yields in total; an empty payload still takes one.
    pub fn frame_count(&self) -> usize {
        self.payload.len().div_ceil(self.chunk_size).max(1)
    }
}

impl Iterator for ChunkEncoder {
    type Item = TensorChunk;

    fn next(&mut self) -> Option<TensorChunk> {
        if self.finished {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.payload.len());
        let chunk_data = self.payload.slice(self.offset..end);
        self.offset = end;
        self.finished = end == self.payload.len();
        Some(TensorChunk {
            chunk_data,
            is_last: self.finished,
        })
    }
}

pub fn encode(payload: impl Into<Bytes>, chunk_size: usize) -> ChunkEncoder {
    ChunkEncoder::new(payload, chunk_size)
}

/// Reassembles frames in arrival order until the one flagged `is_last`.
///
/// Stops on the flag, not on stream closure: frames behind the final one are
/// left unread. A stream that ends first yields `TruncatedStream`, and an error
/// item from the transport is returned as is.
pub async fn decode<S>(mut stream: S) -> PipelineResult<Bytes>
where
    S: Stream<Item = Result<TensorChunk, tonic::Status>> + Unpin,
{
    let mut buffer = BytesMut::new();
    let mut frames = 0usize;

    while let Some(item) = stream.next().await {
        let chunk = item?;
        frames += 1;
        buffer.extend_from_slice(&chunk.chunk_data);
        if chunk.is_last {
            debug!("Reassembled {} byte(s) from {} frame(s)", buffer.len(), frames);
            return Ok(buffer.freeze());
        }
    }

    Err(PipelineError::TruncatedStream {
        frames,
        bytes: buffer.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_stream(
        frames: Vec<TensorChunk>,
    ) -> impl Stream<Item = Result<TensorChunk, tonic::Status>> + Unpin {
        futures::stream::iter(frames.into_iter().map(Ok))
    }

    #[test]
    fn test_empty_payload_single_final_frame() {
        let frames: Vec<_> = encode(Vec::new(), 4).collect();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_last);
        assert!(frames[0].chunk_data.is_empty());
    }

    #[test]
    fn test_frame_invariants() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for chunk_size in [1, 7, 64, 999, 1000, 1001, 4096] {
            let encoder = encode(payload.clone(), chunk_size);
            let expected = encoder.frame_count();
            let frames: Vec<_> = encoder.collect();
            assert_eq!(frames.len(), expected);
            assert_eq!(frames.len(), payload.len().div_ceil(chunk_size));

            let (last, body) = frames.split_last().unwrap();
            assert!(last.is_last);
            assert!(!last.chunk_data.is_empty());
            assert!(last.chunk_data.len() <= chunk_size);
            for frame in body {
                assert!(!frame.is_last);
                assert_eq!(frame.chunk_data.len(), chunk_size);
            }
        }
    }

    #[test]
    fn test_ten_megabytes_in_one_megabyte_chunks() {
        let mb = 1024 * 1024;
        let frames: Vec<_> = encode(vec![0u8; 10 * mb], mb).collect();
        assert_eq!(frames.len(), 10);
        assert!(frames[9].is_last);
        assert!(frames[..9].iter().all(|f| !f.is_last));
    }

    #[test]
    fn test_zero_chunk_size_is_clamped() {
        let frames: Vec<_> = encode(vec![1u8, 2, 3], 0).collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[2].is_last);
    }

    #[test]
    fn test_encoder_is_not_restartable() {
        let mut encoder = encode(vec![9u8; 3], 2);
        assert_eq!(encoder.by_ref().count(), 2);
        assert!(encoder.next().is_none());
    }

    #[tokio::test]
    async fn test_round_trip_various_sizes() {
        for len in [0usize, 1, 2, 63, 64, 65, 10_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            for chunk_size in [1, 3, 64, 1 << 20] {
                let frames: Vec<_> = encode(payload.clone(), chunk_size).collect();
                let decoded = decode(ok_stream(frames)).await.unwrap();
                assert_eq!(decoded.as_ref(), payload.as_slice());
            }
        }
    }

    #[tokio::test]
    async fn test_decode_stops_at_final_frame() {
        let mut frames: Vec<_> = encode(b"hello".to_vec(), 2).collect();
        frames.push(TensorChunk {
            chunk_data: Bytes::from_static(b"trailing"),
            is_last: false,
        });
        let decoded = decode(ok_stream(frames)).await.unwrap();
        assert_eq!(decoded.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_decode_accepts_uneven_frames() {
        let frames = vec![
            TensorChunk {
                chunk_data: Bytes::from_static(b"a"),
                is_last: false,
            },
            TensorChunk {
                chunk_data: Bytes::from_static(b"bcdef"),
                is_last: false,
            },
            TensorChunk {
                chunk_data: Bytes::from_static(b"gh"),
                is_last: true,
            },
        ];
        let decoded = decode(ok_stream(frames)).await.unwrap();
        assert_eq!(decoded.as_ref(), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let mut frames: Vec<_> = encode(vec![5u8; 10], 4).collect();
        frames.pop();
        let err = decode(ok_stream(frames)).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TruncatedStream { frames: 2, bytes: 8 }
        ));

        let err = decode(ok_stream(Vec::new())).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TruncatedStream { frames: 0, bytes: 0 }
        ));
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream() {
        let items = vec![
            Ok(TensorChunk {
                chunk_data: Bytes::from_static(b"abc"),
                is_last: false,
            }),
            Err(tonic::Status::unavailable("connection reset")),
        ];
        let err = decode(futures::stream::iter(items)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Transport(_)));
    }
}
