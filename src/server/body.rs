//! Response bodies stitched from chunk file slices

use crate::error::Result;
use crate::index::ChunkIndex;
use crate::range::ByteRange;
use crate::storage::ChunkStore;
use axum::body::Body;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;

/// A slice of one chunk file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    /// Offset inside the chunk file
    pub offset: u64,
    pub len: u64,
}

/// Slices of chunk files that together hold `range` of the source
pub fn plan_segments(index: &ChunkIndex, range: ByteRange) -> Result<Vec<Segment>> {
    let run = index.span(range.start, range.end)?;
    Ok(run
        .iter()
        .map(|chunk| {
            let start = range.start.max(chunk.start);
            let end = range.end.min(chunk.end);
            Segment {
                path: chunk.storage_path.clone(),
                offset: chunk.file_offset(start),
                len: end - start + 1,
            }
        })
        .collect())
}

/// Stream `segments` back to back.
///
/// The first segment is opened before returning so a missing or short file
/// fails the request while a status can still be chosen; later segments are
/// opened as the body is consumed and a failure there ends the body early.
pub async fn segmented_body(store: ChunkStore, segments: Vec<Segment>) -> Result<Body> {
    let mut segments = segments.into_iter();
    let Some(first) = segments.next() else {
        return Ok(Body::empty());
    };

    let head = store.open_range(&first.path, first.offset, first.len).await?;
    let head = tokio_util::io::ReaderStream::new(head);

    let rest = stream::iter(segments)
        .then(move |segment| {
            let store = store.clone();
            async move {
                store
                    .open_range(&segment.path, segment.offset, segment.len)
                    .await
            }
        })
        .flat_map(|opened| match opened {
            Ok(reader) => tokio_util::io::ReaderStream::new(reader).left_stream(),
            Err(e) => {
                tracing::error!("Aborting stream: {}", e);
                let err = std::io::Error::other(e.to_string());
                stream::once(async move { Err::<Bytes, _>(err) }).right_stream()
            }
        });

    Ok(Body::from_stream(head.chain(rest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ChunkDraft, OffsetUnit};
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_segments_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let data: Vec<u8> = (0..30u8).collect();
        let out = store.attempt("src", "w");

        let mut records = Vec::new();
        for (i, piece) in data.chunks(10).enumerate() {
            let order = i as u32 + 1;
            let mut writer = out.create_chunk(order, "bin").unwrap();
            // Every chunk after the first carries a 3-byte prefix
            let prefix: &[u8] = if i == 0 { b"" } else { b"HDR" };
            writer.write(prefix).unwrap();
            writer.write(piece).unwrap();
            let written = writer.finish().unwrap();

            let start = i as u64 * 10;
            records.push(
                ChunkDraft {
                    storage_path: written.path,
                    start,
                    end: start + 9,
                    size: written.size,
                    payload_offset: prefix.len() as u64,
                    content_hash: written.content_hash,
                }
                .into_record("src", order, OffsetUnit::Bytes),
            );
        }
        let index = ChunkIndex::build(records).unwrap();

        let segments = plan_segments(&index, ByteRange::new(5, 24)).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!((segments[0].offset, segments[0].len), (5, 5));
        assert_eq!((segments[1].offset, segments[1].len), (3, 10));
        assert_eq!((segments[2].offset, segments[2].len), (3, 5));

        let body = segmented_body(store, segments).await.unwrap();
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], &data[5..=24]);
    }

    #[tokio::test]
    async fn test_missing_first_segment_fails_early() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let segments = vec![Segment {
            path: dir.path().join("gone.bin"),
            offset: 0,
            len: 4,
        }];
        assert!(segmented_body(store, segments).await.is_err());
    }
}
