//! FLAC frame-aligned chunking
//!
//! Every chunk file is the stream header (`fLaC` marker plus all metadata
//! blocks) followed by a run of whole frames, so each chunk decodes on its
//! own. Offsets are byte offsets into the original file:
//! - chunk 1 is a verbatim prefix of the original (header, any bytes before
//!   the first frame, its frames), so its `payload_offset` is 0
//! - later chunks cover `[frame start, next chunk start - 1]` and carry a
//!   replicated header, so their `payload_offset` is the header length

use super::fixed::copy_span;
use super::{chunk_extension, Partitioned, Partitioner};
use crate::error::{Error, Result};
use crate::metadata::{ChunkDraft, OffsetUnit, SourceFile};
use crate::storage::AttemptDir;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use tracing::debug;

const STREAM_MARKER: &[u8; 4] = b"fLaC";

/// Metadata block header flag marking the final block
const LAST_BLOCK_FLAG: u8 = 0x80;

/// 14-bit frame sync code
const FRAME_SYNC: u16 = 0x3FFE;

const SCAN_BUFFER: usize = 64 * 1024;

fn read_or_invalid<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::InvalidFormat(format!("unexpected end of file while reading {}", what))
        } else {
            Error::Io(e)
        }
    })
}

/// Read the stream header: the marker and every metadata block up to and
/// including the one flagged last. Returns the raw header bytes.
pub fn read_stream_header<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut marker = [0u8; 4];
    read_or_invalid(reader, &mut marker, "stream marker")?;
    if &marker != STREAM_MARKER {
        return Err(Error::InvalidFormat("not a FLAC stream".to_string()));
    }

    let mut header = marker.to_vec();
    loop {
        let mut block_header = [0u8; 4];
        read_or_invalid(reader, &mut block_header, "metadata block header")?;
        let is_last = block_header[0] & LAST_BLOCK_FLAG != 0;
        let length = u32::from_be_bytes([0, block_header[1], block_header[2], block_header[3]]);

        let mut block = vec![0u8; length as usize];
        read_or_invalid(reader, &mut block, "metadata block")?;

        header.extend_from_slice(&block_header);
        header.extend_from_slice(&block);

        if is_last {
            return Ok(header);
        }
    }
}

/// Incremental frame sync scanner.
///
/// Tests each byte pair for the sync code; after a hit the second byte of
/// the pair is not considered as the start of another pair.
#[derive(Debug, Default)]
struct SyncScanner {
    pending: Option<u8>,
    next: u64,
}

impl SyncScanner {
    fn feed(&mut self, block: &[u8], hits: &mut Vec<u64>) {
        for &byte in block {
            let at = self.next;
            self.next += 1;
            if let Some(prev) = self.pending.take() {
                let word = u16::from_be_bytes([prev, byte]);
                if word >> 2 == FRAME_SYNC {
                    hits.push(at - 1);
                    continue;
                }
            }
            self.pending = Some(byte);
        }
    }
}

/// Positions of frame sync codes in `data`
pub fn find_frame_starts(data: &[u8]) -> Vec<u64> {
    let mut hits = Vec::new();
    SyncScanner::default().feed(data, &mut hits);
    hits
}

/// Group frames into half-open payload spans of at least `target` bytes.
///
/// The final group always runs to the end of the payload.
fn plan_spans(frames: &[u64], payload_len: u64, target: u64) -> Vec<(u64, u64)> {
    let mut spans = Vec::new();
    let mut current = 0usize;

    while current < frames.len() {
        let first = current;
        let mut accumulated = 0u64;

        while accumulated < target && current + 1 < frames.len() {
            accumulated += frames[current + 1] - frames[current];
            current += 1;
        }
        if current + 1 == frames.len() {
            current += 1;
        }

        let end = frames.get(current).copied().unwrap_or(payload_len);
        spans.push((frames[first], end));
    }
    spans
}

/// Splits FLAC files on frame boundaries
pub struct FrameAlignedPartitioner {
    target_size: u64,
}

impl FrameAlignedPartitioner {
    pub fn new(target_size: u64) -> Self {
        FrameAlignedPartitioner { target_size }
    }

    /// Frame starts in payload coordinates (relative to the end of the header)
    fn scan_frames(file: &mut File, header_len: u64) -> Result<Vec<u64>> {
        file.seek(SeekFrom::Start(header_len))?;
        let mut scanner = SyncScanner::default();
        let mut hits = Vec::new();
        let mut buffer = vec![0u8; SCAN_BUFFER];

        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            scanner.feed(&buffer[..n], &mut hits);
        }
        Ok(hits)
    }
}

impl Partitioner for FrameAlignedPartitioner {
    fn partition(&self, source: &SourceFile, out: &AttemptDir) -> Result<Partitioned> {
        if self.target_size == 0 {
            return Err(Error::InvalidConfig("target size must be non-zero".to_string()));
        }

        let mut file = File::open(&source.path)?;
        let size = file.metadata()?.len();
        let header = read_stream_header(&mut BufReader::new(&mut file))?;
        let header_len = header.len() as u64;

        let frames = Self::scan_frames(&mut file, header_len)?;
        if frames.is_empty() {
            return Err(Error::InvalidFormat(format!(
                "no FLAC frames found in {}",
                source.name
            )));
        }

        let spans = plan_spans(&frames, size - header_len, self.target_size);
        let ext = chunk_extension(source);
        let mut chunks = Vec::with_capacity(spans.len());

        for (i, (first, last)) in spans.into_iter().enumerate() {
            let order = i as u32 + 1;
            let end = header_len + last - 1;
            let mut writer = out.create_chunk(order, &ext)?;

            let (start, payload_offset) = if i == 0 {
                copy_span(&file, 0, end, &mut writer)?;
                (0, 0)
            } else {
                let start = header_len + first;
                writer.write(&header)?;
                copy_span(&file, start, end, &mut writer)?;
                (start, header_len)
            };
            let written = writer.finish()?;

            chunks.push(ChunkDraft {
                storage_path: written.path,
                start,
                end,
                size: written.size,
                payload_offset,
                content_hash: written.content_hash,
            });
        }

        debug!(
            "Split {} into {} frame-aligned chunks ({} frames, header {} bytes)",
            source.name,
            chunks.len(),
            frames.len(),
            header_len
        );

        Ok(Partitioned {
            chunks,
            unit: OffsetUnit::Bytes,
            extent: size,
        })
    }

    fn name(&self) -> &'static str {
        "flac"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChunkStore;
    use std::io::Cursor;

    fn stream_header() -> Vec<u8> {
        let mut data = b"fLaC".to_vec();
        // STREAMINFO, not last
        data.extend_from_slice(&[0x00, 0x00, 0x00, 34]);
        data.extend_from_slice(&[0u8; 34]);
        // VORBIS_COMMENT, last
        data.extend_from_slice(&[0x84, 0x00, 0x00, 4]);
        data.extend_from_slice(&[1, 2, 3, 4]);
        data
    }

    fn frame(len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        frame[0] = 0xFF;
        frame[1] = 0xF8;
        frame
    }

    fn flac_file(leading: usize, frames: usize, frame_len: usize) -> Vec<u8> {
        let mut data = stream_header();
        data.extend(std::iter::repeat(0u8).take(leading));
        for _ in 0..frames {
            data.extend(frame(frame_len));
        }
        data
    }

    #[test]
    fn test_read_stream_header() {
        let data = flac_file(0, 2, 10);
        let header = read_stream_header(&mut Cursor::new(&data)).unwrap();
        assert_eq!(header, stream_header());
        assert_eq!(header.len(), 4 + 4 + 34 + 4 + 4);
    }

    #[test]
    fn test_truncated_block_is_invalid() {
        let mut data = b"fLaC".to_vec();
        data.extend_from_slice(&[0x80, 0x00, 0x00, 34]);
        data.extend_from_slice(&[0u8; 10]);

        let result = read_stream_header(&mut Cursor::new(&data));
        assert!(matches!(result, Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn test_bad_marker_is_invalid() {
        let result = read_stream_header(&mut Cursor::new(b"OggS\0\0\0\0".to_vec()));
        assert!(matches!(result, Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn test_sync_scanner() {
        assert_eq!(find_frame_starts(&[0xFF, 0xF8, 0xFF, 0xF9, 0x00]), vec![0, 2]);
        assert_eq!(find_frame_starts(&[0xFF, 0xFF, 0xF8, 0x00]), vec![1]);
        assert!(find_frame_starts(&[0x00, 0xFF, 0x00]).is_empty());
        assert!(find_frame_starts(&[]).is_empty());
    }

    #[test]
    fn test_scanner_across_blocks() {
        let data = flac_file(3, 20, 37);
        let whole = find_frame_starts(&data);

        let mut scanner = SyncScanner::default();
        let mut hits = Vec::new();
        for piece in data.chunks(5) {
            scanner.feed(piece, &mut hits);
        }
        assert_eq!(hits, whole);
    }

    #[test]
    fn test_plan_spans() {
        let frames: Vec<u64> = (0..10).map(|i| i * 100).collect();
        assert_eq!(
            plan_spans(&frames, 1000, 250),
            vec![(0, 300), (300, 600), (600, 900), (900, 1000)]
        );
        assert_eq!(plan_spans(&frames, 1000, 10_000), vec![(0, 1000)]);
        assert_eq!(plan_spans(&[0], 50, 10), vec![(0, 50)]);
    }

    #[test]
    fn test_partition_frame_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let data = flac_file(5, 10, 100);
        let path = dir.path().join("song.flac");
        std::fs::write(&path, &data).unwrap();

        let source = SourceFile::new(path, "song", data.len() as u64);
        let out = ChunkStore::new(dir.path().join("chunks")).attempt(&source.id, "w");
        let result = FrameAlignedPartitioner::new(250)
            .partition(&source, &out)
            .unwrap();

        let header = stream_header();
        let header_len = header.len() as u64;
        assert_eq!(result.extent, data.len() as u64);
        assert_eq!(result.chunks.len(), 4);

        // Gapless over the whole original
        assert_eq!(result.chunks[0].start, 0);
        assert_eq!(result.chunks.last().unwrap().end, data.len() as u64 - 1);
        for pair in result.chunks.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }

        for (i, chunk) in result.chunks.iter().enumerate() {
            let bytes = std::fs::read(&chunk.storage_path).unwrap();
            assert!(bytes.starts_with(&header));
            assert_eq!(bytes.len() as u64, chunk.size);

            let payload = &bytes[chunk.payload_offset as usize..];
            let original = &data[chunk.start as usize..=chunk.end as usize];
            assert_eq!(payload, original);

            if i > 0 {
                assert_eq!(chunk.payload_offset, header_len);
                assert_eq!(&bytes[header.len()..header.len() + 2], &[0xFF, 0xF8]);
            }
        }
    }

    #[test]
    fn test_no_frames_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = stream_header();
        data.extend_from_slice(&[0u8; 64]);
        let path = dir.path().join("silent.flac");
        std::fs::write(&path, &data).unwrap();

        let source = SourceFile::new(path, "silent", data.len() as u64);
        let out = ChunkStore::new(dir.path().join("chunks")).attempt(&source.id, "w");
        let result = FrameAlignedPartitioner::new(10).partition(&source, &out);
        assert!(matches!(result, Err(Error::InvalidFormat(_))));
    }
}
