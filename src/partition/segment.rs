//! Time-segment chunking through ffmpeg
//!
//! The source duration comes from ffprobe, then ffmpeg cuts the file into
//! segments of `segment_secs` without re-encoding. Chunk offsets are
//! milliseconds of audio, so these sources can be located by time but not
//! served by byte range.

use super::{chunk_extension, Partitioned, Partitioner};
use crate::error::{Error, Result};
use crate::metadata::{ChunkDraft, OffsetUnit, SourceFile};
use crate::storage::AttemptDir;
use serde::Deserialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

const SEGMENT_PREFIX: &str = "segment_";

#[derive(Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: String,
}

/// Duration in seconds from `ffprobe -show_entries format=duration -of json`
fn parse_probe_output(output: &[u8]) -> Result<f64> {
    let probe: ProbeOutput = serde_json::from_slice(output)
        .map_err(|e| Error::Segmenter(format!("unreadable ffprobe output: {}", e)))?;
    let duration: f64 = probe
        .format
        .duration
        .trim()
        .parse()
        .map_err(|_| Error::Segmenter(format!("bad duration {:?}", probe.format.duration)))?;

    if !duration.is_finite() || duration < 0.0 {
        return Err(Error::Segmenter(format!("bad duration {}", duration)));
    }
    Ok(duration)
}

/// Inclusive millisecond spans of `duration_ms` cut every `segment_ms`
pub fn segment_spans(duration_ms: u64, segment_ms: u64) -> Vec<(u64, u64)> {
    if segment_ms == 0 {
        return Vec::new();
    }
    (0..duration_ms.div_ceil(segment_ms))
        .map(|i| {
            let start = i * segment_ms;
            let end = ((i + 1) * segment_ms).min(duration_ms) - 1;
            (start, end)
        })
        .collect()
}

/// Spans for the `produced` segments the segmenter actually wrote.
///
/// Stream copy can only cut where a packet starts, so the segment count may
/// be one off from `segment_spans`. A short count stretches the last span to
/// the end; an extra tail segment gets a one-millisecond span past it.
fn produced_spans(duration_ms: u64, segment_ms: u64, produced: usize) -> Result<Vec<(u64, u64)>> {
    let mut spans = segment_spans(duration_ms, segment_ms);
    if produced == 0 || produced.abs_diff(spans.len()) > 1 {
        return Err(Error::Segmenter(format!(
            "produced {} segments for {} ms, expected {}",
            produced,
            duration_ms,
            spans.len()
        )));
    }

    match produced.cmp(&spans.len()) {
        Ordering::Less => {
            spans.truncate(produced);
            if let Some(last) = spans.last_mut() {
                last.1 = duration_ms - 1;
            }
        }
        Ordering::Greater => spans.push((duration_ms, duration_ms)),
        Ordering::Equal => {}
    }
    Ok(spans)
}

fn run_tool(command: &mut Command, tool: &Path) -> Result<Vec<u8>> {
    let output = command.output().map_err(|e| {
        Error::Segmenter(format!("failed to run {}: {}", tool.display(), e))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Segmenter(format!(
            "{} exited with {}: {}",
            tool.display(),
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

/// Splits audio into fixed-duration segments
pub struct TimeSegmentPartitioner {
    segment_secs: f64,
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
}

impl TimeSegmentPartitioner {
    pub fn new(segment_secs: f64, ffmpeg_bin: PathBuf, ffprobe_bin: PathBuf) -> Self {
        TimeSegmentPartitioner {
            segment_secs,
            ffmpeg_bin,
            ffprobe_bin,
        }
    }

    /// Source duration in milliseconds
    pub fn probe_duration_ms(&self, path: &Path) -> Result<u64> {
        let stdout = run_tool(
            Command::new(&self.ffprobe_bin)
                .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
                .arg(path),
            &self.ffprobe_bin,
        )?;
        let secs = parse_probe_output(&stdout)?;
        Ok((secs * 1000.0).round() as u64)
    }

    /// Cut `path` into `work_dir`, returning produced segments in order
    fn cut(&self, path: &Path, work_dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
        let pattern = work_dir.join(format!("{}%05d.{}", SEGMENT_PREFIX, ext));
        run_tool(
            Command::new(&self.ffmpeg_bin)
                .args(["-v", "error", "-y", "-i"])
                .arg(path)
                .args(["-c", "copy", "-f", "segment", "-segment_time"])
                .arg(format!("{:.2}", self.segment_secs))
                .args(["-reset_timestamps", "1"])
                .arg(&pattern),
            &self.ffmpeg_bin,
        )?;

        let mut produced = Vec::new();
        for entry in std::fs::read_dir(work_dir)? {
            let entry = entry?;
            let is_segment = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(SEGMENT_PREFIX))
                .unwrap_or(false);
            if is_segment {
                produced.push(entry.path());
            }
        }
        // Zero-padded sequence numbers sort lexically
        produced.sort();
        Ok(produced)
    }
}

impl Partitioner for TimeSegmentPartitioner {
    fn partition(&self, source: &SourceFile, out: &AttemptDir) -> Result<Partitioned> {
        let segment_ms = (self.segment_secs * 1000.0).round() as u64;
        if segment_ms == 0 {
            return Err(Error::InvalidConfig("segment length must be positive".to_string()));
        }
        if !source.path.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("source file {:?} is missing", source.path),
            )));
        }

        let duration_ms = self.probe_duration_ms(&source.path)?;
        if duration_ms == 0 {
            return Err(Error::InvalidFormat(format!("{} has no audio", source.name)));
        }

        let work_dir = out.scratch_dir();
        let _ = std::fs::remove_dir_all(&work_dir);
        std::fs::create_dir_all(&work_dir)?;

        let ext = chunk_extension(source);
        let result = self.cut(&source.path, &work_dir, &ext).and_then(|produced| {
            let spans = produced_spans(duration_ms, segment_ms, produced.len())?;
            let mut chunks = Vec::with_capacity(spans.len());
            for (i, (segment, (start, end))) in produced.iter().zip(spans).enumerate() {
                let written = out.adopt_chunk(i as u32 + 1, &ext, segment)?;
                chunks.push(ChunkDraft {
                    storage_path: written.path,
                    start,
                    end,
                    size: written.size,
                    payload_offset: 0,
                    content_hash: written.content_hash,
                });
            }
            Ok(chunks)
        });

        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            warn!("Failed to remove segment work dir {:?}: {}", work_dir, e);
        }
        let chunks = result?;
        // Equals the duration unless the segmenter wrote an extra tail
        let extent = chunks.last().map_or(duration_ms, |c| c.end + 1);

        debug!(
            "Cut {} ({} ms) into {} segments of {} ms",
            source.name,
            duration_ms,
            chunks.len(),
            segment_ms
        );

        Ok(Partitioned {
            chunks,
            unit: OffsetUnit::Millis,
            extent,
        })
    }

    fn name(&self) -> &'static str {
        "segments"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChunkStore;

    #[test]
    fn test_segment_spans() {
        assert_eq!(
            segment_spans(25_000, 10_000),
            vec![(0, 9_999), (10_000, 19_999), (20_000, 24_999)]
        );
        assert_eq!(segment_spans(10_000, 10_000), vec![(0, 9_999)]);
        assert_eq!(segment_spans(1, 10_000), vec![(0, 0)]);
        assert!(segment_spans(0, 10_000).is_empty());
    }

    #[test]
    fn test_spans_gapless() {
        for (duration, segment) in [(12_345u64, 1_000u64), (999, 1_000), (60_000, 7_000)] {
            let spans = segment_spans(duration, segment);
            assert_eq!(spans[0].0, 0);
            assert_eq!(spans.last().unwrap().1, duration - 1);
            for pair in spans.windows(2) {
                assert_eq!(pair[0].1 + 1, pair[1].0);
            }
        }
    }

    #[test]
    fn test_parse_probe_output() {
        let output = br#"{"format": {"duration": "183.426667"}}"#;
        assert!((parse_probe_output(output).unwrap() - 183.426667).abs() < 1e-9);

        assert!(parse_probe_output(br#"{"format": {}}"#).is_err());
        assert!(parse_probe_output(br#"{"format": {"duration": "N/A"}}"#).is_err());
        assert!(parse_probe_output(b"not json").is_err());
    }

    #[test]
    fn test_missing_tool_is_segmenter_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.flac");
        std::fs::write(&path, b"fLaC").unwrap();

        let partitioner = TimeSegmentPartitioner::new(
            10.0,
            dir.path().join("no-ffmpeg"),
            dir.path().join("no-ffprobe"),
        );
        let source = SourceFile::new(path, "song", 4);
        let out = ChunkStore::new(dir.path().join("chunks")).attempt(&source.id, "w");

        let result = partitioner.partition(&source, &out);
        assert!(matches!(result, Err(Error::Segmenter(_))));
    }

    #[test]
    fn test_produced_spans_tolerate_one_off() {
        assert_eq!(
            produced_spans(20_050, 10_000, 3).unwrap(),
            vec![(0, 9_999), (10_000, 19_999), (20_000, 20_049)]
        );
        // Tail shorter than one packet folded into the previous segment
        assert_eq!(
            produced_spans(20_050, 10_000, 2).unwrap(),
            vec![(0, 9_999), (10_000, 20_049)]
        );
        assert_eq!(
            produced_spans(20_000, 10_000, 3).unwrap(),
            vec![(0, 9_999), (10_000, 19_999), (20_000, 20_000)]
        );

        assert!(matches!(produced_spans(20_050, 10_000, 1), Err(Error::Segmenter(_))));
        assert!(matches!(produced_spans(20_050, 10_000, 5), Err(Error::Segmenter(_))));
        assert!(matches!(produced_spans(500, 10_000, 0), Err(Error::Segmenter(_))));
    }

    /// ffprobe/ffmpeg stand-ins reporting `duration` and writing `segments` files
    #[cfg(unix)]
    fn stub_tools(dir: &Path, duration: &str, segments: usize) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let ffprobe = dir.join("ffprobe");
        std::fs::write(
            &ffprobe,
            format!(
                "#!/bin/sh\necho '{{\"format\": {{\"duration\": \"{}\"}}}}'\n",
                duration
            ),
        )
        .unwrap();

        // The output pattern is the last argument
        let ffmpeg = dir.join("ffmpeg");
        std::fs::write(
            &ffmpeg,
            format!(
                "#!/bin/sh\nfor last; do :; done\nout=$(dirname \"$last\")\n\
                 i=0\nwhile [ $i -lt {} ]; do\n\
                 printf 'segment %s' $i > \"$out/segment_0000$i.flac\"\n\
                 i=$((i + 1))\ndone\n",
                segments
            ),
        )
        .unwrap();

        for tool in [&ffprobe, &ffmpeg] {
            std::fs::set_permissions(tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        (ffmpeg, ffprobe)
    }

    #[cfg(unix)]
    #[test]
    fn test_short_segment_count_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.flac");
        std::fs::write(&path, b"fLaC").unwrap();
        let (ffmpeg, ffprobe) = stub_tools(dir.path(), "20.050000", 2);

        let source = SourceFile::new(path, "song", 4);
        let out = ChunkStore::new(dir.path().join("chunks")).attempt(&source.id, "w");
        let result = TimeSegmentPartitioner::new(10.0, ffmpeg, ffprobe)
            .partition(&source, &out)
            .unwrap();

        assert_eq!(result.unit, OffsetUnit::Millis);
        assert_eq!(result.extent, 20_050);
        let spans: Vec<_> = result.chunks.iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(spans, vec![(0, 9_999), (10_000, 20_049)]);

        assert_eq!(result.chunks[1].storage_path, out.chunk_path(2, "flac"));
        assert_eq!(std::fs::read(&result.chunks[1].storage_path).unwrap(), b"segment 1");
        assert!(!out.scratch_dir().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_wildly_wrong_segment_count_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.flac");
        std::fs::write(&path, b"fLaC").unwrap();
        let (ffmpeg, ffprobe) = stub_tools(dir.path(), "60.0", 2);

        let source = SourceFile::new(path, "song", 4);
        let out = ChunkStore::new(dir.path().join("chunks")).attempt(&source.id, "w");
        let result = TimeSegmentPartitioner::new(10.0, ffmpeg, ffprobe).partition(&source, &out);
        assert!(matches!(result, Err(Error::Segmenter(_))));
    }
}
