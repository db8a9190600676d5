//! HTTP handlers

use super::body::{plan_segments, segmented_body, Segment};
use super::AppState;
use crate::error::{Error, Result};
use crate::metadata::{ChunkRecord, OffsetUnit, SourceFile, SourceFilter};
use crate::range::{parse_range, unsatisfied_content_range, ByteRange};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{self, HeaderMap};
use axum::http::{HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

type Params = Query<HashMap<String, String>>;

fn required<'a>(params: &'a HashMap<String, String>, name: &'static str) -> Result<&'a str> {
    params
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or(Error::MissingParameter(name))
}

/// Requested range, or `None` when the header is absent
fn requested_range(headers: &HeaderMap, total: u64) -> Result<Option<ByteRange>> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| Error::MalformedRange("header is not ASCII".to_string()))?;
    parse_range(value, total).map(Some)
}

/// 416 carrying the resource size, so clients can retry within bounds
fn range_not_satisfiable(err: Error, total: u64) -> Response<Body> {
    let mut response = err.into_response();
    if let Ok(value) = HeaderValue::from_str(&unsatisfied_content_range(total)) {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}

fn media_response(
    state: &AppState,
    status: StatusCode,
    range: ByteRange,
    total: u64,
    body: Body,
) -> Result<Response<Body>> {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, state.config.content_type.as_str())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, range.len());
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(header::CONTENT_RANGE, range.content_range(total));
    }
    builder
        .body(body)
        .map_err(|e| Error::Internal(format!("failed to build response: {}", e)))
}

/// GET /stream?id=<source id>
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Query(params): Params,
    headers: HeaderMap,
) -> Result<Response<Body>> {
    let id = required(&params, "id")?;
    let index = state.cache.chunk_index(&state.store, id).await?;
    if index.unit() != OffsetUnit::Bytes {
        return Err(Error::RangeNotSatisfiable(format!(
            "source {} is indexed by time, not bytes",
            id
        )));
    }

    let total = index.total();
    let requested = match requested_range(&headers, total) {
        Err(e @ Error::RangeNotSatisfiable(_)) => return Ok(range_not_satisfiable(e, total)),
        other => other?,
    };
    let (status, range) = match requested {
        Some(range) => (StatusCode::PARTIAL_CONTENT, range),
        None if state.config.full_body_without_range => {
            let range = ByteRange::full(total)
                .ok_or_else(|| Error::RangeNotSatisfiable(format!("source {} is empty", id)))?;
            (StatusCode::OK, range)
        }
        None => return Err(Error::MissingParameter("Range header")),
    };

    let segments = plan_segments(&index, range)?;
    debug!(
        "Streaming {} bytes {}-{} from {} chunks",
        id,
        range.start,
        range.end,
        segments.len()
    );

    let body = segmented_body(state.chunks.clone(), segments).await?;
    media_response(&state, status, range, total, body)
}

/// GET /chunk?id=<chunk id>
///
/// Serves one chunk file as stored; chunk files decode on their own.
pub async fn chunk(
    State(state): State<Arc<AppState>>,
    Query(params): Params,
    headers: HeaderMap,
) -> Result<Response<Body>> {
    let id = required(&params, "id")?;
    let chunk = state
        .store
        .get_chunk(id)?
        .ok_or_else(|| Error::NotFound(format!("chunk {}", id)))?;
    // Chunks of a source still being partitioned are not served
    state
        .cache
        .processed_source(&state.store, &chunk.source_id)
        .await?;

    let requested = match requested_range(&headers, chunk.size) {
        Err(e @ Error::RangeNotSatisfiable(_)) => {
            return Ok(range_not_satisfiable(e, chunk.size))
        }
        other => other?,
    };
    let range = match requested {
        Some(range) => range,
        None => ByteRange::full(chunk.size)
            .ok_or_else(|| Error::RangeNotSatisfiable(format!("chunk {} is empty", id)))?,
    };

    let segment = Segment {
        path: chunk.storage_path.clone(),
        offset: range.start,
        len: range.len(),
    };
    let body = segmented_body(state.chunks.clone(), vec![segment]).await?;
    media_response(&state, StatusCode::PARTIAL_CONTENT, range, chunk.size, body)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSummary {
    pub id: String,
    pub order: u32,
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

impl From<&ChunkRecord> for ChunkSummary {
    fn from(chunk: &ChunkRecord) -> Self {
        ChunkSummary {
            id: chunk.id.clone(),
            order: chunk.order,
            start: chunk.start,
            end: chunk.end,
            size: chunk.size,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMap {
    pub id: String,
    pub name: String,
    /// Extent in `unit`: bytes, or milliseconds for time-indexed sources
    pub file_size: u64,
    pub unit: String,
    pub chunks: Vec<ChunkSummary>,
}

/// GET /chunks?id=<source id>
pub async fn chunks(
    State(state): State<Arc<AppState>>,
    Query(params): Params,
) -> Result<Json<ChunkMap>> {
    let id = required(&params, "id")?;
    let source = state.cache.processed_source(&state.store, id).await?;
    let index = state.cache.chunk_index(&state.store, id).await?;

    Ok(Json(ChunkMap {
        id: source.id.clone(),
        name: source.name.clone(),
        file_size: source.extent.unwrap_or_else(|| index.total()),
        unit: index.unit().to_string(),
        chunks: index.chunks().iter().map(ChunkSummary::from).collect(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Located {
    pub source_id: String,
    pub unit: String,
    pub at: u64,
    /// Position of `at` relative to the chunk start
    pub offset_in_chunk: u64,
    pub chunk: ChunkSummary,
}

/// GET /locate?id=<source id>&at=<offset>
pub async fn locate(
    State(state): State<Arc<AppState>>,
    Query(params): Params,
) -> Result<Json<Located>> {
    let id = required(&params, "id")?;
    let at_raw = required(&params, "at")?;
    let at: u64 = at_raw
        .parse()
        .map_err(|_| Error::InvalidParameter(format!("at={}", at_raw)))?;

    let index = state.cache.chunk_index(&state.store, id).await?;
    let chunk = index.lookup(at).ok_or_else(|| {
        Error::RangeNotSatisfiable(format!(
            "{} {} is outside source {} (0-{})",
            index.unit(),
            at,
            id,
            index.total()
        ))
    })?;

    Ok(Json(Located {
        source_id: id.to_string(),
        unit: index.unit().to_string(),
        at,
        offset_in_chunk: at - chunk.start,
        chunk: ChunkSummary::from(chunk),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub state: &'static str,
    pub unit: Option<String>,
    pub extent: Option<u64>,
    pub metadata: serde_json::Value,
    pub created: DateTime<Utc>,
}

impl From<SourceFile> for SourceSummary {
    fn from(source: SourceFile) -> Self {
        SourceSummary {
            state: source.state_label(),
            id: source.id,
            name: source.name,
            size: source.size,
            unit: source.offset_unit.map(|u| u.to_string()),
            extent: source.extent,
            metadata: source.metadata,
            created: source.created,
        }
    }
}

/// GET /sources
pub async fn sources(State(state): State<Arc<AppState>>) -> Result<Json<Vec<SourceSummary>>> {
    let found = state.store.find_sources(&SourceFilter::Processed, 0)?;
    Ok(Json(found.into_iter().map(SourceSummary::from).collect()))
}

/// Stream a request body into a new file at `path`, at most `limit` bytes
async fn receive_file(body: Body, path: &Path, limit: u64) -> Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;

    let mut stream = body.into_data_stream();
    let mut written = 0u64;
    while let Some(data) = stream.next().await {
        let data = data.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        written += data.len() as u64;
        if written > limit {
            return Err(Error::UploadTooLarge(limit));
        }
        file.write_all(&data).await?;
    }

    file.sync_all().await?;
    Ok(written)
}

/// POST /file?name=<file name>
///
/// The request body is the audio file itself. It is stored in the upload
/// directory and registered as an unprocessed source for the partition job.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Query(params): Params,
    body: Body,
) -> Result<(StatusCode, Json<SourceSummary>)> {
    let name = required(&params, "name")?;
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string());

    let mut source = SourceFile::new(Default::default(), name, 0);
    source.path = state.uploads.join(format!("{}.{}", source.id, ext));

    let received = match receive_file(body, &source.path, state.config.max_upload_bytes).await {
        Ok(0) => Err(Error::InvalidParameter("empty upload".to_string())),
        other => other,
    };
    source.size = match received {
        Ok(size) => size,
        Err(e) => {
            let _ = tokio::fs::remove_file(&source.path).await;
            return Err(e);
        }
    };

    if let Err(e) = state.store.create_source(&source) {
        let _ = tokio::fs::remove_file(&source.path).await;
        return Err(e);
    }
    info!("Received {} as {} ({} bytes)", source.name, source.id, source.size);
    Ok((StatusCode::CREATED, Json(SourceSummary::from(source))))
}

/// GET /health
pub async fn health() -> &'static str {
    "ok"
}
