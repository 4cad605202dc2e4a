//! Media gateway: the converter API the thin gateway forwards to
//!
//! Searches and downloads go through the extractor, audio is re-encoded by
//! the transcoder and finished files are served from the media root.

pub mod error;
pub mod extractor;
pub mod jobs;
pub mod store;
pub mod transcoder;

use crate::body::{empty, json_response, stream, Body};
use crate::config::{MediaConfig, MAX_SEARCH_LIMIT};
use crate::error::{json_error_response, ErrorCode};
use crate::server::Handler;
use crate::tools::Tool;
use crate::VERSION;
use chrono::Utc;
use error::MediaError;
use extractor::{ConvertSource, Extractor, SearchResult};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use jobs::JobRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use store::{content_type_for, media_key, MediaInfo, MediaStore};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use transcoder::Transcoder;

/// Reply to a successful conversion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvertResponse {
    pub ok: bool,
    pub key: String,
    pub file: String,
    pub media_url: String,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub format: String,
    pub size: u64,
    pub cached: bool,
}

impl ConvertResponse {
    fn from_info(info: &MediaInfo, cached: bool) -> Self {
        Self {
            ok: true,
            key: info.key.clone(),
            file: info.file.clone(),
            media_url: format!("/media/{}", info.file),
            title: info.title.clone(),
            duration: info.duration,
            uploader: info.uploader.clone(),
            format: info.format.clone(),
            size: info.size,
            cached,
        }
    }
}

/// Body accepted by `POST /convert`
#[derive(Debug, Default, Deserialize)]
struct ConvertBody {
    url: Option<String>,
    q: Option<String>,
    query: Option<String>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    query: String,
    limit: usize,
    results: Vec<SearchResult>,
}

#[derive(Debug, Serialize)]
struct ToolStatus {
    path: String,
    version: Option<String>,
}

pub struct MediaGateway {
    store: MediaStore,
    extractor: Extractor,
    transcoder: Transcoder,
    jobs: JobRegistry,
    audio_format: String,
    search_limit: usize,
    extractor_version: Option<String>,
    transcoder_version: Option<String>,
    started: Instant,
}

impl MediaGateway {
    /// Check the startup contract and build the gateway
    ///
    /// Fails when the media root is not writable or either binary cannot be
    /// resolved.
    pub async fn open(config: &MediaConfig) -> anyhow::Result<Self> {
        let store = MediaStore::open(&config.root).map_err(|e| {
            anyhow::anyhow!("Media root {} is not usable: {}", config.root.display(), e)
        })?;

        let extractor_tool = Tool::resolve("extractor", &config.extractor)?;
        let transcoder_tool = Tool::resolve("transcoder", &config.transcoder)?;

        let extractor_version = extractor_tool.version("--version").await;
        let transcoder_version = transcoder_tool.version("-version").await;

        info!(
            root = %store.root().display(),
            extractor = %extractor_tool.path.display(),
            extractor_version = ?extractor_version,
            transcoder = %transcoder_tool.path.display(),
            transcoder_version = ?transcoder_version,
            "Media toolchain ready"
        );

        Ok(Self {
            store,
            extractor: Extractor::new(
                extractor_tool,
                config.extractor_args.clone(),
                config.job_timeout(),
            ),
            transcoder: Transcoder::new(
                transcoder_tool,
                config.audio_bitrate.clone(),
                config.job_timeout(),
            ),
            jobs: JobRegistry::new(config.max_concurrent_jobs, config.max_queued_jobs),
            audio_format: config.audio_format.clone(),
            search_limit: config.search_limit,
            extractor_version,
            transcoder_version,
            started: Instant::now(),
        })
    }

    pub fn store(&self) -> &MediaStore {
        &self.store
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// Search through the extractor, sharing the conversion slots
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, MediaError> {
        let permit = self.jobs.acquire_lookup().await?;
        let result = self.extractor.search(query, limit).await;
        permit.finish(result.is_ok());
        result
    }

    /// Convert `source`, reusing a finished file with the same key
    pub async fn convert(&self, source: &ConvertSource) -> Result<ConvertResponse, MediaError> {
        let target = source.target();
        let key = media_key(&target);
        let _key_lock = self.jobs.lock_key(&key).await;

        if let Some(size) = self.store.existing_size(&key, &self.audio_format).await {
            let info = match self.store.read_info(&key).await {
                Some(info) => info,
                None => MediaInfo {
                    key: key.clone(),
                    file: MediaStore::file_name(&key, &self.audio_format),
                    title: None,
                    source: target.clone(),
                    extractor_id: None,
                    duration: None,
                    uploader: None,
                    format: self.audio_format.clone(),
                    size,
                    created_at: Utc::now(),
                },
            };
            debug!(key, "Serving cached conversion");
            return Ok(ConvertResponse::from_info(&info, true));
        }

        let permit = self.jobs.acquire().await?;
        let started = Instant::now();
        let result = self.run_conversion(&key, &target).await;
        permit.finish(result.is_ok());

        match &result {
            Ok(info) => info!(
                key,
                title = ?info.title,
                size = info.size,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Conversion finished"
            ),
            Err(e) => warn!(key, target, error = %e, "Conversion failed"),
        }

        result.map(|info| ConvertResponse::from_info(&info, false))
    }

    async fn run_conversion(&self, key: &str, target: &str) -> Result<MediaInfo, MediaError> {
        let work = self.store.work_dir()?;
        let downloaded = self.extractor.download(target, work.path()).await?;

        let format = self.audio_format.as_str();
        let part = self.store.part_file(key, format);
        self.transcoder.transcode(&downloaded.path, part.path(), format).await?;

        let size = tokio::fs::metadata(part.path()).await?.len();
        let output = self.store.output_path(key, format);
        part.persist(&output).await?;

        let info = MediaInfo {
            key: key.to_string(),
            file: MediaStore::file_name(key, format),
            uploader: downloaded.uploader(),
            title: downloaded.info.title,
            source: target.to_string(),
            extractor_id: downloaded.info.id,
            duration: downloaded.info.duration,
            format: format.to_string(),
            size,
            created_at: Utc::now(),
        };
        self.store.write_info(&info).await?;

        Ok(info)
    }

    async fn status(&self) -> Response<Body> {
        let files = match self.store.list().await {
            Ok(files) => Some(files.len()),
            Err(e) => {
                warn!(error = %e, "Failed to list media root");
                None
            }
        };

        json_response(
            StatusCode::OK,
            &serde_json::json!({
                "service": "media-gateway",
                "version": VERSION,
                "uptime_secs": self.started.elapsed().as_secs(),
                "media_root": self.store.root().display().to_string(),
                "audio_format": self.audio_format,
                "extractor": ToolStatus {
                    path: self.extractor.tool().path.display().to_string(),
                    version: self.extractor_version.clone(),
                },
                "transcoder": ToolStatus {
                    path: self.transcoder.tool().path.display().to_string(),
                    version: self.transcoder_version.clone(),
                },
                "jobs": self.jobs.snapshot(),
                "files": files,
            }),
        )
    }

    async fn handle_search(&self, params: &HashMap<String, String>) -> Response<Body> {
        let query = params
            .get("q")
            .or_else(|| params.get("query"))
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());
        let Some(query) = query else {
            return json_error_response(ErrorCode::BadRequest, "missing 'q' parameter");
        };

        let limit = match params.get("limit") {
            None => self.search_limit,
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if (1..=MAX_SEARCH_LIMIT).contains(&n) => n,
                _ => {
                    return json_error_response(
                        ErrorCode::BadRequest,
                        format!("'limit' must be between 1 and {}", MAX_SEARCH_LIMIT),
                    )
                }
            },
        };

        match self.search(&query, limit).await {
            Ok(results) => json_response(
                StatusCode::OK,
                &SearchResponse {
                    query,
                    limit,
                    results,
                },
            ),
            Err(e) => media_error_response(&e),
        }
    }

    async fn handle_convert(&self, req: Request<Incoming>) -> Response<Body> {
        let params = query_params(req.uri().query());
        let mut url = params.get("url").cloned();
        let mut q = params.get("q").or_else(|| params.get("query")).cloned();

        if req.method() == Method::POST {
            let bytes = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return media_error_response(&MediaError::InvalidBody(e.to_string()));
                }
            };
            if !bytes.iter().all(u8::is_ascii_whitespace) {
                match serde_json::from_slice::<ConvertBody>(&bytes) {
                    Ok(body) => {
                        url = body.url.or(url);
                        q = body.q.or(body.query).or(q);
                    }
                    Err(e) => {
                        return media_error_response(&MediaError::InvalidBody(e.to_string()));
                    }
                }
            }
        }

        let source = match ConvertSource::from_params(url.as_deref(), q.as_deref()) {
            Ok(source) => source,
            Err(e) => return media_error_response(&e),
        };

        match self.convert(&source).await {
            Ok(reply) => json_response(StatusCode::OK, &reply),
            Err(e) => media_error_response(&e),
        }
    }

    async fn handle_list(&self) -> Response<Body> {
        match self.store.list().await {
            Ok(files) => json_response(
                StatusCode::OK,
                &serde_json::json!({"count": files.len(), "files": files}),
            ),
            Err(e) => media_error_response(&e),
        }
    }

    async fn serve_file(&self, raw_name: &str, head: bool) -> Response<Body> {
        let path = match self.store.resolve(raw_name).await {
            Ok(path) => path,
            Err(e) => return media_error_response(&e),
        };

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => return media_error_response(&MediaError::Io(e)),
        };
        let len = match file.metadata().await {
            Ok(m) => m.len(),
            Err(e) => return media_error_response(&MediaError::Io(e)),
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let body = if head {
            empty()
        } else {
            stream(ReaderStream::new(file))
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type_for(&name))
            .header(CONTENT_LENGTH, len)
            .header(
                CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", name.replace('"', "")),
            )
            .body(body)
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to build media response");
                json_error_response(ErrorCode::InternalError, "failed to build response")
            })
    }
}

impl Handler for MediaGateway {
    fn name(&self) -> &'static str {
        "media"
    }

    async fn handle(&self, req: Request<Incoming>, _client_addr: SocketAddr) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(method = %method, uri = %req.uri(), "Media request");

        match (&method, path.as_str()) {
            (&Method::GET, "/ping") => json_response(
                StatusCode::OK,
                &serde_json::json!({"ok": true, "service": "media-gateway"}),
            ),
            (&Method::GET, "/status") => self.status().await,
            (&Method::GET, "/search") => {
                let params = query_params(req.uri().query());
                self.handle_search(&params).await
            }
            (&Method::GET, "/convert") | (&Method::POST, "/convert") => self.handle_convert(req).await,
            (&Method::GET, "/media") | (&Method::GET, "/media/") => self.handle_list().await,
            (&Method::GET, p) | (&Method::HEAD, p) if p.starts_with("/media/") => {
                self.serve_file(&p["/media/".len()..], method == Method::HEAD).await
            }
            (_, "/ping") | (_, "/status") | (_, "/search") | (_, "/convert") | (_, "/media") => {
                json_error_response(ErrorCode::MethodNotAllowed, "Method Not Allowed")
            }
            (_, p) if p.starts_with("/media/") => {
                json_error_response(ErrorCode::MethodNotAllowed, "Method Not Allowed")
            }
            _ => json_error_response(ErrorCode::NotFound, "Not Found"),
        }
    }
}

fn media_error_response(error: &MediaError) -> Response<Body> {
    match error.code() {
        ErrorCode::BadRequest | ErrorCode::NotFound => debug!(error = %error, "Media request rejected"),
        _ => warn!(error = %error, "Media request failed"),
    }
    error.to_error_response().into_response()
}

/// Decode a query string; later duplicates win, `+` means space
pub fn query_params(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            let spaced = s.replace('+', " ");
            urlencoding::decode(&spaced)
                .map(|c| c.into_owned())
                .unwrap_or(spaced)
        };
        params.insert(decode(raw_key), decode(raw_value));
    }
    params
}
