//! Axum routes and handlers.
//!
//! All shared state is injected through [`AppState`]; handlers go through the
//! registry and coordinator contracts, never a bare map.

use std::io;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{BoxError, Json, Router};
use futures::{Stream, TryStreamExt};
use serde_json::json;
use tokio::fs::File;
use tokio::io::BufWriter;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::AppError;
use crate::merge::MergeCoordinator;
use crate::reaper;
use crate::registry::{Session, StreamRegistry};
use crate::supervisor::{self, ExitEvent, StopMode};
use crate::util;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<StreamRegistry>,
    pub merges: Arc<MergeCoordinator>,
    pub exit_tx: mpsc::UnboundedSender<ExitEvent>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(control_panel))
        .route("/upload", post(upload_single))
        .route("/upload/step1", post(upload_step1))
        .route("/upload/step2", post(upload_step2))
        .route("/streams", get(list_streams))
        .route("/streams/all", delete(stop_all_streams))
        .route("/streams/:id", delete(stop_stream))
        .route("/streams/:id/info", get(stream_info))
        .route("/cleanup", post(cleanup))
        .route("/output/:stream/:file", get(serve_output))
        .layer(cors)
        .layer(DefaultBodyLimit::max(state.config.max_file_size))
        .with_state(state)
}

/// Spawn the transcoder against `input` and register the session. Setup is
/// all-or-nothing: any failure removes the staged input and the output
/// directory, and no session stays registered without a live process.
pub async fn launch_stream(
    state: &AppState,
    name: &str,
    input: PathBuf,
) -> Result<String, AppError> {
    let slot = match state.registry.try_reserve() {
        Ok(slot) => slot,
        Err(e) => {
            discard_file(&input).await;
            return Err(e.into());
        }
    };

    let stream_id = util::allocate_stream_id(name);
    let out_dir = state.config.output_dir.join(&stream_id);
    if let Err(e) = tokio::fs::create_dir_all(&out_dir).await {
        discard_file(&input).await;
        return Err(AppError::Internal(e));
    }

    let spawned = match supervisor::spawn_transcoder(&stream_id, &input, &out_dir, &state.config)
    {
        Ok(spawned) => spawned,
        Err(e) => {
            reaper::reap_session(&out_dir, &input).await;
            return Err(AppError::SpawnFailed(e));
        }
    };

    state.registry.register(Session::new(
        stream_id.clone(),
        spawned.handle,
        out_dir,
        input,
        slot,
    ));
    // Only a registered session gets a monitor, so an exit event can never
    // race ahead of its registry entry.
    tokio::spawn(spawned.monitor.watch(state.exit_tx.clone()));

    tracing::info!(stream = %stream_id, "stream session started");
    Ok(stream_id)
}

/// POST /upload - single-video mode: stage the file, start looping it.
async fn upload_single(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let upload = read_upload(&state, multipart, &["name"]).await?;
    let name = upload.field("name")?;
    let input = upload.file_path()?;

    let stream_id = launch_stream(&state, &name, input).await?;
    Ok(Json(json!({ "stream_id": stream_id })))
}

/// POST /upload/step1 - park the first video of a two-video merge.
async fn upload_step1(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let upload = read_upload(&state, multipart, &[]).await?;
    let first = upload.file_path()?;

    let merge_id = state.merges.begin_merge(first);
    Ok(Json(json!({ "merge_id": merge_id })))
}

/// POST /upload/step2 - redeem the merge token, merge, start streaming.
async fn upload_step2(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let upload = read_upload(&state, multipart, &["merge_id", "name"]).await?;
    let merge_id = upload.field("merge_id")?;
    let name = upload.field("name")?;
    let second = upload.file_path()?;

    let merged = state
        .config
        .upload_dir
        .join(format!("merged_{}.mp4", util::short_token()));

    if let Err(e) = state.merges.complete_merge(&merge_id, &second, &merged).await {
        // The coordinator consumed the inputs it saw; for an invalid token it
        // never saw the second file, so drop it here.
        discard_file(&second).await;
        return Err(e.into());
    }

    let stream_id = launch_stream(&state, &name, merged).await?;
    Ok(Json(json!({ "stream_id": stream_id })))
}

/// GET /streams - live sessions as stream id -> playlist URL.
async fn list_streams(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.registry.list_active()))
}

/// GET /streams/:id/info - session status plus output inventory.
async fn stream_info(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let info = state
        .registry
        .get(&stream_id)
        .ok_or_else(|| AppError::NotFound(stream_id.clone()))?;

    let mut segments: Vec<String> = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(&info.output_path).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".ts") {
                segments.push(name);
            }
        }
    }
    segments.sort();

    let playlist_ready = tokio::fs::try_exists(info.output_path.join("index.m3u8"))
        .await
        .unwrap_or(false);
    let started_at = info
        .started_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Ok(Json(json!({
        "stream_id": info.stream_id,
        "status": if info.alive { "running" } else { "exited" },
        "pid": info.pid,
        "started_at": started_at,
        "playlist_ready": playlist_ready,
        "playlist_url": format!("/output/{}/index.m3u8", info.stream_id),
        "segment_count": segments.len(),
        "segments": segments,
    })))
}

/// DELETE /streams/:id - stop one stream and reap its artifacts.
async fn stop_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.registry.stop_one(&stream_id).await?;
    Ok(Json(json!({
        "stream_id": stream_id,
        "message": format!("stream {} stopped", stream_id),
    })))
}

/// DELETE /streams/all - stop every active stream.
async fn stop_all_streams(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stopped = state.registry.stop_all(StopMode::Graceful).await;
    Json(json!({ "stopped": stopped }))
}

/// POST /cleanup - administrative wipe of sessions and staging/output roots.
async fn cleanup(State(state): State<AppState>) -> Json<reaper::ReapReport> {
    let report = reaper::reap_all(
        &state.registry,
        &state.config.upload_dir,
        &state.config.output_dir,
    )
    .await;
    Json(report)
}

/// GET /output/:stream/:file - serve generated playlists and segments.
async fn serve_output(
    State(state): State<AppState>,
    Path((stream_id, file)): Path<(String, String)>,
) -> Result<Response, AppError> {
    if !util::path_component_is_safe(&stream_id) || !util::path_component_is_safe(&file) {
        return Err(AppError::Validation("invalid path".into()));
    }

    let path = state.config.output_dir.join(&stream_id).join(&file);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!("{}/{}", stream_id, file)));
        }
        Err(e) => return Err(AppError::Internal(e)),
    };

    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        data,
    )
        .into_response())
}

/// Collected multipart form: optional text fields plus one staged file.
struct UploadForm {
    fields: std::collections::HashMap<String, String>,
    staged_file: Option<PathBuf>,
}

impl UploadForm {
    fn field(&self, name: &str) -> Result<String, AppError> {
        self.fields
            .get(name)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Validation(format!("missing field: {}", name)))
    }

    fn file_path(&self) -> Result<PathBuf, AppError> {
        self.staged_file
            .clone()
            .ok_or_else(|| AppError::Validation("missing video file".into()))
    }

    async fn discard(&self) {
        if let Some(path) = &self.staged_file {
            discard_file(path).await;
        }
    }
}

/// Drain a multipart request: text fields listed in `expected_fields` are
/// collected, the `file` field is streamed into the upload staging area.
/// A request missing the file or any expected field is rejected, and its
/// staged file (if any) is removed.
async fn read_upload(
    state: &AppState,
    mut multipart: Multipart,
    expected_fields: &[&str],
) -> Result<UploadForm, AppError> {
    let mut form = UploadForm {
        fields: Default::default(),
        staged_file: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?
    {
        let field_name = match field.name() {
            Some(name) => name.to_owned(),
            None => continue,
        };

        if field_name == "file" {
            let original = field
                .file_name()
                .filter(|n| !n.is_empty())
                .unwrap_or("upload.bin")
                .to_owned();
            let path = state.config.upload_dir.join(util::staged_file_name(&original));
            if let Err(e) = stream_to_file(&path, field).await {
                // A half-written staged file is useless; drop it with the request.
                discard_file(&path).await;
                form.discard().await;
                return Err(e);
            }
            tracing::debug!(path = %path.display(), "upload staged");
            form.staged_file = Some(path);
        } else if expected_fields.contains(&field_name.as_str()) {
            let value = field
                .text()
                .await
                .map_err(|e| AppError::Validation(e.to_string()))?;
            form.fields.insert(field_name, value);
        }
    }

    for expected in expected_fields {
        if form.field(expected).is_err() {
            form.discard().await;
            return Err(AppError::Validation(format!("missing field: {}", expected)));
        }
    }
    if form.staged_file.is_none() {
        return Err(AppError::Validation("missing video file".into()));
    }

    Ok(form)
}

/// Save a byte `Stream` to a file.
async fn stream_to_file<S, E>(path: &FsPath, stream: S) -> Result<(), AppError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    async {
        let body_with_io_error =
            stream.map_err(|err| io::Error::new(io::ErrorKind::Other, err));
        let body_reader = StreamReader::new(body_with_io_error);
        futures::pin_mut!(body_reader);

        let mut file = BufWriter::new(File::create(path).await?);
        tokio::io::copy(&mut body_reader, &mut file).await?;

        Ok::<_, io::Error>(())
    }
    .await
    .map_err(AppError::Internal)
}

/// Remove a staged file after a failed setup path.
async fn discard_file(path: &FsPath) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), "failed to remove staged file: {}", e);
        }
    }
}

/// GET / - minimal control panel for manual use.
async fn control_panel() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
<title>Loopcast</title>
<style>
body{font-family:Arial;background:#f5f5f5;max-width:900px;margin:auto;padding:20px}
.container{background:#fff;padding:20px;border-radius:8px;margin-bottom:20px}
button{padding:8px 12px;margin-top:10px}
</style>
</head>
<body>

<h2>Upload Single Video</h2>
<div class="container">
<form id="single">
<input type="text" name="name" placeholder="Stream Name" required><br>
<input type="file" name="file" required><br>
<button>Upload</button>
</form>
</div>

<h2>Upload 2 Videos (Merge Mode)</h2>
<div class="container">
<input type="file" id="v1"><br>
<button onclick="upload1()">Upload Video 1</button><br><br>

<input type="file" id="v2"><br>
<input type="text" id="name" placeholder="Stream Name"><br>
<button onclick="upload2()">Upload Video 2 &amp; Start</button>
</div>

<script>
let mergeId=null;

document.getElementById('single').onsubmit=async(e)=>{
e.preventDefault();
const f=new FormData(e.target);
const r=await fetch('/upload',{method:'POST',body:f});
const j=await r.json();
alert(r.ok?'Stream started: '+j.stream_id:j.error);
};

async function upload1(){
const f=new FormData();
f.append('file',v1.files[0]);
const r=await fetch('/upload/step1',{method:'POST',body:f});
const j=await r.json();
mergeId=j.merge_id;
alert('Video 1 OK');
}

async function upload2(){
const f=new FormData();
f.append('file',v2.files[0]);
f.append('merge_id',mergeId);
f.append('name',name.value);
const r=await fetch('/upload/step2',{method:'POST',body:f});
const j=await r.json();
alert(r.ok?'Merged stream started: '+j.stream_id:j.error);
}
</script>
</body>
</html>
"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_state(uploads: &FsPath, output: &FsPath) -> AppState {
        let config = Config {
            addr: String::from("127.0.0.1"),
            port: String::from("0"),
            upload_dir: uploads.to_path_buf(),
            output_dir: output.to_path_buf(),
            max_file_size: 1024 * 1024,
            max_concurrent_streams: 10,
            stop_grace: Duration::from_secs(5),
            merge_ttl: Duration::from_secs(300),
        };
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        AppState {
            registry: Arc::new(StreamRegistry::new(config.max_concurrent_streams)),
            merges: Arc::new(MergeCoordinator::new(config.merge_ttl)),
            config: Arc::new(config),
            exit_tx,
        }
    }

    #[tokio::test]
    async fn router_builds() {
        let uploads = tempdir().expect("uploads");
        let output = tempdir().expect("output");
        let _app = router(test_state(uploads.path(), output.path()));
    }

    #[tokio::test]
    async fn stream_to_file_writes_all_chunks() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("staged.bin");

        type E = io::Error;
        let chunks = stream::iter(vec![
            Ok::<bytes::Bytes, E>(bytes::Bytes::from_static(b"hello ")),
            Ok::<bytes::Bytes, E>(bytes::Bytes::from_static(b"world")),
        ]);

        stream_to_file(&path, chunks).await.expect("write");
        assert_eq!(std::fs::read(&path).expect("read"), b"hello world");
    }

    #[tokio::test]
    async fn stream_to_file_propagates_stream_errors() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("staged.bin");

        let chunks = stream::iter(vec![Err::<Bytes, _>("upstream broke")]);
        let err = stream_to_file(&path, chunks).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[test]
    fn upload_form_requires_named_fields() {
        let form = UploadForm {
            fields: Default::default(),
            staged_file: None,
        };
        assert!(matches!(form.field("name"), Err(AppError::Validation(_))));
        assert!(matches!(form.file_path(), Err(AppError::Validation(_))));

        let mut fields = std::collections::HashMap::new();
        fields.insert("name".to_owned(), "  demo  ".to_owned());
        let form = UploadForm {
            fields,
            staged_file: Some(PathBuf::from("/tmp/x.mp4")),
        };
        assert_eq!(form.field("name").expect("name"), "demo");
        assert_eq!(form.file_path().expect("file"), PathBuf::from("/tmp/x.mp4"));
    }
}
