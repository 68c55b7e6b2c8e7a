//! HTTP API: run the pipeline, list and inspect pending changes, accept them.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
    service::TowerToHyperService,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::diff::{self, FileChange};
use crate::llm::LanguageModel;
use crate::orchestrator::{AgentSystem, PipelineResults};
use crate::store::{change_id_for, ChangeRecord, ChangeStore};
use crate::vcs::{GitIdentity, VcsIntegrator};

// ============================================================================
// State and errors
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub model: Arc<dyn LanguageModel>,
    pub store: Arc<ChangeStore>,
    /// Held while a request mutates a repository
    pipeline_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(config: Config, model: Arc<dyn LanguageModel>) -> Result<Self> {
        let store = ChangeStore::from_config(&config)?;
        Ok(Self {
            config: Arc::new(config),
            model,
            store: Arc::new(store),
            pipeline_lock: Arc::new(Mutex::new(())),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing required field(s): {0}")]
    MissingFields(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("Change ID {0} not found")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn internal(context: &str, err: anyhow::Error) -> Self {
        error!("{}: {:#}", context, err);
        ApiError::Internal(format!("{context}: {err:#}"))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(format!("Invalid JSON body: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingFields(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Trimmed value of a field, `None` when absent or blank
fn required(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Untouched value of a field, `None` when absent or blank
fn required_raw(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chatv1", post(chat))
        .route("/accept_changes", post(accept_changes))
        .route("/pending_changes", get(pending_changes))
        .route("/get_file_changes", post(get_file_changes))
        .route("/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// -- /chatv1 --

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    repo_path: Option<String>,
    prompt: Option<String>,
    index_path: Option<String>,
    branch_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    #[serde(flatten)]
    results: PipelineResults,
    change_id: String,
    backed_up_files: Vec<String>,
    branch_name: String,
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(req) = payload?;
    let (Some(repo_path), Some(prompt)) = (required(&req.repo_path), required_raw(&req.prompt)) else {
        return Err(ApiError::MissingFields("'repo_path' and 'prompt'"));
    };
    let repo_path = PathBuf::from(repo_path);
    if !repo_path.is_dir() {
        return Err(ApiError::BadRequest(format!(
            "Repository path not found: {}",
            repo_path.display()
        )));
    }
    let index_path = required(&req.index_path).map(PathBuf::from);

    let _guard = state.pipeline_lock.lock().await;
    let change_id = change_id_for(prompt);
    info!("💬 /chatv1 change {} for {}", change_id, repo_path.display());

    let system = AgentSystem::open(&repo_path, index_path.as_deref(), &state.config, state.model.clone())
        .await
        .map_err(|e| ApiError::internal("Failed to process request", e))?;

    let backed_up_files = state
        .store
        .backup_original_files(&change_id, &repo_path, &state.config.exclude_dirs)
        .map_err(|e| ApiError::internal("Failed to back up repository", e))?;

    let results = system
        .process_requirement(prompt)
        .await
        .map_err(|e| ApiError::internal("Failed to process request", e))?;

    let branch_name = required(&req.branch_name)
        .map(str::to_string)
        .unwrap_or_else(|| state.config.branch_for(&change_id));
    let record = ChangeRecord {
        change_id: change_id.clone(),
        repo_path,
        index_path,
        requirement: prompt.to_string(),
        branch_name: Some(branch_name.clone()),
        results: results.clone(),
        backed_up_files: backed_up_files.clone(),
        created_at: Utc::now(),
    };
    state
        .store
        .save(&record)
        .map_err(|e| ApiError::internal("Failed to save change", e))?;

    Ok(Json(ChatResponse {
        results,
        change_id,
        backed_up_files,
        branch_name,
    }))
}

// -- /accept_changes --

#[derive(Debug, Deserialize)]
pub struct AcceptRequest {
    change_id: Option<String>,
    commit_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptResponse {
    change_id: String,
    commit_success: bool,
    commit_message: String,
    branch_name: String,
}

fn load_record(store: &ChangeStore, change_id: &str) -> Result<ChangeRecord, ApiError> {
    store
        .get(change_id)
        .map_err(|e| ApiError::internal("Failed to load change", e))?
        .ok_or_else(|| ApiError::NotFound(change_id.to_string()))
}

async fn accept_changes(
    State(state): State<AppState>,
    payload: Result<Json<AcceptRequest>, JsonRejection>,
) -> Result<Json<AcceptResponse>, ApiError> {
    let Json(req) = payload?;
    let change_id = required(&req.change_id).ok_or(ApiError::MissingFields("'change_id'"))?;
    let record = load_record(&state.store, change_id)?;

    let _guard = state.pipeline_lock.lock().await;
    let branch_name = record
        .branch_name
        .clone()
        .unwrap_or_else(|| state.config.branch_for(&record.change_id));
    let vcs = VcsIntegrator::new(
        &record.repo_path,
        branch_name.clone(),
        GitIdentity::from(state.config.as_ref()),
        state.model.clone(),
    );

    let commit_message = match required(&req.commit_message) {
        Some(message) => message.to_string(),
        None => vcs
            .generate_commit_message(&record.results.plan, &record.results.changes)
            .await
            .map_err(|e| ApiError::internal("Failed to generate commit message", e))?,
    };
    if record.results.commit_warning.is_some() {
        warn!("Accepting change {} although its tests failed", record.change_id);
    }

    let message = commit_message.clone();
    let commit_success = tokio::task::spawn_blocking(move || vcs.commit_changes(&message))
        .await
        .map_err(|e| ApiError::Internal(format!("Commit task failed: {e}")))?;

    Ok(Json(AcceptResponse {
        change_id: record.change_id,
        commit_success,
        commit_message,
        branch_name,
    }))
}

// -- /pending_changes --

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingChange {
    change_id: String,
    requirement: String,
    repo_path: PathBuf,
    branch_name: Option<String>,
    test_success: bool,
}

async fn pending_changes(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let records = state
        .store
        .list()
        .map_err(|e| ApiError::internal("Failed to list pending changes", e))?;

    let pending: Vec<PendingChange> = records
        .into_iter()
        .map(|r| PendingChange {
            test_success: r.results.test_results.success,
            change_id: r.change_id,
            requirement: r.requirement,
            repo_path: r.repo_path,
            branch_name: r.branch_name,
        })
        .collect();
    Ok(Json(json!({ "pending_changes": pending })))
}

// -- /get_file_changes --

#[derive(Debug, Deserialize)]
pub struct FileChangesRequest {
    change_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileChangesResponse {
    change_id: String,
    file_changes: BTreeMap<String, FileChange>,
}

fn read_current(repo_path: &Path, file_path: &str) -> Option<String> {
    let path = crate::executor::resolve_in_repo(repo_path, file_path).ok()?;
    match std::fs::read_to_string(&path) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            None
        }
    }
}

async fn get_file_changes(
    State(state): State<AppState>,
    payload: Result<Json<FileChangesRequest>, JsonRejection>,
) -> Result<Json<FileChangesResponse>, ApiError> {
    let Json(req) = payload?;
    let change_id = required(&req.change_id).ok_or(ApiError::MissingFields("'change_id'"))?;
    let record = load_record(&state.store, change_id)?;
    let changes = &record.results.changes;

    let mut file_changes = BTreeMap::new();
    for file_path in &changes.modified_files {
        let Some(current) = read_current(&record.repo_path, file_path) else {
            continue;
        };
        let original = state.store.original_file_content(&record.change_id, file_path);
        file_changes.insert(file_path.clone(), diff::modified_file(file_path, original, current));
    }
    for file_path in &changes.created_files {
        if let Some(current) = read_current(&record.repo_path, file_path) {
            file_changes.insert(file_path.clone(), diff::created_file(file_path, current));
        }
    }
    debug!("{} file changes for {}", file_changes.len(), record.change_id);

    Ok(Json(FileChangesResponse {
        change_id: record.change_id,
        file_changes,
    }))
}

// -- /status --

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.config.chat_model,
        "retrieval": state.config.retrieval,
        "data_dir": state.config.data_dir,
    }))
}

// ============================================================================
// Serving
// ============================================================================

/// Accept connections on `listener` until `shutdown` completes
pub async fn serve_with_shutdown<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let service = TowerToHyperService::new(app);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down HTTP server");
                break;
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, addr)) => {
                        debug!("New connection from: {}", addr);
                        let io = TokioIo::new(stream);
                        let service = service.clone();

                        tokio::spawn(async move {
                            if let Err(e) = Builder::new(TokioExecutor::new())
                                .serve_connection(io, service)
                                .await
                            {
                                error!("Connection error: {e:?}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {e:?}");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Bind `config.bind_addr` and serve until Ctrl+C
pub async fn serve(state: AppState) -> Result<()> {
    let listener = TcpListener::bind(&state.config.bind_addr).await?;
    info!("🌐 Listening on http://{}", listener.local_addr()?);

    let app = router(state);
    serve_with_shutdown(listener, app, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::RetrievalMode;
    use crate::test_support::pipeline_model;
    use std::fs;
    use std::process::Command;
    use tempfile::{tempdir, TempDir};

    struct TestServer {
        base: String,
        client: reqwest::Client,
        _shutdown: tokio::sync::oneshot::Sender<()>,
    }

    impl TestServer {
        async fn start(data_dir: &Path) -> Self {
            let config = Config {
                data_dir: data_dir.to_path_buf(),
                retrieval: RetrievalMode::Lexical,
                test_command: "true".to_string(),
                test_timeout_secs: 30,
                ..Config::default()
            };
            let state = AppState::new(config, pipeline_model()).unwrap();
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let (tx, rx) = tokio::sync::oneshot::channel::<()>();
            tokio::spawn(serve_with_shutdown(listener, router(state), async {
                rx.await.ok();
            }));

            Self {
                base,
                client: reqwest::Client::new(),
                _shutdown: tx,
            }
        }

        async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
            let resp = self
                .client
                .post(format!("{}{}", self.base, path))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
            (status, resp.json().await.unwrap())
        }

        async fn get(&self, path: &str) -> (StatusCode, Value) {
            let resp = self.client.get(format!("{}{}", self.base, path)).send().await.unwrap();
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
            (status, resp.json().await.unwrap())
        }
    }

    fn git(repo: &Path, args: &[&str]) {
        let status = Command::new("git").args(args).current_dir(repo).status().unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn git_repo() -> (TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        fs::write(repo.join("parser.py"), "def parse_input(s):\n    return s\n").unwrap();
        git(&repo, &["init", "-q"]);
        git(&repo, &["add", "-A"]);
        git(&repo, &["-c", "user.name=t", "-c", "user.email=t@t", "commit", "-q", "-m", "init"]);
        (dir, repo)
    }

    #[tokio::test]
    async fn test_status_and_validation_errors() {
        let dir = tempdir().unwrap();
        let server = TestServer::start(dir.path()).await;

        let (status, body) = server.get("/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "rig-coder");
        assert_eq!(body["retrieval"], "lexical");

        let (status, body) = server.post("/chatv1", json!({"prompt": "x"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("'repo_path' and 'prompt'"));

        let (status, _) = server
            .post("/chatv1", json!({"repo_path": "/no/such/repo", "prompt": "x"}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown = change_id_for("never submitted");
        let (status, body) = server.post("/accept_changes", json!({"change_id": unknown})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], format!("Change ID {unknown} not found"));

        let (status, _) = server.post("/get_file_changes", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_change_lifecycle() {
        let (dir, repo) = git_repo();
        let server = TestServer::start(&dir.path().join("data")).await;
        let prompt = "Strip whitespace in parse_input\n";

        let (status, body) = server
            .post("/chatv1", json!({"repo_path": repo, "prompt": prompt}))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let change_id = body["change_id"].as_str().unwrap().to_string();
        assert_eq!(change_id, change_id_for(prompt));
        assert_ne!(change_id, change_id_for(prompt.trim()));
        assert_eq!(body["requirement"], prompt);
        assert_eq!(body["backed_up_files"], json!(["parser.py"]));
        assert_eq!(body["changes"]["modified_files"], json!(["parser.py"]));
        assert_eq!(body["test_results"]["success"], true);

        let (_, body) = server.get("/pending_changes").await;
        let pending = body["pending_changes"].as_array().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["change_id"], change_id.as_str());
        assert_eq!(pending[0]["requirement"], prompt);
        assert_eq!(pending[0]["test_success"], true);

        let (status, body) = server
            .post("/get_file_changes", json!({"change_id": change_id}))
            .await;
        assert_eq!(status, StatusCode::OK);
        let parser = &body["file_changes"]["parser.py"];
        assert_eq!(parser["original"], "def parse_input(s):\n    return s\n");
        assert_eq!(parser["current"], "def parse_input(s):\n    return s.strip()\n");
        let diff = parser["diff"].as_str().unwrap();
        assert!(diff.starts_with("--- a/parser.py\n+++ b/parser.py\n"));
        assert!(diff.contains("+    return s.strip()"));

        let (status, body) = server
            .post("/accept_changes", json!({"change_id": change_id}))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["commit_success"], true);
        assert_eq!(body["commit_message"], "Strip parser input\n\n- trim whitespace in parse_input");
        let branch = body["branch_name"].as_str().unwrap();
        assert!(branch.starts_with("auto/coder/"));

        let head = Command::new("git")
            .args(["log", "-1", "--format=%s"])
            .current_dir(&repo)
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&head.stdout).trim(), "Strip parser input");
    }
}
