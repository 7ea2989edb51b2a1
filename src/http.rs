use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{on, MethodFilter, MethodRouter},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::{net::TcpListener, signal::ctrl_c, task::spawn_blocking};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::ipc::{self, AppState};
use crate::mailer::{self, LogMailer};
use crate::workflow;

pub type Shared = Arc<Mutex<AppState>>;

/// Outbox messages drained per dispatcher tick.
const MAIL_BATCH: usize = 50;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{message}")]
    Handler { code: String, message: String },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub fn status_for(code: &str) -> StatusCode {
    match code {
        "bad_params" | "bad_json" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "forbidden" => StatusCode::FORBIDDEN,
        "not_found" | "not_implemented" => StatusCode::NOT_FOUND,
        "conflict" => StatusCode::CONFLICT,
        "no_workspace" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = match &self {
            AppError::Handler { code, .. } => code.as_str(),
            AppError::MalformedPayload(_) => "bad_json",
            AppError::Internal(_) => "internal",
        };
        let body = json!({
            "success": false,
            "msg": self.to_string(),
            "code": code,
        });
        (status_for(code), Json(body)).into_response()
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
}

/// Body first, then query string, then path captures; later sources win.
fn merge_params(
    body: &Bytes,
    query: HashMap<String, String>,
    path: HashMap<String, String>,
) -> Result<Value, AppError> {
    let mut params = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(m)) => m,
            Ok(_) => {
                return Err(AppError::MalformedPayload(
                    "body must be a JSON object".to_string(),
                ))
            }
            Err(e) => return Err(AppError::MalformedPayload(e.to_string())),
        }
    };
    for (k, v) in query.into_iter().chain(path) {
        params.insert(k, Value::String(v));
    }
    Ok(Value::Object(params))
}

/// Envelope `{ok, result | error}` to `{success, ...}` with a matching status.
fn envelope_to_http(resp: Value) -> Result<Json<Value>, AppError> {
    if resp.get("ok").and_then(Value::as_bool) == Some(true) {
        let mut out = Map::new();
        out.insert("success".to_string(), Value::Bool(true));
        match resp.get("result").cloned() {
            Some(Value::Object(m)) => out.extend(m),
            Some(other) => {
                out.insert("result".to_string(), other);
            }
            None => {}
        }
        return Ok(Json(Value::Object(out)));
    }
    let error = resp.get("error").cloned().unwrap_or(Value::Null);
    Err(AppError::Handler {
        code: error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("internal")
            .to_string(),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string(),
    })
}

async fn dispatch(
    state: Shared,
    method: &'static str,
    params: Value,
    token: Option<String>,
) -> Result<Json<Value>, AppError> {
    let req = ipc::Request {
        id: Uuid::new_v4().to_string(),
        method: method.to_string(),
        params,
        token,
    };
    let resp = spawn_blocking(move || {
        let mut guard = state
            .lock()
            .map_err(|_| AppError::Internal("state lock poisoned".to_string()))?;
        Ok::<_, AppError>(ipc::handle_request(&mut guard, req))
    })
    .await
    .map_err(|e| AppError::Internal(e.to_string()))??;
    envelope_to_http(resp)
}

/// Route without path captures onto a router method.
fn call(filter: MethodFilter, method: &'static str) -> MethodRouter<Shared> {
    on(
        filter,
        move |State(state): State<Shared>,
              Query(query): Query<HashMap<String, String>>,
              headers: HeaderMap,
              body: Bytes| async move {
            let params = merge_params(&body, query, HashMap::new())?;
            dispatch(state, method, params, bearer(&headers)).await
        },
    )
}

/// Route with `{captures}` merged into the params.
fn call_with_path(filter: MethodFilter, method: &'static str) -> MethodRouter<Shared> {
    on(
        filter,
        move |State(state): State<Shared>,
              Path(path): Path<HashMap<String, String>>,
              Query(query): Query<HashMap<String, String>>,
              headers: HeaderMap,
              body: Bytes| async move {
            let params = merge_params(&body, query, path)?;
            dispatch(state, method, params, bearer(&headers)).await
        },
    )
}

pub fn router(state: Shared) -> Router {
    use MethodFilter as M;

    let api = Router::new()
        .route("/health", call(M::GET, "health"))
        .route("/student/signin", call(M::POST, "auth.student.signin"))
        .route("/admin/signin", call(M::POST, "auth.admin.signin"))
        .route("/auth/me", call(M::GET, "auth.me"))
        .route("/auth/change-password", call(M::POST, "auth.changePassword"))
        .route("/admin/bootstrap", call(M::POST, "admins.bootstrap"))
        .route(
            "/admin/admins",
            call(M::GET, "admins.list").merge(call(M::POST, "admins.create")),
        )
        .route(
            "/admin/students/reset-password",
            call(M::POST, "admins.resetStudentPassword"),
        )
        .route(
            "/admin/students",
            call(M::GET, "students.search").merge(call(M::POST, "students.create")),
        )
        .route("/admin/students/upload", call(M::POST, "students.upload"))
        .route(
            "/admin/students/{username}",
            call_with_path(M::GET, "students.get")
                .merge(call_with_path(M::DELETE, "students.delete")),
        )
        .route(
            "/student/profile",
            call(M::GET, "students.get").merge(call(M::PUT, "students.updateProfile")),
        )
        .route("/student/outing", call(M::POST, "outings.create"))
        .route("/student/outpass", call(M::POST, "outpasses.create"))
        .route("/student/requests", call(M::GET, "requests.mine"))
        .route("/student/grades", call(M::GET, "grades.get"))
        .route("/student/attendance", call(M::GET, "attendance.get"))
        .route("/admin/requests", call(M::GET, "requests.list"))
        .route("/admin/requests/sweep", call(M::POST, "requests.sweepExpired"))
        .route("/requests/{kind}/{id}", call_with_path(M::GET, "requests.get"))
        .route(
            "/admin/requests/{kind}/{id}/approve",
            call_with_path(M::POST, "requests.approve"),
        )
        .route(
            "/admin/requests/{kind}/{id}/reject",
            call_with_path(M::POST, "requests.reject"),
        )
        .route(
            "/admin/requests/{kind}/{id}/check-out",
            call_with_path(M::POST, "requests.checkOut"),
        )
        .route(
            "/admin/requests/{kind}/{id}/check-in",
            call_with_path(M::POST, "requests.checkIn"),
        )
        .route(
            "/curriculum/branches",
            call(M::GET, "branches.list").merge(call(M::POST, "branches.create")),
        )
        .route(
            "/curriculum/branches/{branchId}",
            call_with_path(M::DELETE, "branches.delete"),
        )
        .route(
            "/curriculum/semesters",
            call(M::GET, "semesters.list").merge(call(M::POST, "semesters.create")),
        )
        .route(
            "/curriculum/subjects",
            call(M::GET, "subjects.list").merge(call(M::POST, "subjects.create")),
        )
        .route(
            "/curriculum/subjects/{subjectId}",
            call_with_path(M::DELETE, "subjects.delete"),
        )
        .route("/admin/grades/upload", call(M::POST, "grades.upload"))
        .route("/admin/grades/export", call(M::GET, "grades.export"))
        .route("/admin/attendance/upload", call(M::POST, "attendance.upload"))
        .route("/admin/presence", call(M::GET, "presence.summary"))
        .route("/admin/presence/outside", call(M::GET, "presence.outside"))
        .route("/admin/notifications", call(M::GET, "notifications.list"))
        .route(
            "/admin/notifications/dispatch",
            call(M::POST, "notifications.dispatch"),
        );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .nest("/api/v1", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs `job` against the open database on the blocking pool.
async fn with_db<T, F>(state: &Shared, job: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> anyhow::Result<T> + Send + 'static,
{
    let state = state.clone();
    spawn_blocking(move || {
        let guard = state.lock().map_err(|_| anyhow!("state lock poisoned"))?;
        let conn = guard.db.as_ref().ok_or_else(|| anyhow!("no workspace open"))?;
        job(conn)
    })
    .await
    .context("background job panicked")?
}

async fn sweep_loop(state: Shared, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        if let Err(e) = with_db(&state, |conn| workflow::sweep_expired(conn, Utc::now())).await {
            warn!("expiry sweep failed: {e:#}");
        }
    }
}

async fn mail_loop(state: Shared, every: Duration, from: String) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let relay = LogMailer { from: from.clone() };
        let res = with_db(&state, move |conn| {
            mailer::dispatch_pending(conn, &relay, MAIL_BATCH, Utc::now())
        })
        .await;
        match res {
            Ok(s) if s.sent + s.retrying + s.failed > 0 => {
                info!(sent = s.sent, retrying = s.retrying, failed = s.failed, "outbox drained");
            }
            Ok(_) => {}
            Err(e) => warn!("outbox dispatch failed: {e:#}"),
        }
    }
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Opening workspace {}", config.workspace.display());
    let conn = db::open_db(&config.workspace)
        .with_context(|| format!("failed to open workspace {}", config.workspace.display()))?;
    let state: Shared = Arc::new(Mutex::new(AppState {
        workspace: Some(config.workspace.clone()),
        db: Some(conn),
        settings: config.settings.clone(),
    }));

    tokio::spawn(sweep_loop(
        state.clone(),
        Duration::from_secs(config.sweep_interval_secs),
    ));
    tokio::spawn(mail_loop(
        state.clone(),
        Duration::from_secs(config.mail_interval_secs),
        config.settings.mail_from.clone(),
    ));

    let app = router(state);
    let address = format!("0.0.0.0:{}", config.port);
    info!("Binding to {address}");
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                warn!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
