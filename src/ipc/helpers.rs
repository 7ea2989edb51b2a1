use crate::auth::{self, Actor, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::fmt::Display;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", message)
    }

    pub fn db(e: impl Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn internal(e: impl Display) -> Self {
        Self::new("internal", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::db(e)
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        HandlerErr::internal(format!("{e:#}"))
    }
}

impl From<auth::AuthError> for HandlerErr {
    fn from(e: auth::AuthError) -> Self {
        HandlerErr::internal(e)
    }
}

pub fn respond(req: &Request, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Unique-constraint violations surface as `conflict`; anything else is a db failure.
pub fn map_insert_err(e: rusqlite::Error, what: &str) -> HandlerErr {
    if let rusqlite::Error::SqliteFailure(ref f, _) = e {
        if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        {
            return HandlerErr::conflict(format!("{} already exists", what));
        }
    }
    HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": what }))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Passwords are taken verbatim; surrounding spaces are part of the secret.
pub fn get_required_secret(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    get_opt_secret(params, key).ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_secret(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Accepts JSON numbers and numeric strings (query strings arrive as text).
pub fn get_opt_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_opt_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn get_opt_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Bool(b)) => Ok(Some(*b)),
        Some(serde_json::Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(HandlerErr::bad_params(format!("{} must be a boolean", key))),
        },
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn page_limit(params: &serde_json::Value, default: i64, max: i64) -> Result<i64, HandlerErr> {
    Ok(get_opt_i64(params, "limit")?.unwrap_or(default).clamp(1, max))
}

/// Sheet text comes inline as `csv` or from disk via `inPath`.
pub fn read_sheet_text(params: &serde_json::Value) -> Result<String, HandlerErr> {
    if let Some(text) = params.get("csv").and_then(|v| v.as_str()) {
        return Ok(text.to_string());
    }
    let Some(in_path) = get_opt_str(params, "inPath") else {
        return Err(HandlerErr::bad_params("missing csv or inPath"));
    };
    std::fs::read_to_string(&in_path).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": in_path }))
    })
}

pub fn actor(state: &AppState, req: &Request) -> Result<Actor, HandlerErr> {
    let token = req
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| HandlerErr::unauthorized("missing token"))?;
    let actor = auth::verify_token(token, &state.settings.jwt_secret)
        .map_err(|e| HandlerErr::unauthorized(e.to_string()))?;

    // Tokens outlive deletions; make sure the account is still there.
    let conn = db(state)?;
    let present: Option<i64> = match &actor {
        Actor::Student { id, .. } => conn
            .query_row("SELECT 1 FROM students WHERE id = ?", [id], |r| r.get(0))
            .optional()?,
        Actor::Admin { id, role, .. } => conn
            .query_row(
                "SELECT 1 FROM admins WHERE id = ? AND role = ?",
                (id, role.as_str()),
                |r| r.get(0),
            )
            .optional()?,
    };
    if present.is_none() {
        return Err(HandlerErr::unauthorized("account no longer exists"));
    }
    Ok(actor)
}

pub struct StudentCaller {
    pub id: String,
    pub username: String,
}

pub fn require_student(state: &AppState, req: &Request) -> Result<StudentCaller, HandlerErr> {
    match actor(state, req)? {
        Actor::Student { id, username } => Ok(StudentCaller { id, username }),
        Actor::Admin { .. } => Err(HandlerErr::forbidden("students only")),
    }
}

pub struct AdminCaller {
    pub username: String,
    pub role: Role,
}

pub fn require_admin(
    state: &AppState,
    req: &Request,
    allowed: fn(Role) -> bool,
) -> Result<AdminCaller, HandlerErr> {
    match actor(state, req)? {
        Actor::Admin { username, role, .. } if allowed(role) => Ok(AdminCaller { username, role }),
        Actor::Admin { role, .. } => Err(HandlerErr::forbidden(format!(
            "role {} may not call {}",
            role.as_str(),
            req.method
        ))),
        Actor::Student { .. } => Err(HandlerErr::forbidden("admins only")),
    }
}

pub fn any_admin(_: Role) -> bool {
    true
}

/// A student may address themself; an admin may address anyone by `username`.
pub fn resolve_student_target(
    state: &AppState,
    req: &Request,
) -> Result<String, HandlerErr> {
    let conn = db(state)?;
    match actor(state, req)? {
        Actor::Student { id, username } => {
            if let Some(asked) = get_opt_str(&req.params, "username") {
                if !asked.eq_ignore_ascii_case(&username) {
                    return Err(HandlerErr::forbidden("students may only view themselves"));
                }
            }
            Ok(id)
        }
        Actor::Admin { .. } => {
            let username = get_required_str(&req.params, "username")?;
            student_id_by_username(conn, &username)?
                .ok_or_else(|| HandlerErr::not_found("student not found"))
        }
    }
}

pub fn student_id_by_username(
    conn: &Connection,
    username: &str,
) -> Result<Option<String>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id FROM students WHERE username = ?",
            [username.trim().to_ascii_uppercase()],
            |r| r.get(0),
        )
        .optional()?)
}
