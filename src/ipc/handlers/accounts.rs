use crate::auth::{self, Actor, Role, MIN_PASSWORD_LEN};
use crate::ipc::handlers::students::load_student_profile;
use crate::ipc::helpers::{
    actor, db, get_required_secret, get_required_str, map_insert_err, require_admin, respond,
    student_id_by_username, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::workflow::format_ts;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

fn check_new_password(pw: &str) -> Result<(), HandlerErr> {
    if pw.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn normalize_admin_username(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

fn admin_json(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, username, email, role, created_at FROM admins WHERE id = ?",
        [id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("admin not found"))
}

fn student_signin(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db(state)?;
    let username = get_required_str(&req.params, "username")?.to_ascii_uppercase();
    let password = get_required_secret(&req.params, "password")?;

    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT id, password_hash FROM students WHERE username = ?",
            [&username],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let verified = auth::verify_password_or_dummy(&password, row.as_ref().map(|(_, h)| h.as_str()));
    let Some((id, _)) = row.filter(|_| verified) else {
        warn!(username = %username, "student sign-in rejected");
        return Err(HandlerErr::unauthorized("invalid username or password"));
    };

    let token = auth::issue_token(
        &Actor::Student {
            id: id.clone(),
            username: username.clone(),
        },
        &state.settings.jwt_secret,
        state.settings.token_ttl_hours,
    )?;
    info!(username = %username, "student signed in");
    Ok(json!({
        "token": token,
        "student": load_student_profile(conn, &id)?,
    }))
}

fn admin_signin(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db(state)?;
    let username = normalize_admin_username(&get_required_str(&req.params, "username")?);
    let password = get_required_secret(&req.params, "password")?;

    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, role, password_hash FROM admins WHERE username = ?",
            [&username],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let verified =
        auth::verify_password_or_dummy(&password, row.as_ref().map(|(_, _, h)| h.as_str()));
    let Some((id, role_s, _)) = row.filter(|_| verified) else {
        warn!(username = %username, "admin sign-in rejected");
        return Err(HandlerErr::unauthorized("invalid username or password"));
    };
    let role = Role::parse(&role_s)
        .ok_or_else(|| HandlerErr::internal(format!("stored role is unknown: {}", role_s)))?;

    let token = auth::issue_token(
        &Actor::Admin {
            id: id.clone(),
            username: username.clone(),
            role,
        },
        &state.settings.jwt_secret,
        state.settings.token_ttl_hours,
    )?;
    info!(username = %username, role = role.as_str(), "admin signed in");
    Ok(json!({
        "token": token,
        "admin": admin_json(conn, &id)?,
    }))
}

fn me(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db(state)?;
    match actor(state, req)? {
        Actor::Student { id, .. } => Ok(json!({
            "kind": "student",
            "student": load_student_profile(conn, &id)?,
        })),
        Actor::Admin { id, .. } => Ok(json!({
            "kind": "admin",
            "admin": admin_json(conn, &id)?,
        })),
    }
}

fn change_password(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db(state)?;
    let caller = actor(state, req)?;
    let old_password = get_required_secret(&req.params, "oldPassword")?;
    let new_password = get_required_secret(&req.params, "newPassword")?;
    check_new_password(&new_password)?;

    let (table, id) = match &caller {
        Actor::Student { id, .. } => ("students", id),
        Actor::Admin { id, .. } => ("admins", id),
    };
    let stored: String = conn.query_row(
        &format!("SELECT password_hash FROM {} WHERE id = ?", table),
        [id],
        |r| r.get(0),
    )?;
    if !auth::verify_password(&old_password, &stored) {
        return Err(HandlerErr::unauthorized("current password is incorrect"));
    }
    let hash = auth::hash_password(&new_password)?;
    conn.execute(
        &format!("UPDATE {} SET password_hash = ? WHERE id = ?", table),
        (&hash, id),
    )?;
    info!(username = caller.username(), "password changed");
    Ok(json!({ "changed": true }))
}

fn insert_admin(
    conn: &Connection,
    username: &str,
    email: &str,
    role: Role,
    password: &str,
) -> Result<String, HandlerErr> {
    check_new_password(password)?;
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("email must contain '@'"));
    }
    let id = Uuid::new_v4().to_string();
    let hash = auth::hash_password(password)?;
    conn.execute(
        "INSERT INTO admins(id, username, email, role, password_hash, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, username, email, role.as_str(), &hash, format_ts(Utc::now())),
    )
    .map_err(|e| map_insert_err(e, "admin"))?;
    Ok(id)
}

fn bootstrap(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db(state)?;
    let existing: i64 = conn.query_row("SELECT COUNT(*) FROM admins", [], |r| r.get(0))?;
    if existing > 0 {
        return Err(HandlerErr::conflict("admins already exist"));
    }
    let username = normalize_admin_username(&get_required_str(&req.params, "username")?);
    let email = get_required_str(&req.params, "email")?;
    let password = get_required_secret(&req.params, "password")?;
    let id = insert_admin(conn, &username, &email, Role::Webmaster, &password)?;
    info!(username = %username, "bootstrapped first webmaster");
    Ok(json!({ "admin": admin_json(conn, &id)? }))
}

fn admins_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_admins)?;
    let conn = db(state)?;
    let username = normalize_admin_username(&get_required_str(&req.params, "username")?);
    let email = get_required_str(&req.params, "email")?;
    let password = get_required_secret(&req.params, "password")?;
    let role_s = get_required_str(&req.params, "role")?;
    let role = Role::parse(&role_s)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", role_s)))?;
    let id = insert_admin(conn, &username, &email, role, &password)?;
    info!(by = %caller.username, username = %username, role = role.as_str(), "admin created");
    Ok(json!({ "admin": admin_json(conn, &id)? }))
}

fn admins_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state, req, Role::can_manage_admins)?;
    let conn = db(state)?;
    let mut stmt = conn.prepare(
        "SELECT id, username, email, role, created_at FROM admins ORDER BY role, username",
    )?;
    let admins = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "admins": admins }))
}

fn reset_student_password(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_students)?;
    let conn = db(state)?;
    let username = get_required_str(&req.params, "username")?;
    let new_password = get_required_secret(&req.params, "newPassword")?;
    check_new_password(&new_password)?;
    let id = student_id_by_username(conn, &username)?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    let hash = auth::hash_password(&new_password)?;
    conn.execute(
        "UPDATE students SET password_hash = ?, updated_at = ? WHERE id = ?",
        (&hash, format_ts(Utc::now()), &id),
    )?;
    info!(by = %caller.username, student = %username, "student password reset");
    Ok(json!({ "reset": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.student.signin" => student_signin(state, req),
        "auth.admin.signin" => admin_signin(state, req),
        "auth.me" => me(state, req),
        "auth.changePassword" => change_password(state, req),
        "admins.bootstrap" => bootstrap(state, req),
        "admins.create" => admins_create(state, req),
        "admins.list" => admins_list(state, req),
        "admins.resetStudentPassword" => reset_student_password(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
