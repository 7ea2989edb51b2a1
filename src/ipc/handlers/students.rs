use crate::auth::{self, Role, MIN_PASSWORD_LEN};
use crate::ipc::handlers::requests::open_request_for;
use crate::ipc::helpers::{
    any_admin, db, get_opt_bool, get_opt_i64, get_opt_secret, get_opt_str, get_required_secret,
    get_required_str, map_insert_err, page_limit, read_sheet_text, require_admin, require_student,
    resolve_student_target, respond, student_id_by_username, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::sheets::{self, warning};
use crate::workflow::format_ts;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

const PROFILE_COLUMNS: &str = "s.id, s.username, s.name, s.email, s.gender, s.year, s.branch_id, b.name,
     s.section, s.phone, s.parent_phone, s.address, s.blood_group, s.is_in_campus";

fn profile_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "username": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "email": r.get::<_, String>(3)?,
        "gender": r.get::<_, Option<String>>(4)?,
        "year": r.get::<_, Option<String>>(5)?,
        "branchId": r.get::<_, Option<String>>(6)?,
        "branchName": r.get::<_, Option<String>>(7)?,
        "section": r.get::<_, Option<String>>(8)?,
        "phone": r.get::<_, Option<String>>(9)?,
        "parentPhone": r.get::<_, Option<String>>(10)?,
        "address": r.get::<_, Option<String>>(11)?,
        "bloodGroup": r.get::<_, Option<String>>(12)?,
        "isInCampus": r.get::<_, i64>(13)? != 0,
    }))
}

/// Profile plus the request currently holding the student, if any.
pub fn load_student_profile(
    conn: &Connection,
    student_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let mut profile = conn
        .query_row(
            &format!(
                "SELECT {PROFILE_COLUMNS}
                 FROM students s
                 LEFT JOIN branches b ON b.id = s.branch_id
                 WHERE s.id = ?"
            ),
            [student_id],
            profile_from_row,
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    profile["openRequest"] = open_request_for(conn, student_id)?.unwrap_or(serde_json::Value::Null);
    Ok(profile)
}

fn branch_exists(conn: &Connection, branch_id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row("SELECT 1 FROM branches WHERE id = ?", [branch_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

fn students_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_students)?;
    let conn = db(state)?;
    let p = &req.params;
    let username = get_required_str(p, "username")?.to_ascii_uppercase();
    let name = get_required_str(p, "name")?;
    let email = get_required_str(p, "email")?;
    let password = get_required_secret(p, "password")?;
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("email must contain '@'"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    let branch_id = get_opt_str(p, "branchId");
    if let Some(b) = &branch_id {
        if !branch_exists(conn, b)? {
            return Err(HandlerErr::not_found("branch not found"));
        }
    }

    let id = Uuid::new_v4().to_string();
    let hash = auth::hash_password(&password)?;
    conn.execute(
        "INSERT INTO students(
            id, username, name, email, gender, year, branch_id, section, phone,
            password_hash, is_in_campus, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &username,
            &name,
            &email,
            get_opt_str(p, "gender"),
            get_opt_str(p, "year"),
            &branch_id,
            get_opt_str(p, "section"),
            get_opt_str(p, "phone"),
            &hash,
            format_ts(Utc::now()),
        ),
    )
    .map_err(|e| map_insert_err(e, "student"))?;

    info!(by = %caller.username, username = %username, "student created");
    Ok(json!({ "student": load_student_profile(conn, &id)? }))
}

fn students_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = resolve_student_target(state, req)?;
    let conn = db(state)?;
    Ok(json!({ "student": load_student_profile(conn, &student_id)? }))
}

fn students_update_profile(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_student(state, req)?;
    let conn = db(state)?;
    let p = &req.params;

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (key, column) in [
        ("email", "email = ?"),
        ("phone", "phone = ?"),
        ("parentPhone", "parent_phone = ?"),
        ("address", "address = ?"),
        ("bloodGroup", "blood_group = ?"),
    ] {
        let Some(v) = p.get(key) else { continue };
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::bad_params(format!("{} must be a string", key)));
        };
        let s = s.trim().to_string();
        if key == "email" && !s.contains('@') {
            return Err(HandlerErr::bad_params("email must contain '@'"));
        }
        sets.push(column);
        binds.push(Value::Text(s));
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("nothing to update"));
    }
    sets.push("updated_at = ?");
    binds.push(Value::Text(format_ts(Utc::now())));
    binds.push(Value::Text(caller.id.clone()));

    conn.execute(
        &format!("UPDATE students SET {} WHERE id = ?", sets.join(", ")),
        params_from_iter(binds),
    )?;
    Ok(json!({ "student": load_student_profile(conn, &caller.id)? }))
}

fn students_search(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state, req, any_admin)?;
    let conn = db(state)?;
    let p = &req.params;

    let mut wheres: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(q) = get_opt_str(p, "query") {
        wheres.push("(s.username LIKE ? OR s.name LIKE ?)");
        let like = format!("%{}%", q);
        binds.push(Value::Text(like.clone()));
        binds.push(Value::Text(like));
    }
    if let Some(b) = get_opt_str(p, "branchId") {
        wheres.push("s.branch_id = ?");
        binds.push(Value::Text(b));
    }
    if let Some(y) = get_opt_str(p, "year") {
        wheres.push("s.year = ?");
        binds.push(Value::Text(y));
    }
    if let Some(in_campus) = get_opt_bool(p, "inCampus")? {
        wheres.push("s.is_in_campus = ?");
        binds.push(Value::Integer(in_campus as i64));
    }
    let where_sql = if wheres.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", wheres.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM students s {where_sql}"),
        params_from_iter(binds.iter()),
        |r| r.get(0),
    )?;

    let limit = page_limit(p, 50, 500)?;
    let offset = get_opt_i64(p, "offset")?.unwrap_or(0).max(0);
    binds.push(Value::Integer(limit));
    binds.push(Value::Integer(offset));
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROFILE_COLUMNS}
         FROM students s
         LEFT JOIN branches b ON b.id = s.branch_id
         {where_sql}
         ORDER BY s.username
         LIMIT ? OFFSET ?"
    ))?;
    let students = stmt
        .query_map(params_from_iter(binds.iter()), profile_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "total": total, "students": students }))
}

fn students_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_admins)?;
    let conn = db(state)?;
    let username = get_required_str(&req.params, "username")?;
    let student_id = student_id_by_username(conn, &username)?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Dependency order; there is no ON DELETE CASCADE.
    for table in ["grades", "attendance", "outings", "outpasses", "students"] {
        let column = if table == "students" { "id" } else { "student_id" };
        if let Err(e) = tx.execute(
            &format!("DELETE FROM {} WHERE {} = ?", table, column),
            [&student_id],
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": table })));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    info!(by = %caller.username, username = %username, "student deleted");
    Ok(json!({ "deleted": true }))
}

fn students_upload(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_students)?;
    let conn = db(state)?;
    let p = &req.params;
    let text = read_sheet_text(p)?;
    let dry_run = get_opt_bool(p, "dryRun")?.unwrap_or(false);
    let default_password = get_opt_secret(p, "defaultPassword");
    if let Some(pw) = &default_password {
        if pw.chars().count() < MIN_PASSWORD_LEN {
            return Err(HandlerErr::bad_params(format!(
                "defaultPassword must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
    }

    let branches: HashMap<String, String> = {
        let mut stmt = conn.prepare("SELECT id, name FROM branches")?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, String>(1)?.to_ascii_uppercase(), r.get::<_, String>(0)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        rows
    };

    let parsed = sheets::parse_student_rows(&text);
    // Records the parser dropped count as skipped too.
    let rejected = parsed.rejected();
    let mut warnings = parsed.warnings;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let now = format_ts(Utc::now());

    let mut inserted = 0usize;
    let mut updated = 0usize;
    let mut skipped = rejected;
    for row in &parsed.rows {
        let branch_id = if row.branch.is_empty() {
            None
        } else {
            match branches.get(&row.branch.to_ascii_uppercase()) {
                Some(id) => Some(id.clone()),
                None => {
                    skipped += 1;
                    warnings.push(warning(
                        row.line_no,
                        "unknown_branch",
                        format!("branch '{}' does not exist", row.branch),
                    ));
                    continue;
                }
            }
        };
        let blank = |s: &str| -> Option<String> {
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        };

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM students WHERE username = ?",
                [&row.username],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            tx.execute(
                "UPDATE students
                 SET name = ?, email = ?, gender = ?, year = ?, branch_id = ?, section = ?,
                     phone = ?, updated_at = ?
                 WHERE id = ?",
                (
                    &row.name,
                    &row.email,
                    blank(&row.gender),
                    blank(&row.year),
                    &branch_id,
                    blank(&row.section),
                    blank(&row.phone),
                    &now,
                    &id,
                ),
            )?;
            updated += 1;
            continue;
        }

        let password = if row.password.is_empty() {
            default_password.clone()
        } else {
            Some(row.password.clone())
        };
        let Some(password) = password else {
            skipped += 1;
            warnings.push(warning(
                row.line_no,
                "missing_password",
                "no password column value and no defaultPassword",
            ));
            continue;
        };
        if password.chars().count() < MIN_PASSWORD_LEN {
            skipped += 1;
            warnings.push(warning(
                row.line_no,
                "weak_password",
                format!("password must be at least {} characters", MIN_PASSWORD_LEN),
            ));
            continue;
        }
        // Hashing is the expensive part; a dry run only needs the row checks.
        let hash = if dry_run {
            String::new()
        } else {
            auth::hash_password(&password)?
        };
        tx.execute(
            "INSERT INTO students(
                id, username, name, email, gender, year, branch_id, section, phone,
                password_hash, is_in_campus, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
            (
                Uuid::new_v4().to_string(),
                &row.username,
                &row.name,
                &row.email,
                blank(&row.gender),
                blank(&row.year),
                &branch_id,
                blank(&row.section),
                blank(&row.phone),
                &hash,
                &now,
            ),
        )?;
        inserted += 1;
    }

    if dry_run {
        let _ = tx.rollback();
    } else {
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
        info!(
            by = %caller.username,
            inserted, updated, skipped, "student sheet applied"
        );
    }

    Ok(json!({
        "rowsTotal": parsed.total,
        "rowsParsed": parsed.rows.len(),
        "inserted": inserted,
        "updated": updated,
        "skipped": skipped,
        "warningsCount": warnings.len(),
        "warnings": warnings,
        "dryRun": dry_run,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.create" => students_create(state, req),
        "students.get" => students_get(state, req),
        "students.updateProfile" => students_update_profile(state, req),
        "students.search" => students_search(state, req),
        "students.delete" => students_delete(state, req),
        "students.upload" => students_upload(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
