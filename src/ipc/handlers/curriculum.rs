use crate::auth::Role;
use crate::ipc::helpers::{
    actor, db, get_opt_f64, get_opt_str, get_required_str, map_insert_err, require_admin,
    respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn count_refs(conn: &Connection, sql: &str, id: &str) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(sql, [id], |r| r.get(0))?)
}

fn branches_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    actor(state, req)?;
    let conn = db(state)?;
    let mut stmt = conn.prepare(
        "SELECT b.id, b.name,
                (SELECT COUNT(*) FROM students s WHERE s.branch_id = b.id)
         FROM branches b
         ORDER BY b.name",
    )?;
    let branches = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "studentCount": r.get::<_, i64>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "branches": branches }))
}

fn branches_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_students)?;
    let conn = db(state)?;
    let name = get_required_str(&req.params, "name")?.to_ascii_uppercase();
    let id = Uuid::new_v4().to_string();
    conn.execute("INSERT INTO branches(id, name) VALUES(?, ?)", (&id, &name))
        .map_err(|e| map_insert_err(e, "branch"))?;
    info!(by = %caller.username, branch = %name, "branch created");
    Ok(json!({ "branchId": id, "name": name }))
}

fn branches_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_admins)?;
    let conn = db(state)?;
    let branch_id = get_required_str(&req.params, "branchId")?;
    let name: String = conn
        .query_row("SELECT name FROM branches WHERE id = ?", [&branch_id], |r| {
            r.get(0)
        })
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("branch not found"))?;

    let students = count_refs(
        conn,
        "SELECT COUNT(*) FROM students WHERE branch_id = ?",
        &branch_id,
    )?;
    let subjects = count_refs(
        conn,
        "SELECT COUNT(*) FROM subjects WHERE branch_id = ?",
        &branch_id,
    )?;
    if students > 0 || subjects > 0 {
        return Err(HandlerErr::conflict("branch is still in use").with_details(json!({
            "students": students,
            "subjects": subjects,
        })));
    }
    conn.execute("DELETE FROM branches WHERE id = ?", [&branch_id])?;
    info!(by = %caller.username, branch = %name, "branch deleted");
    Ok(json!({ "deleted": true }))
}

fn semesters_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    actor(state, req)?;
    let conn = db(state)?;
    let mut stmt = conn.prepare("SELECT id, year, name FROM semesters ORDER BY year, name")?;
    let semesters = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "year": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "semesters": semesters }))
}

fn semesters_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_students)?;
    let conn = db(state)?;
    let year = get_required_str(&req.params, "year")?.to_ascii_uppercase();
    let name = get_required_str(&req.params, "name")?.to_ascii_uppercase();
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO semesters(id, year, name) VALUES(?, ?, ?)",
        (&id, &year, &name),
    )
    .map_err(|e| map_insert_err(e, "semester"))?;
    info!(by = %caller.username, year = %year, semester = %name, "semester created");
    Ok(json!({ "semesterId": id, "year": year, "name": name }))
}

fn subjects_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    actor(state, req)?;
    let conn = db(state)?;
    let semester_id = get_opt_str(&req.params, "semesterId");
    let branch_id = get_opt_str(&req.params, "branchId");
    let mut stmt = conn.prepare(
        "SELECT sub.id, sub.semester_id, sub.branch_id, b.name, sub.code, sub.name, sub.credits
         FROM subjects sub
         JOIN branches b ON b.id = sub.branch_id
         WHERE (?1 IS NULL OR sub.semester_id = ?1)
           AND (?2 IS NULL OR sub.branch_id = ?2)
         ORDER BY b.name, sub.code",
    )?;
    let subjects = stmt
        .query_map((&semester_id, &branch_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "semesterId": r.get::<_, String>(1)?,
                "branchId": r.get::<_, String>(2)?,
                "branchName": r.get::<_, String>(3)?,
                "code": r.get::<_, String>(4)?,
                "name": r.get::<_, String>(5)?,
                "credits": r.get::<_, f64>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_students)?;
    let conn = db(state)?;
    let p = &req.params;
    let semester_id = get_required_str(p, "semesterId")?;
    let branch_id = get_required_str(p, "branchId")?;
    let code = get_required_str(p, "code")?.to_ascii_uppercase();
    let name = get_required_str(p, "name")?;
    let credits = get_opt_f64(p, "credits")?
        .ok_or_else(|| HandlerErr::bad_params("missing credits"))?;
    if !(credits > 0.0) {
        return Err(HandlerErr::bad_params("credits must be greater than 0"));
    }

    let semester_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM semesters WHERE id = ?", [&semester_id], |r| {
            r.get(0)
        })
        .optional()?;
    if semester_exists.is_none() {
        return Err(HandlerErr::not_found("semester not found"));
    }
    let branch_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM branches WHERE id = ?", [&branch_id], |r| {
            r.get(0)
        })
        .optional()?;
    if branch_exists.is_none() {
        return Err(HandlerErr::not_found("branch not found"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, semester_id, branch_id, code, name, credits)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &semester_id, &branch_id, &code, &name, credits),
    )
    .map_err(|e| map_insert_err(e, "subject"))?;
    info!(by = %caller.username, code = %code, credits, "subject created");
    Ok(json!({ "subjectId": id, "code": code, "name": name, "credits": credits }))
}

fn subjects_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_students)?;
    let conn = db(state)?;
    let subject_id = get_required_str(&req.params, "subjectId")?;
    let code: String = conn
        .query_row("SELECT code FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("subject not found"))?;

    let grades = count_refs(
        conn,
        "SELECT COUNT(*) FROM grades WHERE subject_id = ?",
        &subject_id,
    )?;
    let attendance = count_refs(
        conn,
        "SELECT COUNT(*) FROM attendance WHERE subject_id = ?",
        &subject_id,
    )?;
    if grades > 0 || attendance > 0 {
        return Err(HandlerErr::conflict("subject is still in use").with_details(json!({
            "grades": grades,
            "attendance": attendance,
        })));
    }
    conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])?;
    info!(by = %caller.username, code = %code, "subject deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "branches.list" => branches_list(state, req),
        "branches.create" => branches_create(state, req),
        "branches.delete" => branches_delete(state, req),
        "semesters.list" => semesters_list(state, req),
        "semesters.create" => semesters_create(state, req),
        "subjects.list" => subjects_list(state, req),
        "subjects.create" => subjects_create(state, req),
        "subjects.delete" => subjects_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
