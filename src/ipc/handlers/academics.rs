use crate::auth::Role;
use crate::grading::{self, Grade};
use crate::ipc::helpers::{
    any_admin, db, get_opt_bool, get_opt_str, get_required_str, read_sheet_text,
    require_admin, resolve_student_target, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::sheets::{self, csv_quote, warning};
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

fn require_semester(conn: &Connection, semester_id: &str) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM semesters WHERE id = ?", [semester_id], |r| {
            r.get(0)
        })
        .optional()?;
    if found.is_none() {
        return Err(HandlerErr::not_found("semester not found"));
    }
    Ok(())
}

/// Resolves sheet rows to (student id, subject id) within one semester.
/// Subjects are per branch, so the student's branch picks the subject code's owner.
struct SheetKeys<'a> {
    tx: &'a Connection,
    semester_id: &'a str,
    students: HashMap<String, Option<(String, Option<String>)>>,
}

impl<'a> SheetKeys<'a> {
    fn new(tx: &'a Connection, semester_id: &'a str) -> Self {
        Self {
            tx,
            semester_id,
            students: HashMap::new(),
        }
    }

    fn resolve(
        &mut self,
        line_no: usize,
        username: &str,
        subject_code: &str,
    ) -> Result<Result<(String, String), serde_json::Value>, HandlerErr> {
        if !self.students.contains_key(username) {
            let found: Option<(String, Option<String>)> = self
                .tx
                .query_row(
                    "SELECT id, branch_id FROM students WHERE username = ?",
                    [username],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            self.students.insert(username.to_string(), found);
        }
        let Some(Some((student_id, branch_id))) = self.students.get(username).cloned() else {
            return Ok(Err(warning(
                line_no,
                "unknown_student",
                format!("student '{}' does not exist", username),
            )));
        };
        let Some(branch_id) = branch_id else {
            return Ok(Err(warning(
                line_no,
                "no_branch",
                format!("student '{}' has no branch", username),
            )));
        };
        let subject_id: Option<String> = self
            .tx
            .query_row(
                "SELECT id FROM subjects WHERE semester_id = ? AND branch_id = ? AND code = ?",
                (self.semester_id, &branch_id, subject_code.to_ascii_uppercase()),
                |r| r.get(0),
            )
            .optional()?;
        let Some(subject_id) = subject_id else {
            return Ok(Err(warning(
                line_no,
                "unknown_subject",
                format!(
                    "subject '{}' is not offered to {} this semester",
                    subject_code, username
                ),
            )));
        };
        Ok(Ok((student_id, subject_id)))
    }
}

/// Returns true when the row was inserted, false when an existing row was replaced.
fn upsert_mark(
    tx: &Transaction<'_>,
    table: &str,
    columns: &[&str],
    keys: (&str, &str, &str),
    values: &[&dyn rusqlite::ToSql],
) -> Result<bool, HandlerErr> {
    let (student_id, subject_id, semester_id) = keys;
    let existing: Option<String> = tx
        .query_row(
            &format!(
                "SELECT id FROM {} WHERE student_id = ? AND subject_id = ? AND semester_id = ?",
                table
            ),
            (student_id, subject_id, semester_id),
            |r| r.get(0),
        )
        .optional()?;
    match existing {
        Some(id) => {
            let set_sql = columns
                .iter()
                .map(|c| format!("{} = ?", c))
                .collect::<Vec<_>>()
                .join(", ");
            let mut binds: Vec<&dyn rusqlite::ToSql> = values.to_vec();
            binds.push(&id);
            tx.execute(
                &format!("UPDATE {} SET {} WHERE id = ?", table, set_sql),
                binds.as_slice(),
            )?;
            Ok(false)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            let placeholders = vec!["?"; columns.len()].join(", ");
            let mut binds: Vec<&dyn rusqlite::ToSql> =
                vec![&id, &student_id, &subject_id, &semester_id];
            binds.extend_from_slice(values);
            tx.execute(
                &format!(
                    "INSERT INTO {}(id, student_id, subject_id, semester_id, {}) VALUES(?, ?, ?, ?, {})",
                    table,
                    columns.join(", "),
                    placeholders
                ),
                binds.as_slice(),
            )?;
            Ok(true)
        }
    }
}

fn finish_sheet(tx: Transaction<'_>, dry_run: bool) -> Result<(), HandlerErr> {
    if dry_run {
        let _ = tx.rollback();
        Ok(())
    } else {
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))
    }
}

fn grades_upload(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_students)?;
    let conn = db(state)?;
    let p = &req.params;
    let semester_id = get_required_str(p, "semesterId")?;
    let dry_run = get_opt_bool(p, "dryRun")?.unwrap_or(false);
    let text = read_sheet_text(p)?;
    require_semester(conn, &semester_id)?;

    let parsed = sheets::parse_grade_rows(&text);
    // Records the parser dropped count as skipped too.
    let rejected = parsed.rejected();
    let mut warnings = parsed.warnings;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let (mut inserted, mut updated, mut skipped) = (0usize, 0usize, rejected);
    {
        let mut keys = SheetKeys::new(&tx, &semester_id);
        for row in &parsed.rows {
            let Some(grade) = Grade::parse(&row.grade) else {
                skipped += 1;
                warnings.push(warning(
                    row.line_no,
                    "bad_grade",
                    format!("unknown grade '{}'", row.grade),
                ));
                continue;
            };
            let (student_id, subject_id) =
                match keys.resolve(row.line_no, &row.username, &row.subject_code)? {
                    Ok(ids) => ids,
                    Err(w) => {
                        skipped += 1;
                        warnings.push(w);
                        continue;
                    }
                };
            let grade_s = grade.as_str();
            if upsert_mark(
                &tx,
                "grades",
                &["grade"],
                (student_id.as_str(), subject_id.as_str(), semester_id.as_str()),
                &[&grade_s],
            )? {
                inserted += 1;
            } else {
                updated += 1;
            }
        }
    }
    finish_sheet(tx, dry_run)?;
    if !dry_run {
        info!(by = %caller.username, semester = %semester_id, inserted, updated, skipped, "grade sheet applied");
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

fn grades_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = resolve_student_target(state, req)?;
    let conn = db(state)?;
    let semester_id = get_required_str(&req.params, "semesterId")?;
    require_semester(conn, &semester_id)?;

    let rows: Vec<(String, String, f64, String)> = {
        let mut stmt = conn.prepare(
            "SELECT sub.code, sub.name, sub.credits, g.grade
             FROM grades g
             JOIN subjects sub ON sub.id = g.subject_id
             WHERE g.student_id = ? AND g.semester_id = ?
             ORDER BY sub.code",
        )?;
        let rows = stmt
            .query_map((&student_id, &semester_id), |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut subjects = Vec::with_capacity(rows.len());
    let mut graded = Vec::with_capacity(rows.len());
    for (code, name, credits, grade_s) in rows {
        let grade = Grade::parse(&grade_s);
        if grade.is_none() {
            warn!(code = %code, grade = %grade_s, "stored grade is not on the scale");
        }
        if let Some(g) = grade {
            graded.push((g, credits));
        }
        subjects.push(json!({
            "code": code,
            "name": name,
            "credits": credits,
            "grade": grade_s,
            "points": grade.map(Grade::points),
        }));
    }
    let summary = grading::semester_summary(graded);
    Ok(json!({
        "semesterId": semester_id,
        "subjects": subjects,
        "sgpa": summary.sgpa,
        "creditsAttempted": summary.credits_attempted,
        "creditsEarned": summary.credits_earned,
        "hasBacklog": summary.has_backlog,
    }))
}

fn grades_export(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state, req, any_admin)?;
    let conn = db(state)?;
    let semester_id = get_required_str(&req.params, "semesterId")?;
    let branch_id = get_opt_str(&req.params, "branchId");
    require_semester(conn, &semester_id)?;

    let mut stmt = conn.prepare(
        "SELECT s.username, s.name, sub.code, g.grade
         FROM grades g
         JOIN students s ON s.id = g.student_id
         JOIN subjects sub ON sub.id = g.subject_id
         WHERE g.semester_id = ?1 AND (?2 IS NULL OR sub.branch_id = ?2)
         ORDER BY s.username, sub.code",
    )?;
    let rows = stmt
        .query_map((&semester_id, &branch_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut csv = String::from("username,name,subject_code,grade,points\n");
    for (username, name, code, grade) in &rows {
        let points = Grade::parse(grade)
            .map(|g| g.points().to_string())
            .unwrap_or_default();
        csv.push_str(&format!(
            "{},{},{},{},{}\n",
            csv_quote(username),
            csv_quote(name),
            csv_quote(code),
            csv_quote(grade),
            points
        ));
    }
    Ok(json!({ "rowsExported": rows.len(), "csv": csv }))
}

fn attendance_upload(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_students)?;
    let conn = db(state)?;
    let p = &req.params;
    let semester_id = get_required_str(p, "semesterId")?;
    let dry_run = get_opt_bool(p, "dryRun")?.unwrap_or(false);
    let text = read_sheet_text(p)?;
    require_semester(conn, &semester_id)?;

    let parsed = sheets::parse_attendance_rows(&text);
    // Records the parser dropped count as skipped too.
    let rejected = parsed.rejected();
    let mut warnings = parsed.warnings;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let (mut inserted, mut updated, mut skipped) = (0usize, 0usize, rejected);
    {
        let mut keys = SheetKeys::new(&tx, &semester_id);
        for row in &parsed.rows {
            let (student_id, subject_id) =
                match keys.resolve(row.line_no, &row.username, &row.subject_code)? {
                    Ok(ids) => ids,
                    Err(w) => {
                        skipped += 1;
                        warnings.push(w);
                        continue;
                    }
                };
            if upsert_mark(
                &tx,
                "attendance",
                &["total_classes", "attended_classes"],
                (student_id.as_str(), subject_id.as_str(), semester_id.as_str()),
                &[&row.total_classes, &row.attended_classes],
            )? {
                inserted += 1;
            } else {
                updated += 1;
            }
        }
    }
    finish_sheet(tx, dry_run)?;
    if !dry_run {
        info!(by = %caller.username, semester = %semester_id, inserted, updated, skipped, "attendance sheet applied");
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

fn attendance_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = resolve_student_target(state, req)?;
    let conn = db(state)?;
    let semester_id = get_required_str(&req.params, "semesterId")?;
    require_semester(conn, &semester_id)?;

    let mut stmt = conn.prepare(
        "SELECT sub.code, sub.name, a.total_classes, a.attended_classes
         FROM attendance a
         JOIN subjects sub ON sub.id = a.subject_id
         WHERE a.student_id = ? AND a.semester_id = ?
         ORDER BY sub.code",
    )?;
    let rows = stmt
        .query_map((&student_id, &semester_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let (mut total_sum, mut attended_sum) = (0i64, 0i64);
    let mut shortage = false;
    let mut subjects = Vec::with_capacity(rows.len());
    for (code, name, total, attended) in rows {
        total_sum += total;
        attended_sum += attended;
        let short = grading::is_shortage(attended, total);
        shortage |= short;
        subjects.push(json!({
            "code": code,
            "name": name,
            "totalClasses": total,
            "attendedClasses": attended,
            "percentage": grading::attendance_percent(attended, total),
            "shortage": short,
        }));
    }
    Ok(json!({
        "semesterId": semester_id,
        "subjects": subjects,
        "totalClasses": total_sum,
        "attendedClasses": attended_sum,
        "overallPercentage": grading::attendance_percent(attended_sum, total_sum),
        "shortage": shortage,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.upload" => grades_upload(state, req),
        "grades.get" => grades_get(state, req),
        "grades.export" => grades_export(state, req),
        "attendance.upload" => attendance_upload(state, req),
        "attendance.get" => attendance_get(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
