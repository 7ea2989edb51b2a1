use crate::auth::{Actor, Role};
use crate::ipc::helpers::{
    actor, any_admin, db, get_opt_str, get_required_str, page_limit, require_admin,
    require_student, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::mailer;
use crate::workflow::{
    self, format_ts, parse_ts, RequestFlags, RequestKind, RequestStatus, Window,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

/// Columns read for every request row, in `RequestRow::from_row` order.
fn select_columns(kind: RequestKind) -> String {
    let (from_col, to_col) = kind.window_columns();
    format!(
        "r.id, r.student_id, st.username, st.name, st.email, r.reason, r.{from_col}, r.{to_col},
         r.ends_at, r.requested_time, r.is_approved, r.is_rejected, r.is_expired,
         r.issued_by, r.issued_time, r.rejected_by, r.rejected_time, r.message,
         r.out_time, r.in_time"
    )
}

#[derive(Debug, Clone)]
struct RequestRow {
    kind: RequestKind,
    id: String,
    student_id: String,
    username: String,
    student_name: String,
    email: String,
    reason: String,
    from: String,
    to: String,
    ends_at: String,
    requested_time: String,
    flags: RequestFlags,
    issued_by: Option<String>,
    issued_time: Option<String>,
    rejected_by: Option<String>,
    rejected_time: Option<String>,
    message: Option<String>,
    out_time: Option<String>,
    in_time: Option<String>,
}

impl RequestRow {
    fn from_row(kind: RequestKind, r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            kind,
            id: r.get(0)?,
            student_id: r.get(1)?,
            username: r.get(2)?,
            student_name: r.get(3)?,
            email: r.get(4)?,
            reason: r.get(5)?,
            from: r.get(6)?,
            to: r.get(7)?,
            ends_at: r.get(8)?,
            requested_time: r.get(9)?,
            flags: RequestFlags {
                approved: r.get::<_, i64>(10)? != 0,
                rejected: r.get::<_, i64>(11)? != 0,
                expired: r.get::<_, i64>(12)? != 0,
            },
            issued_by: r.get(13)?,
            issued_time: r.get(14)?,
            rejected_by: r.get(15)?,
            rejected_time: r.get(16)?,
            message: r.get(17)?,
            out_time: r.get(18)?,
            in_time: r.get(19)?,
        })
    }

    fn to_json(&self) -> serde_json::Value {
        let (from_key, to_key) = match self.kind {
            RequestKind::Outing => ("fromTime", "toTime"),
            RequestKind::Outpass => ("fromDay", "toDay"),
        };
        let mut v = json!({
            "kind": self.kind.as_str(),
            "id": self.id,
            "studentId": self.student_id,
            "username": self.username,
            "studentName": self.student_name,
            "reason": self.reason,
            "endsAt": self.ends_at,
            "requestedTime": self.requested_time,
            "status": self.flags.status().as_str(),
            "isApproved": self.flags.approved,
            "isRejected": self.flags.rejected,
            "isExpired": self.flags.expired,
            "issuedBy": self.issued_by,
            "issuedTime": self.issued_time,
            "rejectedBy": self.rejected_by,
            "rejectedTime": self.rejected_time,
            "message": self.message,
            "outTime": self.out_time,
            "inTime": self.in_time,
        });
        v[from_key] = json!(self.from);
        v[to_key] = json!(self.to);
        v
    }

    /// Still holding the student: pending, or approved and not yet returned.
    /// A pass nobody used stops counting once its window closes, even before the sweep.
    fn is_open(&self, now: DateTime<Utc>) -> bool {
        let window_open = parse_ts(&self.ends_at).map(|e| e > now).unwrap_or(false);
        match self.flags.status() {
            RequestStatus::Pending => window_open,
            RequestStatus::Approved => {
                self.in_time.is_none() && (self.out_time.is_some() || window_open)
            }
            _ => false,
        }
    }
}

fn load_request(
    conn: &Connection,
    kind: RequestKind,
    id: &str,
) -> Result<Option<RequestRow>, HandlerErr> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {}
                 FROM {} r
                 JOIN students st ON st.id = r.student_id
                 WHERE r.id = ?",
                select_columns(kind),
                kind.table()
            ),
            [id],
            |r| RequestRow::from_row(kind, r),
        )
        .optional()?)
}

fn list_requests(
    conn: &Connection,
    kind: RequestKind,
    where_sql: &str,
    binds: &[&dyn rusqlite::ToSql],
    limit: i64,
) -> Result<Vec<RequestRow>, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {}
         FROM {} r
         JOIN students st ON st.id = r.student_id
         WHERE {}
         ORDER BY r.requested_time DESC, r.id
         LIMIT {}",
        select_columns(kind),
        kind.table(),
        where_sql,
        limit
    ))?;
    let rows = stmt
        .query_map(binds, |r| RequestRow::from_row(kind, r))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The request currently holding a student, across both kinds.
pub fn open_request_for(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    for kind in RequestKind::ALL {
        let rows = list_requests(
            conn,
            kind,
            "r.student_id = ? AND r.is_rejected = 0 AND r.is_expired = 0 AND r.in_time IS NULL",
            &[&student_id],
            10,
        )?;
        if let Some(open) = rows.into_iter().find(|r| r.is_open(Utc::now())) {
            return Ok(Some(open.to_json()));
        }
    }
    Ok(None)
}

/// The checked-out, not yet returned request a student left campus on, expired or not.
pub fn departure_for(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    let mut latest: Option<RequestRow> = None;
    for kind in RequestKind::ALL {
        let rows = list_requests(
            conn,
            kind,
            "r.student_id = ? AND r.out_time IS NOT NULL AND r.in_time IS NULL",
            &[&student_id],
            1,
        )?;
        for row in rows {
            if latest.as_ref().map_or(true, |l| row.out_time > l.out_time) {
                latest = Some(row);
            }
        }
    }
    Ok(latest.map(|r| r.to_json()))
}

fn parse_kind(params: &serde_json::Value) -> Result<RequestKind, HandlerErr> {
    let raw = get_required_str(params, "kind")?;
    RequestKind::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params("kind must be outing or outpass"))
}

fn create_request(
    state: &AppState,
    req: &Request,
    kind: RequestKind,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_student(state, req)?;
    let conn = db(state)?;
    let p = &req.params;
    let reason = get_required_str(p, "reason")?;
    let offset = state.settings.campus_offset;
    let window: Window = match kind {
        RequestKind::Outing => workflow::outing_window(
            &get_required_str(p, "fromTime")?,
            &get_required_str(p, "toTime")?,
            offset,
        ),
        RequestKind::Outpass => workflow::outpass_window(
            &get_required_str(p, "fromDay")?,
            &get_required_str(p, "toDay")?,
            offset,
        ),
    }
    .map_err(|e| HandlerErr::bad_params(e.to_string()))?;

    let in_campus: i64 = conn.query_row(
        "SELECT is_in_campus FROM students WHERE id = ?",
        [&caller.id],
        |r| r.get(0),
    )?;
    if in_campus == 0 {
        return Err(HandlerErr::conflict("student is currently out of campus"));
    }
    if let Some(open) = open_request_for(conn, &caller.id)? {
        return Err(
            HandlerErr::conflict("another request is still open").with_details(json!({
                "kind": open["kind"],
                "id": open["id"],
                "status": open["status"],
            })),
        );
    }

    let id = Uuid::new_v4().to_string();
    let (from_col, to_col) = kind.window_columns();
    conn.execute(
        &format!(
            "INSERT INTO {}(id, student_id, reason, {from_col}, {to_col}, ends_at, requested_time)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            kind.table()
        ),
        (
            &id,
            &caller.id,
            &reason,
            &window.from,
            &window.to,
            &window.ends_at,
            format_ts(Utc::now()),
        ),
    )?;
    info!(
        student = %caller.username,
        kind = kind.as_str(),
        id = %id,
        ends_at = %window.ends_at,
        "request submitted"
    );

    let row = load_request(conn, kind, &id)?
        .ok_or_else(|| HandlerErr::internal("inserted request vanished"))?;
    Ok(json!({ "request": row.to_json() }))
}

fn requests_mine(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_student(state, req)?;
    let conn = db(state)?;
    let kinds: Vec<RequestKind> = match get_opt_str(&req.params, "kind") {
        Some(k) => vec![RequestKind::parse(&k)
            .ok_or_else(|| HandlerErr::bad_params("kind must be outing or outpass"))?],
        None => RequestKind::ALL.to_vec(),
    };
    let limit = page_limit(&req.params, 100, 500)?;

    let mut rows = Vec::new();
    for kind in kinds {
        rows.extend(list_requests(conn, kind, "r.student_id = ?", &[&caller.id], limit)?);
    }
    rows.sort_by(|a, b| b.requested_time.cmp(&a.requested_time));
    rows.truncate(limit as usize);
    Ok(json!({
        "requests": rows.iter().map(RequestRow::to_json).collect::<Vec<_>>()
    }))
}

fn requests_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state, req, any_admin)?;
    let conn = db(state)?;
    let kind = parse_kind(&req.params)?;
    let status = get_opt_str(&req.params, "status").unwrap_or_else(|| "pending".to_string());
    let now_s = format_ts(Utc::now());
    let (predicate, binds): (String, Vec<&dyn rusqlite::ToSql>) =
        if status.eq_ignore_ascii_case("all") {
            ("1 = 1".to_string(), Vec::new())
        } else {
            let s = RequestStatus::parse(&status).ok_or_else(|| {
                HandlerErr::bad_params("status must be pending, approved, rejected, expired or all")
            })?;
            match s {
                // A closed window is dead even before the sweep marks it.
                RequestStatus::Pending => (
                    format!("{} AND r.ends_at > ?", s.sql_predicate("r")),
                    vec![&now_s as &dyn rusqlite::ToSql],
                ),
                _ => (s.sql_predicate("r"), Vec::new()),
            }
        };
    let limit = page_limit(&req.params, 100, 1000)?;
    let rows = list_requests(conn, kind, &predicate, &binds, limit)?;
    Ok(json!({
        "kind": kind.as_str(),
        "status": status.to_ascii_lowercase(),
        "requests": rows.iter().map(RequestRow::to_json).collect::<Vec<_>>()
    }))
}

fn requests_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = actor(state, req)?;
    let conn = db(state)?;
    let kind = parse_kind(&req.params)?;
    let id = get_required_str(&req.params, "id")?;
    let row = load_request(conn, kind, &id)?
        .ok_or_else(|| HandlerErr::not_found("request not found"))?;
    if let Actor::Student { id: sid, .. } = &caller {
        if *sid != row.student_id {
            // Do not reveal other students' requests.
            return Err(HandlerErr::not_found("request not found"));
        }
    }
    Ok(json!({ "request": row.to_json() }))
}

enum Decision {
    Approve,
    Reject,
}

fn window_closed(row: &RequestRow, now: DateTime<Utc>) -> Result<bool, HandlerErr> {
    let ends_at = parse_ts(&row.ends_at)
        .ok_or_else(|| HandlerErr::internal(format!("stored endsAt is invalid: {}", row.ends_at)))?;
    Ok(ends_at <= now)
}

/// Expires a request the sweep has not reached yet, queues the notice and
/// commits. Returns the conflict the caller answers with.
fn expire_closed(
    tx: Transaction<'_>,
    row: &RequestRow,
    now: DateTime<Utc>,
    during: &str,
) -> Result<HandlerErr, HandlerErr> {
    tx.execute(
        &format!("UPDATE {} SET is_expired = 1 WHERE id = ?", row.kind.table()),
        [&row.id],
    )?;
    let notice = mailer::expired_notice(row.kind, &row.student_name, &row.from, &row.to);
    mailer::enqueue(&tx, &row.email, &notice.subject, &notice.body, now)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    info!(kind = row.kind.as_str(), id = %row.id, "request expired before {}", during);
    Ok(HandlerErr::conflict("request has expired").with_details(json!({
        "reason": "request_expired",
        "status": RequestStatus::Expired.as_str(),
    })))
}

fn decide(
    state: &AppState,
    req: &Request,
    decision: Decision,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_decide_requests)?;
    let conn = db(state)?;
    let kind = parse_kind(&req.params)?;
    let id = get_required_str(&req.params, "id")?;
    let message = get_opt_str(&req.params, "message");
    let now = Utc::now();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let row = load_request(&tx, kind, &id)?
        .ok_or_else(|| HandlerErr::not_found("request not found"))?;

    if let Some(current) = row.flags.decision_blocker() {
        return Err(HandlerErr::conflict(format!(
            "request is already {}",
            current.as_str()
        ))
        .with_details(json!({ "status": current.as_str() })));
    }
    if window_closed(&row, now)? {
        return Err(expire_closed(tx, &row, now, "a decision")?);
    }

    let now_s = format_ts(now);
    let (sql, notice, verb) = match decision {
        Decision::Approve => (
            "SET is_approved = 1, issued_by = ?, issued_time = ?, message = ?",
            mailer::approved_notice(
                kind,
                &row.student_name,
                &row.from,
                &row.to,
                &caller.username,
                message.as_deref(),
            ),
            "approved",
        ),
        Decision::Reject => (
            "SET is_rejected = 1, rejected_by = ?, rejected_time = ?, message = ?",
            mailer::rejected_notice(
                kind,
                &row.student_name,
                &row.from,
                &row.to,
                &caller.username,
                message.as_deref(),
            ),
            "rejected",
        ),
    };
    tx.execute(
        &format!("UPDATE {} {} WHERE id = ?", kind.table(), sql),
        (&caller.username, &now_s, &message, &id),
    )?;
    mailer::enqueue(&tx, &row.email, &notice.subject, &notice.body, now)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    info!(
        by = %caller.username,
        role = caller.role.as_str(),
        kind = kind.as_str(),
        id = %id,
        student = %row.username,
        "request {}", verb
    );
    let row = load_request(conn, kind, &id)?
        .ok_or_else(|| HandlerErr::internal("decided request vanished"))?;
    Ok(json!({ "request": row.to_json() }))
}

fn check_out(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_operate_gate)?;
    let conn = db(state)?;
    let kind = parse_kind(&req.params)?;
    let id = get_required_str(&req.params, "id")?;
    let now = Utc::now();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let row = load_request(&tx, kind, &id)?
        .ok_or_else(|| HandlerErr::not_found("request not found"))?;
    let status = row.flags.status();
    if status != RequestStatus::Approved {
        return Err(HandlerErr::conflict(format!(
            "only approved requests can check out (request is {})",
            status.as_str()
        ))
        .with_details(json!({ "status": status.as_str() })));
    }
    if row.out_time.is_some() {
        return Err(HandlerErr::conflict("student already checked out on this request"));
    }
    if window_closed(&row, now)? {
        return Err(expire_closed(tx, &row, now, "check-out")?);
    }
    let in_campus: i64 = tx.query_row(
        "SELECT is_in_campus FROM students WHERE id = ?",
        [&row.student_id],
        |r| r.get(0),
    )?;
    if in_campus == 0 {
        return Err(HandlerErr::conflict("student is already out of campus"));
    }

    let now_s = format_ts(now);
    tx.execute(
        &format!("UPDATE {} SET out_time = ? WHERE id = ?", kind.table()),
        (&now_s, &id),
    )?;
    tx.execute(
        "UPDATE students SET is_in_campus = 0, updated_at = ? WHERE id = ?",
        (&now_s, &row.student_id),
    )?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    info!(by = %caller.username, student = %row.username, kind = kind.as_str(), "checked out");
    let row = load_request(conn, kind, &id)?
        .ok_or_else(|| HandlerErr::internal("request vanished"))?;
    Ok(json!({ "request": row.to_json() }))
}

fn check_in(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_operate_gate)?;
    let conn = db(state)?;
    let kind = parse_kind(&req.params)?;
    let id = get_required_str(&req.params, "id")?;
    let now = Utc::now();

    let row = load_request(conn, kind, &id)?
        .ok_or_else(|| HandlerErr::not_found("request not found"))?;
    if row.out_time.is_none() {
        return Err(HandlerErr::conflict("student never checked out on this request"));
    }
    if row.in_time.is_some() {
        return Err(HandlerErr::conflict("student already checked in on this request"));
    }
    let late = parse_ts(&row.ends_at).map(|e| now > e).unwrap_or(false);

    let now_s = format_ts(now);
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        &format!("UPDATE {} SET in_time = ? WHERE id = ?", kind.table()),
        (&now_s, &id),
    )?;
    tx.execute(
        "UPDATE students SET is_in_campus = 1, updated_at = ? WHERE id = ?",
        (&now_s, &row.student_id),
    )?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    info!(
        by = %caller.username,
        student = %row.username,
        kind = kind.as_str(),
        late,
        "checked in"
    );
    let row = load_request(conn, kind, &id)?
        .ok_or_else(|| HandlerErr::internal("request vanished"))?;
    Ok(json!({ "request": row.to_json(), "late": late }))
}

fn sweep(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state, req, Role::can_manage_students)?;
    let conn = db(state)?;
    let now: DateTime<Utc> = match get_opt_str(&req.params, "now") {
        Some(s) => parse_ts(&s)
            .ok_or_else(|| HandlerErr::bad_params("now must be an RFC 3339 timestamp"))?,
        None => Utc::now(),
    };
    let summary = workflow::sweep_expired(conn, now)?;
    Ok(json!({
        "now": format_ts(now),
        "outingsExpired": summary.outings_expired,
        "outpassesExpired": summary.outpasses_expired,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "outings.create" => create_request(state, req, RequestKind::Outing),
        "outpasses.create" => create_request(state, req, RequestKind::Outpass),
        "requests.mine" => requests_mine(state, req),
        "requests.list" => requests_list(state, req),
        "requests.get" => requests_get(state, req),
        "requests.approve" => decide(state, req, Decision::Approve),
        "requests.reject" => decide(state, req, Decision::Reject),
        "requests.checkOut" => check_out(state, req),
        "requests.checkIn" => check_in(state, req),
        "requests.sweepExpired" => sweep(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
