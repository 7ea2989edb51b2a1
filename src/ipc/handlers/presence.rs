use crate::ipc::handlers::requests::departure_for;
use crate::ipc::helpers::{any_admin, db, page_limit, require_admin, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::workflow::{format_ts, RequestKind, RequestStatus};
use chrono::Utc;
use serde_json::json;

fn presence_summary(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state, req, any_admin)?;
    let conn = db(state)?;
    let (in_campus, out_of_campus): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(is_in_campus = 1), 0), COALESCE(SUM(is_in_campus = 0), 0)
         FROM students",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    // Pending rows whose window closed are left for the sweep and not counted.
    let now_s = format_ts(Utc::now());
    let mut pending = [0i64; 2];
    for (slot, kind) in pending.iter_mut().zip(RequestKind::ALL) {
        *slot = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} r WHERE {} AND r.ends_at > ?",
                kind.table(),
                RequestStatus::Pending.sql_predicate("r")
            ),
            [&now_s],
            |r| r.get(0),
        )?;
    }

    Ok(json!({
        "inCampus": in_campus,
        "outOfCampus": out_of_campus,
        "pendingOutings": pending[0],
        "pendingOutpasses": pending[1],
    }))
}

fn presence_outside(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state, req, any_admin)?;
    let conn = db(state)?;
    let limit = page_limit(&req.params, 200, 1000)?;
    let students: Vec<(String, String, String, Option<String>)> = {
        let mut stmt = conn.prepare(
            "SELECT s.id, s.username, s.name, b.name
             FROM students s
             LEFT JOIN branches b ON b.id = s.branch_id
             WHERE s.is_in_campus = 0
             ORDER BY s.username
             LIMIT ?",
        )?;
        let rows = stmt
            .query_map([limit], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut out = Vec::with_capacity(students.len());
    for (id, username, name, branch) in students {
        out.push(json!({
            "id": id,
            "username": username,
            "name": name,
            "branchName": branch,
            "request": departure_for(conn, &id)?,
        }));
    }
    Ok(json!({ "students": out }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "presence.summary" => presence_summary(state, req),
        "presence.outside" => presence_outside(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
