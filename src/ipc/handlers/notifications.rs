use crate::auth::Role;
use crate::ipc::helpers::{db, get_opt_str, page_limit, require_admin, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::mailer::{self, LogMailer, STATUS_FAILED, STATUS_PENDING, STATUS_SENT};
use chrono::Utc;
use serde_json::json;
use tracing::info;

fn notifications_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state, req, Role::can_manage_admins)?;
    let conn = db(state)?;
    let status = get_opt_str(&req.params, "status").map(|s| s.to_ascii_lowercase());
    if let Some(s) = &status {
        if ![STATUS_PENDING, STATUS_SENT, STATUS_FAILED].contains(&s.as_str()) {
            return Err(HandlerErr::bad_params(
                "status must be pending, sent or failed",
            ));
        }
    }
    let limit = page_limit(&req.params, 100, 1000)?;

    let mut stmt = conn.prepare(
        "SELECT id, recipient, subject, body, status, attempts, last_error, created_at, sent_at
         FROM notifications
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY created_at DESC, id
         LIMIT ?2",
    )?;
    let notifications = stmt
        .query_map((&status, limit), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "recipient": r.get::<_, String>(1)?,
                "subject": r.get::<_, String>(2)?,
                "body": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "attempts": r.get::<_, i64>(5)?,
                "lastError": r.get::<_, Option<String>>(6)?,
                "createdAt": r.get::<_, String>(7)?,
                "sentAt": r.get::<_, Option<String>>(8)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "notifications": notifications }))
}

fn notifications_dispatch(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = require_admin(state, req, Role::can_manage_admins)?;
    let conn = db(state)?;
    let limit = page_limit(&req.params, 50, 500)?;
    let relay = LogMailer {
        from: state.settings.mail_from.clone(),
    };
    let summary = mailer::dispatch_pending(conn, &relay, limit as usize, Utc::now())?;
    info!(
        by = %caller.username,
        sent = summary.sent,
        retrying = summary.retrying,
        failed = summary.failed,
        "outbox dispatched"
    );
    Ok(json!({
        "sent": summary.sent,
        "retrying": summary.retrying,
        "failed": summary.failed,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notifications.list" => notifications_list(state, req),
        "notifications.dispatch" => notifications_dispatch(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
