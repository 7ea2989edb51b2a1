use crate::workflow::{format_ts, RequestKind};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{info, warn};
use uuid::Uuid;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_SENT: &str = "sent";
pub const STATUS_FAILED: &str = "failed";

/// Deliveries give up after this many failed attempts.
pub const MAX_ATTEMPTS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct OutboundMail {
    pub id: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Hands a message to whatever relay the deployment uses.
pub trait Mailer {
    fn deliver(&self, mail: &OutboundMail) -> anyhow::Result<()>;
}

/// Writes messages to the log instead of a mail relay.
pub struct LogMailer {
    pub from: String,
}

impl Mailer for LogMailer {
    fn deliver(&self, mail: &OutboundMail) -> anyhow::Result<()> {
        if !mail.recipient.contains('@') {
            anyhow::bail!("recipient is not an email address: {}", mail.recipient);
        }
        info!(
            id = %mail.id,
            from = %self.from,
            to = %mail.recipient,
            subject = %mail.subject,
            "mail delivered"
        );
        Ok(())
    }
}

fn window_text(kind: RequestKind, from: &str, to: &str) -> String {
    match kind {
        RequestKind::Outing => format!("from {} to {}", from, to),
        RequestKind::Outpass => format!("from {} through {}", from, to),
    }
}

pub fn approved_notice(
    kind: RequestKind,
    student_name: &str,
    from: &str,
    to: &str,
    approver: &str,
    message: Option<&str>,
) -> Notice {
    let mut body = format!(
        "Hello {},\n\nYour {} request {} has been approved by {}.",
        student_name,
        kind.as_str(),
        window_text(kind, from, to),
        approver
    );
    if let Some(m) = message.filter(|m| !m.trim().is_empty()) {
        body.push_str(&format!("\n\nNote: {}", m.trim()));
    }
    body.push_str("\n\nPlease return to campus before the pass ends.");
    Notice {
        subject: format!("Your {} has been approved", kind.as_str()),
        body,
    }
}

pub fn rejected_notice(
    kind: RequestKind,
    student_name: &str,
    from: &str,
    to: &str,
    rejecter: &str,
    message: Option<&str>,
) -> Notice {
    let mut body = format!(
        "Hello {},\n\nYour {} request {} was rejected by {}.",
        student_name,
        kind.as_str(),
        window_text(kind, from, to),
        rejecter
    );
    if let Some(m) = message.filter(|m| !m.trim().is_empty()) {
        body.push_str(&format!("\n\nReason: {}", m.trim()));
    }
    Notice {
        subject: format!("Your {} was rejected", kind.as_str()),
        body,
    }
}

pub fn expired_notice(kind: RequestKind, student_name: &str, from: &str, to: &str) -> Notice {
    Notice {
        subject: format!("Your {} has expired", kind.as_str()),
        body: format!(
            "Hello {},\n\nYour {} {} has expired.",
            student_name,
            kind.as_str(),
            window_text(kind, from, to)
        ),
    }
}

pub fn enqueue(
    conn: &Connection,
    recipient: &str,
    subject: &str,
    body: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notifications(id, recipient, subject, body, status, attempts, created_at)
         VALUES(?, ?, ?, ?, ?, 0, ?)",
        (&id, recipient, subject, body, STATUS_PENDING, format_ts(now)),
    )?;
    Ok(id)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sent: usize,
    pub retrying: usize,
    pub failed: usize,
}

/// Drains up to `limit` pending messages, oldest first.
pub fn dispatch_pending(
    conn: &Connection,
    mailer: &dyn Mailer,
    limit: usize,
    now: DateTime<Utc>,
) -> anyhow::Result<DispatchSummary> {
    let batch = {
        let mut stmt = conn.prepare(
            "SELECT id, recipient, subject, body, attempts
             FROM notifications
             WHERE status = ?
             ORDER BY created_at, id
             LIMIT ?",
        )?;
        let rows = stmt
            .query_map((STATUS_PENDING, limit as i64), |r| {
                Ok((
                    OutboundMail {
                        id: r.get(0)?,
                        recipient: r.get(1)?,
                        subject: r.get(2)?,
                        body: r.get(3)?,
                    },
                    r.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut summary = DispatchSummary::default();
    for (mail, attempts) in batch {
        match mailer.deliver(&mail) {
            Ok(()) => {
                conn.execute(
                    "UPDATE notifications
                     SET status = ?, attempts = attempts + 1, sent_at = ?, last_error = NULL
                     WHERE id = ?",
                    (STATUS_SENT, format_ts(now), &mail.id),
                )?;
                summary.sent += 1;
            }
            Err(e) => {
                let attempts = attempts + 1;
                let status = if attempts >= MAX_ATTEMPTS {
                    summary.failed += 1;
                    STATUS_FAILED
                } else {
                    summary.retrying += 1;
                    STATUS_PENDING
                };
                warn!(id = %mail.id, attempts, error = %e, "mail delivery failed");
                conn.execute(
                    "UPDATE notifications SET status = ?, attempts = ?, last_error = ? WHERE id = ?",
                    (status, attempts, e.to_string(), &mail.id),
                )?;
            }
        }
    }
    Ok(summary)
}
