use crate::mailer;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Outing,
    Outpass,
}

impl RequestKind {
    pub const ALL: [RequestKind; 2] = [RequestKind::Outing, RequestKind::Outpass];

    pub fn parse(s: &str) -> Option<RequestKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "outing" | "outings" => Some(RequestKind::Outing),
            "outpass" | "outpasses" => Some(RequestKind::Outpass),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Outing => "outing",
            RequestKind::Outpass => "outpass",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            RequestKind::Outing => "outings",
            RequestKind::Outpass => "outpasses",
        }
    }

    /// Columns holding the requested window, as (start, end).
    pub fn window_columns(self) -> (&'static str, &'static str) {
        match self {
            RequestKind::Outing => ("from_time", "to_time"),
            RequestKind::Outpass => ("from_day", "to_day"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Expired => "expired",
        }
    }

    /// SQL predicate over the flag columns of table alias `t` selecting rows in this status.
    pub fn sql_predicate(self, t: &str) -> String {
        match self {
            RequestStatus::Pending => format!(
                "{t}.is_approved = 0 AND {t}.is_rejected = 0 AND {t}.is_expired = 0"
            ),
            RequestStatus::Approved => format!("{t}.is_approved = 1 AND {t}.is_expired = 0"),
            RequestStatus::Rejected => format!("{t}.is_rejected = 1 AND {t}.is_expired = 0"),
            RequestStatus::Expired => format!("{t}.is_expired = 1"),
        }
    }

    pub fn parse(s: &str) -> Option<RequestStatus> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(RequestStatus::Pending),
            "approved" => Some(RequestStatus::Approved),
            "rejected" => Some(RequestStatus::Rejected),
            "expired" => Some(RequestStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    pub approved: bool,
    pub rejected: bool,
    pub expired: bool,
}

impl RequestFlags {
    pub fn status(self) -> RequestStatus {
        if self.expired {
            RequestStatus::Expired
        } else if self.rejected {
            RequestStatus::Rejected
        } else if self.approved {
            RequestStatus::Approved
        } else {
            RequestStatus::Pending
        }
    }

    /// A request can be approved or rejected only while it is still pending.
    pub fn decision_blocker(self) -> Option<RequestStatus> {
        match self.status() {
            RequestStatus::Pending => None,
            other => Some(other),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WindowError {
    #[error("{0} must be an RFC 3339 timestamp")]
    BadTimestamp(&'static str),

    #[error("{0} must be a YYYY-MM-DD date")]
    BadDate(&'static str),

    #[error("toTime must be after fromTime")]
    OutingNotForward,

    #[error("an outing must start and end on the same day")]
    OutingSpansDays,

    #[error("toDay must not be before fromDay")]
    OutpassNotForward,
}

/// Normalized window of a new request, ready to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub from: String,
    pub to: String,
    pub ends_at: String,
}

pub fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub fn outing_window(
    from_time: &str,
    to_time: &str,
    campus: FixedOffset,
) -> Result<Window, WindowError> {
    let from = parse_ts(from_time).ok_or(WindowError::BadTimestamp("fromTime"))?;
    let to = parse_ts(to_time).ok_or(WindowError::BadTimestamp("toTime"))?;
    if to <= from {
        return Err(WindowError::OutingNotForward);
    }
    if from.with_timezone(&campus).date_naive() != to.with_timezone(&campus).date_naive() {
        return Err(WindowError::OutingSpansDays);
    }
    Ok(Window {
        from: format_ts(from),
        to: format_ts(to),
        ends_at: format_ts(to),
    })
}

pub fn outpass_window(
    from_day: &str,
    to_day: &str,
    campus: FixedOffset,
) -> Result<Window, WindowError> {
    let from = NaiveDate::parse_from_str(from_day.trim(), "%Y-%m-%d")
        .map_err(|_| WindowError::BadDate("fromDay"))?;
    let to = NaiveDate::parse_from_str(to_day.trim(), "%Y-%m-%d")
        .map_err(|_| WindowError::BadDate("toDay"))?;
    if to < from {
        return Err(WindowError::OutpassNotForward);
    }
    let last_second = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default();
    let ends_local = campus
        .from_local_datetime(&to.and_time(last_second))
        .single()
        .ok_or(WindowError::BadDate("toDay"))?;
    Ok(Window {
        from: from.format("%Y-%m-%d").to_string(),
        to: to.format("%Y-%m-%d").to_string(),
        ends_at: format_ts(ends_local.with_timezone(&Utc)),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub outings_expired: usize,
    pub outpasses_expired: usize,
}

/// Marks every unreturned, non-rejected request whose window closed before
/// `now` as expired, queueing one notice per newly expired record.
pub fn sweep_expired(conn: &Connection, now: DateTime<Utc>) -> anyhow::Result<SweepSummary> {
    let now_s = format_ts(now);
    let tx = conn.unchecked_transaction()?;
    let mut summary = SweepSummary::default();

    for kind in RequestKind::ALL {
        let table = kind.table();
        let (from_col, to_col) = kind.window_columns();
        let expiring = {
            let mut stmt = tx.prepare(&format!(
                "SELECT r.id, s.email, s.name, r.{from_col}, r.{to_col}
                 FROM {table} r
                 JOIN students s ON s.id = r.student_id
                 WHERE r.ends_at < ?
                   AND r.is_rejected = 0
                   AND r.is_expired = 0
                   AND r.in_time IS NULL"
            ))?;
            let rows = stmt
                .query_map([&now_s], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for (id, email, name, from, to) in &expiring {
            tx.execute(
                &format!("UPDATE {table} SET is_expired = 1 WHERE id = ?"),
                [id],
            )?;
            let notice = mailer::expired_notice(kind, name, from, to);
            mailer::enqueue(&tx, email, &notice.subject, &notice.body, now)?;
        }

        match kind {
            RequestKind::Outing => summary.outings_expired = expiring.len(),
            RequestKind::Outpass => summary.outpasses_expired = expiring.len(),
        }
    }

    tx.commit()?;
    if summary.outings_expired + summary.outpasses_expired > 0 {
        info!(
            outings = summary.outings_expired,
            outpasses = summary.outpasses_expired,
            "expired overdue requests"
        );
    }
    Ok(summary)
}
