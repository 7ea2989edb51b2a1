use std::{env, fmt::Display, fs::read_to_string, path::PathBuf, str::FromStr};

use anyhow::{anyhow, Context};
use chrono::FixedOffset;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ipc::Settings;

/// Process configuration read from `CAMPUS_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: PathBuf,
    pub port: u16,
    pub sweep_interval_secs: u64,
    pub mail_interval_secs: u64,
    pub settings: Settings,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let offset_minutes: i32 = try_load("CAMPUS_UTC_OFFSET_MINUTES", "330")?;
        let campus_offset = FixedOffset::east_opt(offset_minutes * 60)
            .ok_or_else(|| anyhow!("CAMPUS_UTC_OFFSET_MINUTES out of range: {offset_minutes}"))?;

        let token_ttl_hours: i64 = try_load("CAMPUS_TOKEN_TTL_HOURS", "24")?;
        if token_ttl_hours <= 0 {
            return Err(anyhow!("CAMPUS_TOKEN_TTL_HOURS must be positive"));
        }

        Ok(Self {
            workspace: try_load("CAMPUS_WORKSPACE", "./campus-data")?,
            port: try_load("CAMPUS_PORT", "8080")?,
            sweep_interval_secs: try_load::<u64>("CAMPUS_SWEEP_INTERVAL_SECS", "300")?.max(1),
            mail_interval_secs: try_load::<u64>("CAMPUS_MAIL_INTERVAL_SECS", "60")?.max(1),
            settings: Settings {
                jwt_secret: load_jwt_secret(),
                token_ttl_hours,
                campus_offset,
                mail_from: try_load("CAMPUS_MAIL_FROM", "noreply@campus.local")?,
            },
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = var(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    raw.trim()
        .parse()
        .map_err(|e| anyhow!("invalid {key} value {raw:?}: {e}"))
}

fn read_secret(secret_name: &str) -> anyhow::Result<String> {
    let path = format!("/run/secrets/{secret_name}");
    let secret = read_to_string(&path)
        .with_context(|| format!("failed to read {secret_name} from {path}"))?
        .trim()
        .to_string();
    if secret.is_empty() {
        return Err(anyhow!("{path} is empty"));
    }
    Ok(secret)
}

/// Environment first, then the secrets mount, then a throwaway secret.
fn load_jwt_secret() -> String {
    if let Some(secret) = var("CAMPUS_JWT_SECRET") {
        return secret;
    }
    match read_secret("CAMPUS_JWT_SECRET") {
        Ok(secret) => secret,
        Err(e) => {
            warn!("{e:#}; generating a per-process JWT secret, tokens will not survive a restart");
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        }
    }
}
