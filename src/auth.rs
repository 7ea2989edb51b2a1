use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("token could not be issued: {0}")]
    Issue(#[source] jsonwebtoken::errors::Error),

    #[error("invalid or expired token")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Webmaster,
    Dean,
    Warden,
    Caretaker,
    Security,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Webmaster => "webmaster",
            Role::Dean => "dean",
            Role::Warden => "warden",
            Role::Caretaker => "caretaker",
            Role::Security => "security",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webmaster" => Some(Role::Webmaster),
            "dean" => Some(Role::Dean),
            "warden" => Some(Role::Warden),
            "caretaker" => Some(Role::Caretaker),
            "security" => Some(Role::Security),
            _ => None,
        }
    }

    pub fn can_decide_requests(self) -> bool {
        matches!(
            self,
            Role::Webmaster | Role::Dean | Role::Warden | Role::Caretaker
        )
    }

    pub fn can_operate_gate(self) -> bool {
        matches!(self, Role::Webmaster | Role::Security)
    }

    pub fn can_manage_students(self) -> bool {
        matches!(self, Role::Webmaster | Role::Dean)
    }

    pub fn can_manage_admins(self) -> bool {
        self == Role::Webmaster
    }
}

/// Who is calling, as recovered from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Student { id: String, username: String },
    Admin { id: String, username: String, role: Role },
}

impl Actor {
    pub fn username(&self) -> &str {
        match self {
            Actor::Student { username, .. } | Actor::Admin { username, .. } => username,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    kind: String,
    role: String,
    iat: usize,
    exp: usize,
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Checks `password` against the account's hash, or against a throwaway hash
/// when there is no account, so both paths cost one Argon2 verification.
pub fn verify_password_or_dummy(password: &str, stored_hash: Option<&str>) -> bool {
    static DUMMY_HASH: OnceLock<String> = OnceLock::new();
    match stored_hash {
        Some(hash) => verify_password(password, hash),
        None => {
            let dummy = DUMMY_HASH
                .get_or_init(|| hash_password("no-such-account").unwrap_or_default());
            let _ = verify_password(password, dummy);
            false
        }
    }
}

pub fn issue_token(actor: &Actor, secret: &str, ttl_hours: i64) -> Result<String, AuthError> {
    let now = Utc::now();
    let (sub, username, kind, role) = match actor {
        Actor::Student { id, username } => (id, username, "student", "student"),
        Actor::Admin { id, username, role } => (id, username, "admin", role.as_str()),
    };
    let claims = Claims {
        sub: sub.clone(),
        username: username.clone(),
        kind: kind.to_string(),
        role: role.to_string(),
        iat: now.timestamp() as usize,
        exp: (now + Duration::hours(ttl_hours.max(1))).timestamp() as usize,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(AuthError::Issue)
}

pub fn verify_token(token: &str, secret: &str) -> Result<Actor, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(AuthError::InvalidToken)?;
    let c = data.claims;
    if c.kind == "student" {
        return Ok(Actor::Student {
            id: c.sub,
            username: c.username,
        });
    }
    match Role::parse(&c.role) {
        Some(role) if c.kind == "admin" => Ok(Actor::Admin {
            id: c.sub,
            username: c.username,
            role,
        }),
        _ => Err(AuthError::InvalidToken(
            jsonwebtoken::errors::ErrorKind::InvalidSubject.into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_roundtrip_rejects_wrong_password() {
        let h = hash_password("s3cret-pass").expect("hash");
        assert!(h.starts_with("$argon2"));
        assert!(verify_password("s3cret-pass", &h));
        assert!(!verify_password("s3cret-pasS", &h));
        assert!(!verify_password("s3cret-pass", "not-a-phc-string"));
    }

    #[test]
    fn missing_account_never_verifies() {
        assert!(!verify_password_or_dummy("no-such-account", None));
        assert!(!verify_password_or_dummy("anything", None));
        let h = hash_password(" padded ").expect("hash");
        assert!(verify_password_or_dummy(" padded ", Some(&h)));
        assert!(!verify_password_or_dummy("padded", Some(&h)));
    }

    #[test]
    fn token_carries_admin_role() {
        let actor = Actor::Admin {
            id: "a1".into(),
            username: "warden1".into(),
            role: Role::Warden,
        };
        let token = issue_token(&actor, "k", 1).expect("issue");
        assert_eq!(verify_token(&token, "k").expect("verify"), actor);
        assert!(verify_token(&token, "other-key").is_err());
    }

    #[test]
    fn role_permissions() {
        assert!(Role::Caretaker.can_decide_requests());
        assert!(!Role::Security.can_decide_requests());
        assert!(Role::Security.can_operate_gate());
        assert!(!Role::Dean.can_manage_admins());
        assert_eq!(Role::parse(" Dean "), Some(Role::Dean));
        assert_eq!(Role::parse("student"), None);
    }
}
