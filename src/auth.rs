//! Authentication module for bmcfront
//!
//! Provides password accounts and token-based sessions. Only token hashes
//! are kept; the plain token is handed out once at login.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{AccountConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::privileges::{user_privileges, PrivilegeSet};

/// An authenticated session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSession {
    pub id: String,
    pub username: String,
    pub role: String,
    pub groups: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// `None` = never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserSession {
    pub fn privileges(&self) -> PrivilegeSet {
        user_privileges(&self.role, &self.groups)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Account {
    salt: String,
    password_hash: String,
    role: String,
    groups: Vec<String>,
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|e| Error::Session(format!("random source: {e}")))?;
    Ok(bytes)
}

/// Generate a cryptographically secure token (32 bytes, base64url encoded)
pub fn generate_token() -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes::<32>()?))
}

/// Hash token with SHA-256 for storage
fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash password with salt
fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Accounts and live sessions
pub struct SessionStore {
    ttl_secs: u64,
    accounts: Mutex<HashMap<String, Account>>,
    /// token hash → session
    sessions: Mutex<HashMap<String, UserSession>>,
}

impl SessionStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            accounts: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(session: &SessionConfig, accounts: &[AccountConfig]) -> Result<Self> {
        let store = Self::new(session.ttl_secs);
        for a in accounts {
            store.add_account(&a.username, &a.password, &a.role, &a.groups)?;
        }
        Ok(store)
    }

    fn lock_accounts(&self) -> MutexGuard<'_, HashMap<String, Account>> {
        self.accounts.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, UserSession>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    /// Add or replace an account
    pub fn add_account<S: AsRef<str>>(&self, username: &str, password: &str, role: &str, groups: &[S]) -> Result<()> {
        let salt = hex::encode(random_bytes::<16>()?);
        let password_hash = hash_password(&salt, password);
        let account = Account {
            salt,
            password_hash,
            role: role.to_string(),
            groups: groups.iter().map(|g| g.as_ref().to_string()).collect(),
        };
        self.lock_accounts().insert(username.to_string(), account);
        debug!(username, role, "account added");
        Ok(())
    }

    pub fn verify_password(&self, username: &str, password: &str) -> bool {
        self.lock_accounts()
            .get(username)
            .is_some_and(|a| hash_password(&a.salt, password) == a.password_hash)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Login with password, returns the token and its session
    pub fn login(&self, username: &str, password: &str) -> Result<(String, UserSession)> {
        if !self.verify_password(username, password) {
            info!(target: "access", username, "login failed");
            return Err(Error::Session("invalid credentials".into()));
        }
        self.create_session(username)
    }

    /// Create a session for an existing account
    pub fn create_session(&self, username: &str) -> Result<(String, UserSession)> {
        let (role, groups) = {
            let accounts = self.lock_accounts();
            let account = accounts
                .get(username)
                .ok_or_else(|| Error::Session(format!("unknown account '{username}'")))?;
            (account.role.clone(), account.groups.clone())
        };
        let token = generate_token()?;
        let now = Utc::now();
        let expires_at = match self.ttl_secs {
            0 => None,
            // Out-of-range lifetimes never expire
            ttl => i64::try_from(ttl)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|d| now.checked_add_signed(d)),
        };
        let session = UserSession {
            id: hex::encode(random_bytes::<8>()?),
            username: username.to_string(),
            role,
            groups,
            created_at: now,
            expires_at,
        };
        self.lock_sessions().insert(hash_token(&token), session.clone());
        info!(username, session = %session.id, "session created");
        Ok((token, session))
    }

    /// Validate token, returns the session if live. Expired sessions are dropped.
    pub fn validate(&self, token: &str) -> Result<UserSession> {
        let hash = hash_token(token);
        let mut sessions = self.lock_sessions();
        let session = sessions
            .get(&hash)
            .ok_or_else(|| Error::Session("invalid token".into()))?;
        if session.is_expired(Utc::now()) {
            sessions.remove(&hash);
            return Err(Error::Session("token expired".into()));
        }
        Ok(session.clone())
    }

    /// Revoke a session by token
    pub fn revoke(&self, token: &str) -> bool {
        self.lock_sessions().remove(&hash_token(token)).is_some()
    }

    /// Revoke a session by its resource id
    pub fn revoke_by_id(&self, id: &str) -> bool {
        let mut sessions = self.lock_sessions();
        let before = sessions.len();
        sessions.retain(|_, s| s.id != id);
        before != sessions.len()
    }

    /// Live sessions, oldest first
    pub fn list(&self) -> Vec<UserSession> {
        let now = Utc::now();
        let mut sessions = self.lock_sessions();
        sessions.retain(|_, s| !s.is_expired(now));
        let mut live: Vec<UserSession> = sessions.values().cloned().collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        live
    }

    pub fn count(&self) -> usize {
        self.list().len()
    }
}
