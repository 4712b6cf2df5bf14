use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

/// SQLite token keys, searched in priority order.
pub const SQLITE_TOKEN_KEYS: &[&str] = &[
    // Social login (Google, GitHub, Microsoft, ...)
    "kirocli:social:token",
    // AWS SSO OIDC (kiro-cli corporate)
    "kirocli:odic:token",
    // Legacy AWS SSO OIDC
    "codewhisperer:odic:token",
];

/// Device registration keys (AWS SSO OIDC only).
pub const SQLITE_REGISTRATION_KEYS: &[&str] = &[
    "kirocli:odic:device-registration",
    "codewhisperer:odic:device-registration",
];

/// Everything a load can surface. Fields absent from the backing store stay
/// `None` and the caller keeps whatever it already had.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub profile_arn: Option<String>,
    /// API region (JSON file only — the SQLite `region` field is SSO-scoped).
    pub region: Option<String>,
    /// SSO region used for OIDC refresh; may differ from the API region.
    pub sso_region: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scopes: Option<Vec<String>>,
}

/// What gets written back after a successful refresh.
#[derive(Debug, Clone)]
pub struct CredentialEnvelope {
    pub refresh_token: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub profile_arn: Option<String>,
    pub region: String,
    pub scopes: Option<Vec<String>>,
}

/// Persistent credential backend: a JSON file or a kiro-cli SQLite database
/// with an `auth_kv(key, value)` table.
///
/// Load never fails: a missing file is a warning, malformed content is
/// reported and skipped. Save remembers which SQLite key the tokens came
/// from and writes back to the same row.
#[derive(Debug)]
pub enum CredentialStore {
    JsonFile {
        path: PathBuf,
    },
    Sqlite {
        path: PathBuf,
        /// Key the last load found tokens under; save targets it first.
        token_key: Option<String>,
    },
}

impl CredentialStore {
    pub fn json_file(path: impl Into<PathBuf>) -> Self {
        CredentialStore::JsonFile { path: path.into() }
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        CredentialStore::Sqlite {
            path: path.into(),
            token_key: None,
        }
    }

    pub fn is_sqlite(&self) -> bool {
        matches!(self, CredentialStore::Sqlite { .. })
    }

    /// Load whatever the backend holds. Missing files and malformed rows are
    /// reported but never propagated.
    pub fn load(&mut self) -> CredentialSet {
        match self {
            CredentialStore::JsonFile { path } => load_json_file(path),
            CredentialStore::Sqlite { path, token_key } => load_sqlite(path, token_key),
        }
    }

    /// Persist refreshed tokens. Absence of a writable target is a warning,
    /// not an error.
    pub fn save(&mut self, envelope: &CredentialEnvelope) {
        match self {
            CredentialStore::JsonFile { path } => save_json_file(path, envelope),
            CredentialStore::Sqlite { path, token_key } => {
                save_sqlite(path, token_key.as_deref(), envelope);
            }
        }
    }
}

/// ISO-8601 with a trailing `Z` accepted as `+00:00`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let normalized = if raw.ends_with('Z') {
        format!("{}+00:00", &raw[..raw.len() - 1])
    } else {
        raw.to_string()
    };
    match DateTime::parse_from_rfc3339(&normalized) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            warn!(raw, error = %e, "failed to parse credential timestamp");
            None
        }
    }
}

fn load_json_file(path: &Path) -> CredentialSet {
    let mut set = CredentialSet::default();

    if !path.exists() {
        warn!(path = %path.display(), "credentials file not found");
        return set;
    }

    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) => {
            error!(path = %path.display(), error = %e, "error reading credentials file");
            return set;
        }
    };
    let value: Value = match serde_json::from_str(&data) {
        Ok(v) => v,
        Err(e) => {
            error!(path = %path.display(), error = %e, "credentials file is not valid JSON");
            return set;
        }
    };

    set.refresh_token = str_field(&value, "refreshToken");
    set.access_token = str_field(&value, "accessToken");
    set.profile_arn = str_field(&value, "profileArn");
    set.region = str_field(&value, "region");
    set.client_id = str_field(&value, "clientId");
    set.client_secret = str_field(&value, "clientSecret");
    set.expires_at = str_field(&value, "expiresAt").and_then(|s| parse_timestamp(&s));

    // Enterprise Kiro IDE stores only a hash; the device registration with
    // the client id/secret lives in the shared SSO cache.
    if set.client_id.is_none() {
        if let Some(hash) = str_field(&value, "clientIdHash") {
            load_enterprise_registration(&hash, &mut set);
        }
    }

    info!(path = %path.display(), "credentials loaded from JSON file");
    set
}

fn load_enterprise_registration(client_id_hash: &str, set: &mut CredentialSet) {
    let Ok(home) = std::env::var("HOME") else {
        warn!("HOME not set; cannot locate enterprise device registration");
        return;
    };
    let reg_path = PathBuf::from(home)
        .join(".aws")
        .join("sso")
        .join("cache")
        .join(format!("{client_id_hash}.json"));

    if !reg_path.exists() {
        warn!(path = %reg_path.display(), "enterprise device registration not found");
        return;
    }

    match std::fs::read_to_string(&reg_path)
        .map_err(|e| e.to_string())
        .and_then(|d| serde_json::from_str::<Value>(&d).map_err(|e| e.to_string()))
    {
        Ok(reg) => {
            set.client_id = str_field(&reg, "clientId").or(set.client_id.take());
            set.client_secret = str_field(&reg, "clientSecret").or(set.client_secret.take());
            info!(path = %reg_path.display(), "enterprise device registration loaded");
        }
        Err(e) => {
            error!(path = %reg_path.display(), error = %e, "error loading device registration");
        }
    }
}

/// Save preserves fields the gateway does not manage (read-modify-write).
fn save_json_file(path: &Path, envelope: &CredentialEnvelope) {
    let mut existing: Value = if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|d| serde_json::from_str(&d).ok())
            .unwrap_or_else(|| json!({}))
    } else {
        json!({})
    };

    if let Some(map) = existing.as_object_mut() {
        map.insert("accessToken".into(), json!(envelope.access_token));
        map.insert("refreshToken".into(), json!(envelope.refresh_token));
        map.insert("expiresAt".into(), json!(envelope.expires_at.to_rfc3339()));
        if let Some(arn) = &envelope.profile_arn {
            map.insert("profileArn".into(), json!(arn));
        }
    }

    match serde_json::to_string_pretty(&existing)
        .map_err(|e| e.to_string())
        .and_then(|data| std::fs::write(path, data).map_err(|e| e.to_string()))
    {
        Ok(()) => debug!(path = %path.display(), "credentials saved to JSON file"),
        Err(e) => error!(path = %path.display(), error = %e, "error saving credentials"),
    }
}

fn load_sqlite(path: &Path, remembered_key: &mut Option<String>) -> CredentialSet {
    let mut set = CredentialSet::default();

    if !path.exists() {
        warn!(path = %path.display(), "SQLite database not found");
        return set;
    }
    let conn = match Connection::open(path) {
        Ok(c) => c,
        Err(e) => {
            error!(path = %path.display(), error = %e, "SQLite open failed");
            return set;
        }
    };

    for key in SQLITE_TOKEN_KEYS {
        match kv_get(&conn, key) {
            Ok(Some(raw)) => {
                *remembered_key = Some((*key).to_string());
                debug!(key, "loaded credentials from SQLite key");
                apply_sqlite_token_row(&raw, &mut set);
                break;
            }
            Ok(None) => {}
            Err(e) => {
                error!(key, error = %e, "SQLite error loading credentials");
                return set;
            }
        }
    }

    for key in SQLITE_REGISTRATION_KEYS {
        match kv_get(&conn, key) {
            Ok(Some(raw)) => {
                debug!(key, "loaded device registration from SQLite key");
                apply_sqlite_registration_row(&raw, &mut set);
                break;
            }
            Ok(None) => {}
            Err(e) => {
                error!(key, error = %e, "SQLite error loading device registration");
                break;
            }
        }
    }

    info!(path = %path.display(), "credentials loaded from SQLite database");
    set
}

fn apply_sqlite_token_row(raw: &str, set: &mut CredentialSet) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "JSON decode error in SQLite token row");
            return;
        }
    };
    set.access_token = str_field(&value, "access_token").or(set.access_token.take());
    set.refresh_token = str_field(&value, "refresh_token").or(set.refresh_token.take());
    set.profile_arn = str_field(&value, "profile_arn").or(set.profile_arn.take());
    // The token row's `region` is the SSO region; the API region is pinned
    // separately by configuration.
    set.sso_region = str_field(&value, "region").or(set.sso_region.take());
    if let Some(scopes) = value.get("scopes").and_then(|v| v.as_array()) {
        set.scopes = Some(
            scopes
                .iter()
                .filter_map(|s| s.as_str().map(String::from))
                .collect(),
        );
    }
    if let Some(raw_expiry) = str_field(&value, "expires_at") {
        set.expires_at = parse_timestamp(&raw_expiry);
    }
}

fn apply_sqlite_registration_row(raw: &str, set: &mut CredentialSet) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "JSON decode error in SQLite registration row");
            return;
        }
    };
    set.client_id = str_field(&value, "client_id").or(set.client_id.take());
    set.client_secret = str_field(&value, "client_secret").or(set.client_secret.take());
    if set.sso_region.is_none() {
        set.sso_region = str_field(&value, "region");
    }
}

fn save_sqlite(path: &Path, remembered_key: Option<&str>, envelope: &CredentialEnvelope) {
    if !path.exists() {
        warn!(path = %path.display(), "SQLite database not found for writing");
        return;
    }
    let conn = match Connection::open(path) {
        Ok(c) => c,
        Err(e) => {
            error!(path = %path.display(), error = %e, "SQLite open failed");
            return;
        }
    };

    let mut row = json!({
        "access_token": envelope.access_token,
        "refresh_token": envelope.refresh_token,
        "expires_at": envelope.expires_at.to_rfc3339(),
        "region": envelope.region,
    });
    if let Some(scopes) = &envelope.scopes {
        row["scopes"] = json!(scopes);
    }
    let row = row.to_string();

    if let Some(key) = remembered_key {
        match kv_update(&conn, key, &row) {
            Ok(true) => {
                debug!(key, "credentials saved to SQLite key");
                return;
            }
            Ok(false) => warn!(key, "SQLite key vanished, trying fallback keys"),
            Err(e) => {
                error!(key, error = %e, "SQLite error saving credentials");
                return;
            }
        }
    }

    for key in SQLITE_TOKEN_KEYS {
        match kv_update(&conn, key, &row) {
            Ok(true) => {
                debug!(key, "credentials saved to SQLite key (fallback)");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(key, error = %e, "SQLite error saving credentials");
                return;
            }
        }
    }

    warn!("failed to save credentials to SQLite: no matching keys found");
}

fn kv_get(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    use rusqlite::OptionalExtension;
    conn.query_row("SELECT value FROM auth_kv WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
}

fn kv_update(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE auth_kv SET value = ?1 WHERE key = ?2",
        [value, key],
    )?;
    Ok(changed > 0)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(String::from)
}
