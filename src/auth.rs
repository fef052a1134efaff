//! Credentials, session tokens, and external-account linking.
//!
//! Passwords are hashed with argon2id (PHC strings). Sessions are stateless
//! JWTs signed with the secret from the `LEDGERBOX_JWT_SECRET` environment
//! variable.
//!
//! Two deliberate policies from the source application are kept:
//! - **Demo bypass**: the configured demo credential pair authenticates as a
//!   fixed user id regardless of what the users table holds; the row for
//!   that id is created on first demo login.
//! - **Fail-open linking**: a failure to persist provider tokens during
//!   sign-in is logged and swallowed so a provider hiccup cannot lock the
//!   user out.

use anyhow::{bail, Context, Result};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::models::User;

/// Fixed id used for the demo credential pair.
pub const DEMO_USER_ID: &str = "demo-user";

pub const JWT_SECRET_ENV: &str = "LEDGERBOX_JWT_SECRET";

/// JWT session claims.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

pub fn jwt_secret_from_env() -> Result<String> {
    std::env::var(JWT_SECRET_ENV)
        .with_context(|| format!("{} environment variable not set", JWT_SECRET_ENV))
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, phc_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(phc_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Issue a signed session token for a user.
pub fn issue_token(secret: &[u8], config: &AuthConfig, user_id: &str, email: &str) -> Result<String> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        iat: now,
        exp: now + config.token_ttl_secs,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| anyhow::anyhow!("token encoding failed: {}", e))
}

/// Decode and validate a session token. Expired or tampered tokens error.
pub fn verify_token(secret: &[u8], token: &str) -> Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret),
        &Validation::default(),
    )
    .map_err(|e| anyhow::anyhow!("invalid token: {}", e))?;
    Ok(data.claims)
}

/// Authenticate a credentials login.
///
/// Returns `Ok(None)` for any failed authentication: unknown email, wrong
/// password, or an account with no password hash (provider-only accounts
/// cannot log in with credentials).
pub async fn authenticate(
    pool: &SqlitePool,
    config: &AuthConfig,
    email: &str,
    password: &str,
) -> Result<Option<(String, String)>> {
    // Demo credentials bypass the password check. The fixed user row is
    // created lazily so foreign keys from sessions and invoices hold.
    if let (Some(demo_email), Some(demo_password)) = (&config.demo_email, &config.demo_password) {
        if email == demo_email && password == demo_password {
            let now = Utc::now().timestamp();
            sqlx::query(
                "INSERT OR IGNORE INTO users (id, email, name, password_hash, created_at, updated_at) VALUES (?, ?, 'Demo User', NULL, ?, ?)",
            )
            .bind(DEMO_USER_ID)
            .bind(email)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await?;
            return Ok(Some((DEMO_USER_ID.to_string(), email.to_string())));
        }
    }

    let row = sqlx::query("SELECT id, email, password_hash FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let hash: Option<String> = row.get("password_hash");
    let Some(hash) = hash else {
        return Ok(None);
    };

    if !verify_password(password, &hash) {
        return Ok(None);
    }

    Ok(Some((row.get("id"), row.get("email"))))
}

/// Create a new credentials user. Fails if the email is already registered.
pub async fn register_user(
    pool: &SqlitePool,
    email: &str,
    password: &str,
    name: Option<&str>,
) -> Result<User> {
    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        bail!("Email already registered");
    }

    let now = Utc::now().timestamp();
    let user = User {
        id: Uuid::new_v4().to_string(),
        email: email.to_string(),
        name: name.map(|s| s.to_string()),
        password_hash: Some(hash_password(password)?),
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        "INSERT INTO users (id, email, name, password_hash, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&user.id)
    .bind(&user.email)
    .bind(&user.name)
    .bind(&user.password_hash)
    .bind(user.created_at)
    .bind(user.updated_at)
    .execute(pool)
    .await?;

    Ok(user)
}

/// Provider profile and tokens handed over by the sign-in callback.
#[derive(Debug, Deserialize)]
pub struct ProviderIdentity {
    pub provider_account_id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Link an external-provider identity to a local user.
///
/// Matches an existing user by email, creating one (without a password hash)
/// if none exists, then upserts the account row with the provider tokens.
/// The token upsert is fail-open: on error the sign-in still succeeds.
pub async fn link_account(
    pool: &SqlitePool,
    provider: &str,
    identity: &ProviderIdentity,
) -> Result<String> {
    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
        .bind(&identity.email)
        .fetch_optional(pool)
        .await?;

    let user_id = match existing {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            let now = Utc::now().timestamp();
            sqlx::query(
                "INSERT INTO users (id, email, name, password_hash, created_at, updated_at) VALUES (?, ?, ?, NULL, ?, ?)",
            )
            .bind(&id)
            .bind(&identity.email)
            .bind(&identity.name)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await?;
            id
        }
    };

    let upsert = sqlx::query(
        r#"
        INSERT INTO accounts (id, user_id, provider, provider_account_id, access_token, refresh_token, expires_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(provider, provider_account_id) DO UPDATE SET
            access_token = excluded.access_token,
            refresh_token = excluded.refresh_token,
            expires_at = excluded.expires_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&user_id)
    .bind(provider)
    .bind(&identity.provider_account_id)
    .bind(&identity.access_token)
    .bind(&identity.refresh_token)
    .bind(identity.expires_at)
    .execute(pool)
    .await;

    if let Err(e) = upsert {
        tracing::warn!(provider, error = %e, "account token upsert failed; continuing sign-in");
    }

    Ok(user_id)
}

/// Access token of the user's linked account for a provider, if any.
pub async fn provider_access_token(
    pool: &SqlitePool,
    user_id: &str,
    provider: &str,
) -> Result<Option<String>> {
    let token: Option<Option<String>> = sqlx::query_scalar(
        "SELECT access_token FROM accounts WHERE user_id = ? AND provider = ? LIMIT 1",
    )
    .bind(user_id)
    .bind(provider)
    .fetch_optional(pool)
    .await?;
    Ok(token.flatten())
}
