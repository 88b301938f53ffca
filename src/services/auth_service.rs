//! Account registration, login and bearer-token verification.
//!
//! Tokens are HS256 JWTs. The rest of the service only asks whether a
//! token is acceptable; claims are not interpreted beyond that.

use crate::{
    models::user::User,
    services::error::{AuthError, ServiceError, ServiceResult, is_unique_violation},
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::task;
use uuid::Uuid;

pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

#[derive(Clone)]
pub struct AuthService {
    db: SqlitePool,
    keys: Arc<TokenKeys>,
    token_ttl: Duration,
    bcrypt_cost: u32,
}

impl AuthService {
    pub fn new(db: SqlitePool, secret: &str, token_ttl_secs: u64) -> Self {
        Self {
            db,
            keys: Arc::new(TokenKeys {
                encoding: EncodingKey::from_secret(secret.as_bytes()),
                decoding: DecodingKey::from_secret(secret.as_bytes()),
            }),
            token_ttl: i64::try_from(token_ttl_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or_else(|| Duration::days(365)),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }

    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    pub async fn register(&self, username: &str, password: &str) -> ServiceResult<User> {
        let username = username.trim();
        let mut missing = Vec::new();
        if username.is_empty() {
            missing.push("username");
        }
        if password.is_empty() {
            missing.push("password");
        }
        if !missing.is_empty() {
            return Err(ServiceError::missing_fields(&missing));
        }

        let cost = self.bcrypt_cost;
        let password = password.to_string();
        let password_hash = task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?
            .map_err(|err| ServiceError::Internal(err.to_string()))?;

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash,
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO users (id, username, password_hash, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .execute(&self.db)
        .await
        {
            Ok(_) => Ok(user),
            Err(err) if is_unique_violation(&err) => Err(ServiceError::Conflict(format!(
                "username `{username}` is already taken"
            ))),
            Err(err) => Err(ServiceError::Database(err)),
        }
    }

    /// Check credentials and issue a token.
    pub async fn login(&self, username: &str, password: &str) -> ServiceResult<IssuedToken> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, created_at FROM users WHERE username = ?",
        )
        .bind(username.trim())
        .fetch_optional(&self.db)
        .await?
        .ok_or(AuthError::BadCredentials)?;

        let hash = user.password_hash.clone();
        let password = password.to_string();
        let valid = task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?
            .unwrap_or(false);
        if !valid {
            return Err(AuthError::BadCredentials.into());
        }

        self.issue_token(&user)
    }

    pub fn issue_token(&self, user: &User) -> ServiceResult<IssuedToken> {
        let issued_at = Utc::now();
        let expires_at = issued_at
            .checked_add_signed(self.token_ttl)
            .ok_or_else(|| ServiceError::Internal("token lifetime overflows".into()))?;
        let claims = Claims {
            sub: user.id,
            username: user.username.clone(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.keys.encoding)
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
        Ok(IssuedToken { token, expires_at })
    }

    /// Verify signature and expiry. Expiry is checked without leeway so an
    /// expired token is rejected as soon as its `exp` has passed.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        decode::<Claims>(token, &self.keys.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    const SECRET: &str = "test-secret";

    async fn service() -> (tempfile::TempDir, AuthService) {
        let (dir, db) = test_pool().await;
        (dir, AuthService::new(db, SECRET, 60).with_bcrypt_cost(4))
    }

    #[tokio::test]
    async fn register_then_login_issues_verifiable_token() {
        let (_dir, auth) = service().await;
        let user = auth.register("ana", "s3cret").await.unwrap();

        let issued = auth.login("ana", "s3cret").await.unwrap();
        let claims = auth.verify(&issued.token).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.username, "ana");
        assert!(issued.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let (_dir, auth) = service().await;
        auth.register("ana", "one").await.unwrap();
        let err = auth.register(" ana ", "two").await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)), "{err:?}");
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected() {
        let (_dir, auth) = service().await;
        auth.register("ana", "right").await.unwrap();

        for (user, pass) in [("ana", "wrong"), ("bob", "right")] {
            let err = auth.login(user, pass).await.unwrap_err();
            assert!(
                matches!(err, ServiceError::Auth(AuthError::BadCredentials)),
                "{err:?}"
            );
        }
    }

    #[tokio::test]
    async fn expired_and_forged_tokens_are_distinguished() {
        let (_dir, auth) = service().await;
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: Uuid::new_v4(),
            username: "ana".into(),
            iat: now - 7200,
            exp: now - 3600,
        };

        let expired = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(auth.verify(&expired).unwrap_err(), AuthError::Expired);

        let forged = encode(
            &Header::new(Algorithm::HS256),
            &Claims {
                exp: now + 3600,
                ..claims
            },
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();
        assert_eq!(auth.verify(&forged).unwrap_err(), AuthError::Invalid);
        assert_eq!(auth.verify("not-a-jwt").unwrap_err(), AuthError::Invalid);
    }
}
