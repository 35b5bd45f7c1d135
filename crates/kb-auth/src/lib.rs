//! Auth & Token Service (C12): signed bearer tokens carrying the claim set
//! from spec §4.12, plus persisted tool tokens. Access/refresh tokens are
//! stateless JWTs (HS256); refresh rotation enforces single-use via an
//! in-process consumed-jti set, the same "reference implementation
//! standing in for a real store" shape `kb-index`/`kb-metadata` use
//! elsewhere in this workspace.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use kb_core::role::RoleCode;
use kb_core::session_token::SessionTokenKind;
use kb_core::tool_token::ToolToken;
use kb_core::user::{AuthContext, User};
use kb_error::{ErrorCode, KbError};
use kb_metadata::MetadataStore;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

const DEFAULT_ACCESS_TTL_MINUTES: i64 = 60;
const DEFAULT_REFRESH_TTL_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("account is not active")]
    Inactive,
    #[error("token has expired")]
    Expired,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("refresh token already used")]
    ReusedRefreshToken,
    #[error("token kind {found:?} not accepted here, expected {expected:?}")]
    WrongKind {
        found: SessionTokenKind,
        expected: SessionTokenKind,
    },
    #[error("tool token is inactive or expired")]
    ToolTokenInactive,
    #[error(transparent)]
    Store(#[from] KbError),
}

impl From<AuthError> for KbError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Store(inner) => inner,
            AuthError::InvalidCredentials => {
                KbError::new(ErrorCode::Unauthorized, "invalid username or password")
            }
            AuthError::Inactive => KbError::new(ErrorCode::Forbidden, "account is not active"),
            AuthError::Expired => KbError::new(ErrorCode::Unauthorized, "token has expired"),
            AuthError::Malformed(msg) => KbError::new(ErrorCode::Unauthorized, msg),
            AuthError::ReusedRefreshToken => {
                KbError::new(ErrorCode::Unauthorized, "refresh token already used")
            }
            AuthError::WrongKind { found, expected } => KbError::new(
                ErrorCode::Unauthorized,
                format!("expected a {expected:?} token, found {found:?}"),
            ),
            AuthError::ToolTokenInactive => {
                KbError::new(ErrorCode::Forbidden, "tool token is inactive or expired")
            }
        }
    }
}

/// Wire claims, `{sub, username, org_id, is_superuser, roles, iat, exp,
/// kind}` from spec §4.12, plus a `jti` used to enforce single-use
/// refresh rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub org_id: Option<Uuid>,
    pub is_superuser: bool,
    pub roles: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    pub kind: SessionTokenKind,
    pub jti: Uuid,
}

impl Claims {
    fn to_auth_context(&self) -> AuthContext {
        AuthContext {
            user_id: Some(self.sub),
            org_id: self.org_id,
            role_codes: self.roles.iter().map(|r| RoleCode::from(r.as_str())).collect(),
            is_superuser: self.is_superuser,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Issues and verifies session tokens (access/refresh) and persisted tool
/// tokens. One instance is shared across a daemon process; the consumed-jti
/// set is process-local, so refresh rotation is enforced per-instance only
/// (acceptable for the reference deployment this workspace targets, noted
/// in `DESIGN.md`).
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    metadata: Arc<dyn MetadataStore>,
    consumed_refresh_jtis: RwLock<HashSet<Uuid>>,
}

impl TokenService {
    pub fn new(secret: &[u8], metadata: Arc<dyn MetadataStore>) -> Self {
        TokenService {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            access_ttl: Duration::minutes(DEFAULT_ACCESS_TTL_MINUTES),
            refresh_ttl: Duration::days(DEFAULT_REFRESH_TTL_DAYS),
            metadata,
            consumed_refresh_jtis: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_ttls(mut self, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        self.access_ttl = access_ttl;
        self.refresh_ttl = refresh_ttl;
        self
    }

    #[instrument(level = "debug", skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedTokens, AuthError> {
        let user = self.metadata.get_user_by_username(username).await?;
        if !user.is_active {
            return Err(AuthError::Inactive);
        }
        if !verify_password(&user.password_hash, password) {
            return Err(AuthError::InvalidCredentials);
        }
        self.issue_session_pair(&user)
    }

    fn issue_session_pair(&self, user: &User) -> Result<IssuedTokens, AuthError> {
        let now = Utc::now();
        let access_token = self.encode_claims(user, SessionTokenKind::Access, now, self.access_ttl)?;
        let refresh_token = self.encode_claims(user, SessionTokenKind::Refresh, now, self.refresh_ttl)?;
        Ok(IssuedTokens {
            access_token,
            refresh_token,
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    fn encode_claims(
        &self,
        user: &User,
        kind: SessionTokenKind,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user.id,
            username: user.username.clone(),
            org_id: user.org_id,
            is_superuser: user.is_superuser,
            roles: user.role_codes.iter().map(|r| r.as_str().to_string()).collect(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            kind,
            jti: Uuid::new_v4(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Malformed(e.to_string()))
    }

    /// Refresh rotation: the presented refresh token must verify, must not
    /// have been consumed before, and is marked consumed before the new
    /// pair is returned, so a replayed refresh token is always rejected
    /// even if the caller races with itself.
    #[instrument(level = "debug", skip(self, refresh_token))]
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedTokens, AuthError> {
        let claims = self.decode_claims(refresh_token)?;
        if claims.kind != SessionTokenKind::Refresh {
            return Err(AuthError::WrongKind {
                found: claims.kind,
                expected: SessionTokenKind::Refresh,
            });
        }
        {
            let mut consumed = self.consumed_refresh_jtis.write().await;
            if !consumed.insert(claims.jti) {
                return Err(AuthError::ReusedRefreshToken);
            }
        }
        let user = self.metadata.get_user(claims.sub).await?;
        if !user.is_active {
            return Err(AuthError::Inactive);
        }
        self.issue_session_pair(&user)
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Malformed(e.to_string()),
            }
        })?;
        Ok(data.claims)
    }

    /// Verifies a bearer token presented to a user-facing endpoint,
    /// requiring it to be an access token specifically (not a refresh
    /// token, which must only ever be presented to `/auth/refresh`).
    #[instrument(level = "debug", skip(self, token))]
    pub async fn verify_access_token(&self, token: &str) -> Result<AuthContext, AuthError> {
        let claims = self.decode_claims(token)?;
        if claims.kind != SessionTokenKind::Access {
            return Err(AuthError::WrongKind {
                found: claims.kind,
                expected: SessionTokenKind::Access,
            });
        }
        Ok(claims.to_auth_context())
    }

    /// The tool-protocol surface accepts either an access token or a tool
    /// token and must extract the same user context either way (spec
    /// §4.12/§6).
    #[instrument(level = "debug", skip(self, token))]
    pub async fn verify_bearer(&self, token: &str) -> Result<AuthContext, AuthError> {
        if looks_like_jwt(token) {
            self.verify_access_token(token).await
        } else {
            self.verify_tool_token(token).await
        }
    }

    async fn verify_tool_token(&self, secret: &str) -> Result<AuthContext, AuthError> {
        let secret_hash = hash_tool_secret(secret);
        let mut token = self
            .metadata
            .find_tool_token_by_secret_hash(&secret_hash)
            .await?
            .ok_or(AuthError::ToolTokenInactive)?;

        let now = Utc::now();
        if !token.is_usable_at(now) {
            return Err(AuthError::ToolTokenInactive);
        }

        let owner = self.metadata.get_user(token.owner_id).await?;
        let current_version = self.metadata.get_user_authz_version(token.owner_id).await?;
        if token.authz_version < current_version || !owner.is_active {
            return Err(AuthError::ToolTokenInactive);
        }

        token.last_used = Some(now);
        self.metadata.update_tool_token(token).await?;

        Ok(AuthContext::from_user(&owner))
    }

    /// Mints a new tool token for `owner`, returning the persisted row
    /// (with hashed secret) alongside the one-time cleartext secret the
    /// caller must show to the user exactly once.
    #[instrument(level = "debug", skip(self))]
    pub async fn issue_tool_token(
        &self,
        owner: &User,
        name: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(ToolToken, String), AuthError> {
        let secret = generate_tool_secret();
        let secret_hash = hash_tool_secret(&secret);
        let authz_version = self.metadata.get_user_authz_version(owner.id).await?;
        let token = ToolToken {
            id: Uuid::new_v4(),
            owner_id: owner.id,
            name,
            secret_hash,
            created_at: Utc::now(),
            last_used: None,
            expires_at,
            active: true,
            authz_version,
        };
        self.metadata.create_tool_token(token.clone()).await?;
        Ok((token, secret))
    }

    /// Revokes a single tool token immediately by marking it inactive.
    /// Other tool tokens issued to the same owner are unaffected; use
    /// [`TokenService::bump_authz_version`] to invalidate every token a
    /// user holds at once (spec §4.12 supplement).
    #[instrument(level = "debug", skip(self))]
    pub async fn revoke_tool_token(&self, token_id: Uuid) -> Result<(), AuthError> {
        let mut token = self.metadata.get_tool_token(token_id).await?;
        token.active = false;
        self.metadata.update_tool_token(token).await?;
        Ok(())
    }

    /// Called on role change or explicit "sign out everywhere"; every
    /// tool token issued to `user_id` stops verifying on its next use.
    pub async fn bump_authz_version(&self, user_id: Uuid) -> Result<u64, AuthError> {
        Ok(self.metadata.bump_user_authz_version(user_id).await?)
    }
}

fn looks_like_jwt(token: &str) -> bool {
    token.matches('.').count() == 2
}

const TOOL_SECRET_PREFIX: &str = "kbt_";

fn generate_tool_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{TOOL_SECRET_PREFIX}{}", hex_encode(&bytes))
}

fn hash_tool_secret(secret: &str) -> String {
    hex_encode(&Sha256::digest(secret.as_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Salted Argon2id hash for a login password. Not named in spec.md, which
/// treats `password_hash` as opaque; this is the concrete scheme.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Malformed(e.to_string()))
}

pub fn verify_password(password_hash: &str, candidate: &str) -> bool {
    let parsed = match PasswordHash::new(password_hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_metadata::InMemoryMetadataStore;
    use std::collections::BTreeSet;

    fn sample_user(username: &str, active: bool) -> User {
        User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password_hash: hash_password("correct horse").unwrap(),
            org_id: Some(Uuid::new_v4()),
            is_active: active,
            is_superuser: false,
            role_codes: BTreeSet::from([RoleCode::viewer()]),
            created_at: Utc::now(),
            last_login: None,
        }
    }

    async fn service_with_user(user: User) -> (TokenService, Arc<dyn MetadataStore>) {
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        metadata.create_user(user).await.unwrap();
        (TokenService::new(b"test-secret", metadata.clone()), metadata)
    }

    #[tokio::test]
    async fn login_round_trips_and_verifies() {
        let user = sample_user("alice", true);
        let (service, _metadata) = service_with_user(user.clone()).await;

        let issued = service.login("alice", "correct horse").await.unwrap();
        let ctx = service.verify_access_token(&issued.access_token).await.unwrap();
        assert_eq!(ctx.user_id, Some(user.id));
        assert!(!ctx.is_superuser);
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let user = sample_user("bob", true);
        let (service, _metadata) = service_with_user(user).await;
        let err = service.login("bob", "wrong password").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn login_rejects_inactive_account() {
        let user = sample_user("carol", false);
        let (service, _metadata) = service_with_user(user).await;
        let err = service.login("carol", "correct horse").await.unwrap_err();
        assert!(matches!(err, AuthError::Inactive));
    }

    #[tokio::test]
    async fn refresh_token_is_single_use() {
        let user = sample_user("dave", true);
        let (service, _metadata) = service_with_user(user).await;
        let issued = service.login("dave", "correct horse").await.unwrap();

        let rotated = service.refresh(&issued.refresh_token).await.unwrap();
        assert_ne!(rotated.access_token, issued.access_token);

        let err = service.refresh(&issued.refresh_token).await.unwrap_err();
        assert!(matches!(err, AuthError::ReusedRefreshToken));
    }

    #[tokio::test]
    async fn access_token_rejected_by_refresh_endpoint() {
        let user = sample_user("erin", true);
        let (service, _metadata) = service_with_user(user).await;
        let issued = service.login("erin", "correct horse").await.unwrap();
        let err = service.refresh(&issued.access_token).await.unwrap_err();
        assert!(matches!(err, AuthError::WrongKind { .. }));
    }

    #[tokio::test]
    async fn tool_token_round_trips_and_extracts_owner_context() {
        let user = sample_user("frank", true);
        let (service, _metadata) = service_with_user(user.clone()).await;
        let (_token, secret) = service.issue_tool_token(&user, "ci".to_string(), None).await.unwrap();

        let ctx = service.verify_bearer(&secret).await.unwrap();
        assert_eq!(ctx.user_id, Some(user.id));
    }

    #[tokio::test]
    async fn revoked_tool_token_stops_verifying() {
        let user = sample_user("grace", true);
        let (service, _metadata) = service_with_user(user.clone()).await;
        let (token, secret) = service.issue_tool_token(&user, "ci".to_string(), None).await.unwrap();

        service.revoke_tool_token(token.id).await.unwrap();
        let err = service.verify_bearer(&secret).await.unwrap_err();
        assert!(matches!(err, AuthError::ToolTokenInactive));
    }

    #[tokio::test]
    async fn bumping_authz_version_revokes_outstanding_tool_tokens() {
        let user = sample_user("heidi", true);
        let (service, _metadata) = service_with_user(user.clone()).await;
        let (_token, secret) = service.issue_tool_token(&user, "ci".to_string(), None).await.unwrap();

        service.bump_authz_version(user.id).await.unwrap();
        let err = service.verify_bearer(&secret).await.unwrap_err();
        assert!(matches!(err, AuthError::ToolTokenInactive));
    }

    #[test]
    fn bearer_classification_distinguishes_jwt_from_tool_secret() {
        assert!(looks_like_jwt("a.b.c"));
        assert!(!looks_like_jwt("kbt_deadbeef"));
    }
}
