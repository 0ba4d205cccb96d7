//! Session Store: persistent OAuth request/session rows with TTL cleanup.
//!
//! Backed by Postgres via `sqlx` rather than the reference gateway's Redis
//! (see DESIGN.md "Session Store backing" — the relational constraints
//! (`state` primary key, composite `(did, session_id)` key, atomic
//! get-and-delete) map directly onto SQL here).

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::models::{MobileFlow, OAuthRequest, OAuthSession};

#[derive(Clone)]
pub struct SessionStore {
    pool: PgPool,
}

impl SessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(AppError::Database)?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(sqlx::Error::Migrate(Box::new(e))))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a pending OAuthRequest; a duplicate `state` is a programmer
    /// error (state is 32 random bytes) but is still surfaced distinctly.
    pub async fn save_request(&self, req: &OAuthRequest) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO oauth_requests (
                state, did, handle, pds_url, auth_server_issuer, auth_server_token_endpoint,
                pkce_verifier, dpop_private_key_multibase, dpop_authserver_nonce, request_uri,
                scopes, return_url, mobile_csrf_token, mobile_redirect_uri, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
            "#,
        )
        .bind(&req.state)
        .bind(&req.did)
        .bind(&req.handle)
        .bind(&req.pds_url)
        .bind(&req.auth_server_issuer)
        .bind(&req.auth_server_token_endpoint)
        .bind(&req.pkce_verifier)
        .bind(&req.dpop_private_key_multibase)
        .bind(&req.dpop_authserver_nonce)
        .bind(&req.request_uri)
        .bind(&req.scopes)
        .bind(&req.return_url)
        .bind(&req.mobile_csrf_token)
        .bind(&req.mobile_redirect_uri)
        .bind(req.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(AppError::AlreadyUsed(
                "oauth request state already exists".to_string(),
            )),
            Err(e) => Err(AppError::Database(e)),
        }
    }

    /// Non-mutating lookup; used for the mobile-flow cross-check (§4.11
    /// step 1/5), which MUST run before `get_and_delete_request`.
    pub async fn get_request(&self, state: &str) -> AppResult<OAuthRequest> {
        sqlx::query_as::<_, OAuthRequest>("SELECT * FROM oauth_requests WHERE state = $1")
            .bind(state)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound("oauth request not found".to_string()))
    }

    /// The server-side mobile-flow row, without consuming anything.
    pub async fn get_mobile_flow(&self, state: &str) -> AppResult<Option<MobileFlow>> {
        let row = sqlx::query_as::<_, MobileFlow>(
            "SELECT mobile_csrf_token, mobile_redirect_uri FROM oauth_requests WHERE state = $1",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.filter(|r| r.mobile_csrf_token.is_some() && r.mobile_redirect_uri.is_some()))
    }

    /// Atomic consume: deletes and returns the row in one statement, so a
    /// second caller racing the same state sees nothing.
    pub async fn get_and_delete_request(&self, state: &str) -> AppResult<OAuthRequest> {
        sqlx::query_as::<_, OAuthRequest>("DELETE FROM oauth_requests WHERE state = $1 RETURNING *")
            .bind(state)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| {
                AppError::AlreadyUsed("invalid or expired authorization request".to_string())
            })
    }

    /// Upsert by `(did, session_id)`. Validation (DID syntax, token length,
    /// URL validity) is the caller's job (Flow Orchestrator / Identity
    /// Resolver); this method enforces only the storage-level constraint.
    pub async fn save_session(&self, sess: &OAuthSession) -> AppResult<()> {
        if sess.access_token.len() > 10_000 || sess.refresh_token.as_deref().map(str::len).unwrap_or(0) > 10_000 {
            return Err(AppError::InputValidation("token exceeds maximum length".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO oauth_sessions (
                did, session_id, handle, pds_url, host_url, auth_server_issuer,
                auth_server_token_endpoint, auth_server_revocation_endpoint, access_token,
                refresh_token, dpop_private_key_multibase, dpop_authserver_nonce,
                dpop_pds_nonce, scopes, expires_at, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            ON CONFLICT (did, session_id) DO UPDATE SET
                handle = EXCLUDED.handle,
                pds_url = EXCLUDED.pds_url,
                host_url = EXCLUDED.host_url,
                auth_server_issuer = EXCLUDED.auth_server_issuer,
                auth_server_token_endpoint = EXCLUDED.auth_server_token_endpoint,
                auth_server_revocation_endpoint = EXCLUDED.auth_server_revocation_endpoint,
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                dpop_private_key_multibase = EXCLUDED.dpop_private_key_multibase,
                dpop_authserver_nonce = EXCLUDED.dpop_authserver_nonce,
                dpop_pds_nonce = EXCLUDED.dpop_pds_nonce,
                scopes = EXCLUDED.scopes,
                expires_at = EXCLUDED.expires_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&sess.did)
        .bind(&sess.session_id)
        .bind(&sess.handle)
        .bind(&sess.pds_url)
        .bind(&sess.host_url)
        .bind(&sess.auth_server_issuer)
        .bind(&sess.auth_server_token_endpoint)
        .bind(&sess.auth_server_revocation_endpoint)
        .bind(&sess.access_token)
        .bind(&sess.refresh_token)
        .bind(&sess.dpop_private_key_multibase)
        .bind(&sess.dpop_authserver_nonce)
        .bind(&sess.dpop_pds_nonce)
        .bind(&sess.scopes)
        .bind(sess.expires_at)
        .bind(sess.created_at)
        .bind(sess.updated_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Only returns a row that has not expired.
    pub async fn get_session(&self, did: &str, session_id: &str) -> AppResult<OAuthSession> {
        sqlx::query_as::<_, OAuthSession>(
            "SELECT * FROM oauth_sessions WHERE did = $1 AND session_id = $2 AND expires_at > now()",
        )
        .bind(did)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound("session not found or expired".to_string()))
    }

    pub async fn delete_session(&self, did: &str, session_id: &str) -> AppResult<()> {
        let result =
            sqlx::query("DELETE FROM oauth_sessions WHERE did = $1 AND session_id = $2")
                .bind(did)
                .bind(session_id)
                .execute(&self.pool)
                .await
                .map_err(AppError::Database)?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("session not found".to_string()));
        }
        Ok(())
    }

    /// Atomic token swap on refresh.
    pub async fn refresh_session(
        &self,
        did: &str,
        session_id: &str,
        new_access: &str,
        new_refresh: Option<&str>,
        new_exp: DateTime<Utc>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE oauth_sessions
            SET access_token = $3, refresh_token = COALESCE($4, refresh_token),
                expires_at = $5, updated_at = now()
            WHERE did = $1 AND session_id = $2
            "#,
        )
        .bind(did)
        .bind(session_id)
        .bind(new_access)
        .bind(new_refresh)
        .bind(new_exp)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("session not found".to_string()));
        }
        Ok(())
    }

    pub async fn update_authserver_nonce(&self, did: &str, session_id: &str, nonce: &str) {
        let _ = sqlx::query(
            "UPDATE oauth_sessions SET dpop_authserver_nonce = $3 WHERE did = $1 AND session_id = $2",
        )
        .bind(did)
        .bind(session_id)
        .bind(nonce)
        .execute(&self.pool)
        .await;
    }

    pub async fn update_pds_nonce(&self, did: &str, session_id: &str, nonce: &str) {
        let _ = sqlx::query(
            "UPDATE oauth_sessions SET dpop_pds_nonce = $3 WHERE did = $1 AND session_id = $2",
        )
        .bind(did)
        .bind(session_id)
        .bind(nonce)
        .execute(&self.pool)
        .await;
    }

    /// Rows older than 30 minutes are abandoned logins; purge them.
    pub async fn cleanup_expired_requests(&self) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM oauth_requests WHERE created_at < now() - interval '30 minutes'",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }

    /// Rows expired for more than 7 days are purged (live-but-expired rows
    /// are kept briefly in case the client retries a refresh).
    pub async fn cleanup_expired_sessions(&self) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM oauth_sessions WHERE expires_at < now() - interval '7 days'",
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }
}
