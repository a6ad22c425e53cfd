//! Bearer token verification against the Auth service's published JWKS.
//!
//! Inventory Core never issues tokens. It fetches Auth's signing keys over
//! HTTPS, caches them, and verifies incoming bearer tokens against the cache.
//! The cache is refreshed on a 24h background interval; a brief staleness
//! window after a key rotation is tolerated (see SPEC_FULL.md Design Notes).

use crate::auth::claims::Claims;
use anyhow::{Context, Result};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug)]
pub enum VerifyError {
    MissingKeyId,
    UnknownKeyId,
    Malformed,
    Expired,
    JwksUnavailable,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::MissingKeyId => write!(f, "token header is missing a key id"),
            VerifyError::UnknownKeyId => write!(f, "token key id not present in cached JWKS"),
            VerifyError::Malformed => write!(f, "token is malformed or signature invalid"),
            VerifyError::Expired => write!(f, "token is expired"),
            VerifyError::JwksUnavailable => write!(f, "auth signing keys unavailable"),
        }
    }
}

impl std::error::Error for VerifyError {}

struct JwksCache {
    keys: JwkSet,
}

/// Verifies bearer tokens issued by the external Auth service.
pub struct AuthVerifier {
    jwks_url: String,
    http: reqwest::Client,
    issuer: Option<String>,
    cache: RwLock<Option<JwksCache>>,
}

impl AuthVerifier {
    pub fn new(jwks_url: String, issuer: Option<String>, http: reqwest::Client) -> Arc<Self> {
        Arc::new(Self {
            jwks_url,
            http,
            issuer,
            cache: RwLock::new(None),
        })
    }

    /// Fetches the JWKS document and replaces the cache. Called once at
    /// startup (fatal if it fails — matches the existing bootstrap convention
    /// of failing fast on unreachable required dependencies) and thereafter
    /// from a background refresh loop (non-fatal; stale keys are kept).
    pub async fn refresh(&self) -> Result<()> {
        let resp = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .context("fetching auth JWKS")?;

        if !resp.status().is_success() {
            anyhow::bail!("auth JWKS endpoint returned {}", resp.status());
        }

        let jwks = resp
            .json::<JwkSet>()
            .await
            .context("decoding auth JWKS response")?;

        let mut guard = self.cache.write().await;
        *guard = Some(JwksCache { keys: jwks });
        info!("refreshed auth signing keys");
        Ok(())
    }

    /// Builds a verifier with its cache pre-seeded from a known JWKS,
    /// bypassing the network fetch in `refresh`. Integration tests mint their
    /// own signing keypair and construct the matching `JwkSet` directly
    /// rather than standing up a fake Auth service.
    pub fn for_testing(jwks: JwkSet, issuer: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            jwks_url: "https://auth.invalid/jwks".to_string(),
            http: reqwest::Client::new(),
            issuer,
            cache: RwLock::new(Some(JwksCache { keys: jwks })),
        })
    }

    /// Spawns the 24h background refresh loop. A fetch failure is logged and
    /// retried on the next tick; the previously cached keys remain in use.
    pub fn spawn_refresh_task(self: &Arc<Self>, interval: std::time::Duration) {
        let verifier = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; startup already refreshed
            loop {
                ticker.tick().await;
                if let Err(err) = verifier.refresh().await {
                    warn!(error = %err, "auth JWKS refresh failed, keeping stale keys");
                }
            }
        });
    }

    pub async fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        let header = decode_header(token).map_err(|_| VerifyError::Malformed)?;
        let kid = header.kid.ok_or(VerifyError::MissingKeyId)?;

        let guard = self.cache.read().await;
        let cache = guard.as_ref().ok_or(VerifyError::JwksUnavailable)?;

        let jwk = cache
            .keys
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid.as_str()))
            .ok_or(VerifyError::UnknownKeyId)?;

        let decoding_key = DecodingKey::from_jwk(jwk).map_err(|_| VerifyError::Malformed)?;

        let mut validation = Validation::new(header.alg);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(std::slice::from_ref(issuer));
        }
        validation.validate_exp = true;

        let token_data = decode::<Claims>(token, &decoding_key, &validation).map_err(|err| {
            use jsonwebtoken::errors::ErrorKind;
            match err.kind() {
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Malformed,
            }
        })?;

        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verify_without_cached_keys_fails() {
        let verifier = AuthVerifier::new(
            "https://auth.invalid/jwks".to_string(),
            None,
            reqwest::Client::new(),
        );
        let result = verifier.verify("not-a-jwt").await;
        assert!(matches!(
            result,
            Err(VerifyError::Malformed) | Err(VerifyError::JwksUnavailable)
        ));
    }
}
