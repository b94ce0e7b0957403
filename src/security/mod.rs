//! Request signing between the directory, storage nodes, and clients
//!
//! Tokens are HS256 JWTs scoped to one file id. An empty signing key
//! disables verification for that class of request, so a cluster can
//! run open or locked down per key. Write tokens are minted by the
//! directory at assign time and relayed on replication; read tokens are
//! only checked when a read key is configured.

use crate::common::{timestamp_now, Error, Result};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims: one token authorizes one file id.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// File id the token is scoped to; empty allows any
    pub fid: String,
    /// Expiration (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    pub iat: u64,
}

#[derive(Clone)]
pub struct Guard {
    signing_key: Vec<u8>,
    expires_after_secs: u64,
    read_signing_key: Vec<u8>,
    read_expires_after_secs: u64,
}

impl Guard {
    pub fn new(
        signing_key: &str,
        expires_after_secs: u64,
        read_signing_key: &str,
        read_expires_after_secs: u64,
    ) -> Guard {
        Guard {
            signing_key: signing_key.as_bytes().to_vec(),
            expires_after_secs,
            read_signing_key: read_signing_key.as_bytes().to_vec(),
            read_expires_after_secs,
        }
    }

    pub fn writes_guarded(&self) -> bool {
        !self.signing_key.is_empty()
    }

    pub fn reads_guarded(&self) -> bool {
        !self.read_signing_key.is_empty()
    }

    fn sign(key: &[u8], fid: &str, expires_after_secs: u64) -> Result<String> {
        let now = timestamp_now();
        let claims = Claims {
            fid: fid.to_string(),
            exp: now + expires_after_secs,
            iat: now,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(key))
            .map_err(|e| Error::Internal(format!("sign token: {}", e)))
    }

    /// Mint a write token for a file id. Empty when writes are open.
    pub fn sign_write(&self, fid: &str) -> Result<String> {
        if !self.writes_guarded() {
            return Ok(String::new());
        }
        Self::sign(&self.signing_key, fid, self.expires_after_secs)
    }

    pub fn sign_read(&self, fid: &str) -> Result<String> {
        if !self.reads_guarded() {
            return Ok(String::new());
        }
        Self::sign(&self.read_signing_key, fid, self.read_expires_after_secs)
    }

    fn verify(key: &[u8], token: &str, fid: &str) -> Result<()> {
        if token.is_empty() {
            return Err(Error::Unauthorized("missing token".to_string()));
        }
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(key),
            &Validation::default(),
        )
        .map_err(|e| Error::Unauthorized(format!("invalid token: {}", e)))?;
        // a token without a fid claim is a master token for any file
        if !data.claims.fid.is_empty() && data.claims.fid != fid {
            return Err(Error::Unauthorized(format!(
                "token not valid for {}",
                fid
            )));
        }
        Ok(())
    }

    /// Check a write/delete request. Open clusters pass everything.
    pub fn verify_write(&self, token: &str, fid: &str) -> Result<()> {
        if !self.writes_guarded() {
            return Ok(());
        }
        Self::verify(&self.signing_key, token, fid)
    }

    pub fn verify_read(&self, token: &str, fid: &str) -> Result<()> {
        if !self.reads_guarded() {
            return Ok(());
        }
        Self::verify(&self.read_signing_key, token, fid)
    }
}

/// Pull a token from `Authorization: Bearer ...` or a `jwt` query
/// parameter, in that order.
pub fn token_from_request(
    headers: &axum::http::HeaderMap,
    query: &std::collections::HashMap<String, String>,
) -> String {
    if let Some(auth) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return token.to_string();
        }
    }
    query.get("jwt").cloned().unwrap_or_default()
}
