//! Token authority for the sync server.
//!
//! Access tokens are signed with HMAC-SHA256 and carry their own expiry, so
//! validation needs no token table. Revocation is per user.
//!
//! ## Token format
//!
//! Four dot-separated fields:
//! - user name, hex-encoded
//! - expiry, Unix millis in decimal
//! - 8 random bytes, hex-encoded, so every token is unique
//! - HMAC-SHA256 over the first three fields, hex-encoded

use crate::config::AuthConfig;
use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use strand_protocol::AccessToken;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Issues, validates and refreshes access tokens.
pub struct TokenAuthority {
    config: AuthConfig,
    revoked: RwLock<HashSet<String>>,
}

impl TokenAuthority {
    /// Creates an authority.
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// Returns the lifetime of issued tokens.
    pub fn token_expiry(&self) -> Duration {
        self.config.token_expiry
    }

    /// Issues a token for `user`.
    pub fn issue(&self, user: &str) -> ServerResult<AccessToken> {
        if self.is_revoked(user) {
            return Err(ServerError::AuthenticationFailed(format!(
                "user {user} is revoked"
            )));
        }

        let expires_at = SystemTime::now() + self.config.token_expiry;
        let nonce: [u8; 8] = rand::random();
        let claims = format!(
            "{}.{}.{}",
            hex::encode(user.as_bytes()),
            unix_millis(expires_at),
            hex::encode(nonce)
        );
        let signature = hex::encode(self.sign(claims.as_bytes())?);
        debug!(user, "token issued");
        Ok(AccessToken::new(
            format!("{claims}.{signature}"),
            user,
            expires_at,
        ))
    }

    /// Validates a token value and returns the user it was issued to.
    pub fn validate(&self, value: &str) -> ServerResult<String> {
        let (user, expires_at) = self.verify(value)?;
        if SystemTime::now() >= expires_at {
            return Err(ServerError::NotAuthorized("token expired".into()));
        }
        if self.is_revoked(&user) {
            return Err(ServerError::NotAuthorized(format!("user {user} is revoked")));
        }
        Ok(user)
    }

    /// Exchanges a genuine token, expired or not, for a fresh one.
    pub fn refresh(&self, token: &AccessToken) -> ServerResult<AccessToken> {
        let (user, _) = self.verify(&token.value)?;
        self.issue(&user)
    }

    /// Revokes `user`: existing tokens stop validating and no new ones are
    /// issued.
    pub fn revoke(&self, user: &str) {
        if self.revoked.write().insert(user.to_string()) {
            info!(user, "user revoked");
        }
    }

    /// Lifts a revocation.
    pub fn reinstate(&self, user: &str) {
        self.revoked.write().remove(user);
    }

    /// Returns true if `user` is revoked.
    pub fn is_revoked(&self, user: &str) -> bool {
        self.revoked.read().contains(user)
    }

    /// Checks the signature and returns the claims.
    fn verify(&self, value: &str) -> ServerResult<(String, SystemTime)> {
        let malformed = || ServerError::NotAuthorized("malformed token".into());

        let (claims, signature) = value.rsplit_once('.').ok_or_else(malformed)?;
        let signature = hex::decode(signature).map_err(|_| malformed())?;
        self.mac()?
            .chain_update(claims.as_bytes())
            .verify_slice(&signature)
            .map_err(|_| ServerError::NotAuthorized("invalid signature".into()))?;

        let mut fields = claims.split('.');
        let (Some(user), Some(expires), Some(_nonce), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed());
        };
        let user = hex::decode(user)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(malformed)?;
        let expires: u64 = expires.parse().map_err(|_| malformed())?;
        Ok((user, UNIX_EPOCH + Duration::from_millis(expires)))
    }

    fn sign(&self, data: &[u8]) -> ServerResult<Vec<u8>> {
        Ok(self
            .mac()?
            .chain_update(data)
            .finalize()
            .into_bytes()
            .to_vec())
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("invalid HMAC key: {e}")))
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
