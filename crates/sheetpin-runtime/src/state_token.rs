//! Signed OAuth `state` values.
//!
//! A state is `base64url(claims).base64url(hmac_sha256(claims))`. Claims name
//! the flow they belong to, so a writer-authorization state cannot complete a
//! workspace install and vice versa.

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const STATE_MAX_AGE_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatePurpose {
    SlackInstall,
    WriterAuthorization,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateClaims {
    purpose: StatePurpose,
    subject: String,
    issued_at: i64,
}

#[derive(Clone)]
pub struct StateSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for StateSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSigner")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl StateSigner {
    pub fn new(secret: &str) -> Result<Self> {
        let secret = secret.trim();
        if secret.is_empty() {
            bail!("state secret cannot be empty");
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
        })
    }

    pub fn sign(&self, purpose: StatePurpose, subject: &str) -> Result<String> {
        self.sign_at(purpose, subject, Utc::now())
    }

    fn sign_at(&self, purpose: StatePurpose, subject: &str, now: DateTime<Utc>) -> Result<String> {
        let claims = serde_json::to_vec(&StateClaims {
            purpose,
            subject: subject.to_string(),
            issued_at: now.timestamp(),
        })
        .context("failed to encode oauth state")?;
        let signature = self.mac()?.chain_update(&claims).finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            BASE64_URL.encode(&claims),
            BASE64_URL.encode(signature)
        ))
    }

    /// Returns the subject carried by a valid, unexpired state for `purpose`.
    pub fn verify(&self, purpose: StatePurpose, state: &str) -> Result<String> {
        self.verify_at(purpose, state, Utc::now())
    }

    fn verify_at(&self, purpose: StatePurpose, state: &str, now: DateTime<Utc>) -> Result<String> {
        let (encoded_claims, encoded_signature) = state
            .trim()
            .split_once('.')
            .ok_or_else(|| anyhow!("oauth state is malformed"))?;
        let claims = BASE64_URL
            .decode(encoded_claims)
            .context("oauth state claims are not base64")?;
        let signature = BASE64_URL
            .decode(encoded_signature)
            .context("oauth state signature is not base64")?;
        self.mac()?
            .chain_update(&claims)
            .verify_slice(&signature)
            .map_err(|_| anyhow!("oauth state signature verification failed"))?;

        let claims = serde_json::from_slice::<StateClaims>(&claims)
            .context("failed to decode oauth state claims")?;
        if claims.purpose != purpose {
            bail!("oauth state was issued for a different flow");
        }
        let age = now.timestamp() - claims.issued_at;
        if !(0..=STATE_MAX_AGE_SECONDS).contains(&age) {
            bail!("oauth state has expired");
        }
        Ok(claims.subject)
    }

    fn mac(&self) -> Result<Hmac<Sha256>> {
        Hmac::<Sha256>::new_from_slice(&self.secret).context("failed to initialize state signer")
    }
}
