//! Credential vault: tenant bot tokens and the writer authorization handshake.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sheetpin_sheets::GoogleOAuthClient;
use sheetpin_store::{Store, StoreError, TenantWorkspace, WriterCredential};
use thiserror::Error;

use crate::state_token::{StatePurpose, StateSigner};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("writer authorization exchange failed: {0}")]
    ExchangeFailed(String),
    #[error("failed to build authorization url: {0}")]
    AuthorizationUrl(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Provider half of the writer authorization handshake.
#[async_trait]
pub trait WriterAuthorizer: Send + Sync {
    fn authorization_url(&self, state: &str) -> anyhow::Result<String>;
    /// Trades a one-time code for credential payload to persist.
    async fn exchange_code(&self, code: &str) -> anyhow::Result<Value>;
}

#[async_trait]
impl WriterAuthorizer for GoogleOAuthClient {
    fn authorization_url(&self, state: &str) -> anyhow::Result<String> {
        GoogleOAuthClient::authorization_url(self, state)
    }

    async fn exchange_code(&self, code: &str) -> anyhow::Result<Value> {
        GoogleOAuthClient::exchange_code(self, code)
            .await?
            .to_payload()
    }
}

#[derive(Clone)]
pub struct CredentialVault {
    store: Arc<dyn Store>,
    authorizer: Arc<dyn WriterAuthorizer>,
    signer: StateSigner,
}

impl CredentialVault {
    pub fn new(
        store: Arc<dyn Store>,
        authorizer: Arc<dyn WriterAuthorizer>,
        signer: StateSigner,
    ) -> Self {
        Self {
            store,
            authorizer,
            signer,
        }
    }

    pub async fn store_tenant_token(&self, tenant: TenantWorkspace) -> Result<(), VaultError> {
        tracing::info!(team_id = %tenant.team_id, "storing tenant bot token");
        self.store.upsert_tenant(tenant).await?;
        Ok(())
    }

    pub async fn get_tenant_token(
        &self,
        team_id: &str,
    ) -> Result<Option<TenantWorkspace>, VaultError> {
        Ok(self.store.get_tenant(team_id).await?)
    }

    pub async fn list_tenants(&self) -> Result<Vec<TenantWorkspace>, VaultError> {
        Ok(self.store.list_tenants().await?)
    }

    /// Builds the consent URL whose signed state carries `writer_ref`.
    pub fn begin_writer_authorization(&self, writer_ref: &str) -> Result<String, VaultError> {
        let state = self
            .signer
            .sign(StatePurpose::WriterAuthorization, writer_ref)
            .map_err(|error| VaultError::AuthorizationUrl(error.to_string()))?;
        self.authorizer
            .authorization_url(&state)
            .map_err(|error| VaultError::AuthorizationUrl(error.to_string()))
    }

    /// Completes the handshake and returns the writer reference now bound.
    ///
    /// The code is marked consumed before the provider is contacted, so a
    /// replayed code fails without a second exchange.
    pub async fn complete_writer_authorization(
        &self,
        code: &str,
        state: &str,
    ) -> Result<String, VaultError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(VaultError::ExchangeFailed(
                "authorization code is empty".to_string(),
            ));
        }
        let writer_ref = self
            .signer
            .verify(StatePurpose::WriterAuthorization, state)
            .map_err(|error| VaultError::ExchangeFailed(error.to_string()))?;

        if !self.store.consume_exchange_code(&code_digest(code)).await? {
            tracing::warn!(writer_ref = %writer_ref, "rejected reused authorization code");
            return Err(VaultError::ExchangeFailed(
                "authorization code was already used".to_string(),
            ));
        }

        let payload = self
            .authorizer
            .exchange_code(code)
            .await
            .map_err(|error| VaultError::ExchangeFailed(format!("{error:#}")))?;
        self.store
            .put_writer_credential(WriterCredential::new(writer_ref.clone(), payload))
            .await?;
        tracing::info!(writer_ref = %writer_ref, "writer credential bound");
        Ok(writer_ref)
    }

    pub async fn get_writer_credential(
        &self,
        writer_ref: &str,
    ) -> Result<Option<WriterCredential>, VaultError> {
        Ok(self.store.get_writer_credential(writer_ref).await?)
    }

    pub async fn store_refreshed_writer_credential(
        &self,
        writer_ref: &str,
        payload: Value,
    ) -> Result<(), VaultError> {
        self.store
            .put_writer_credential(WriterCredential::new(writer_ref, payload))
            .await?;
        Ok(())
    }
}

fn code_digest(code: &str) -> String {
    Sha256::digest(code.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use sheetpin_store::{InMemoryStore, TenantWorkspace};

    use super::{code_digest, CredentialVault, VaultError};
    use crate::state_token::{StatePurpose, StateSigner};
    use crate::test_support::FakeAuthorizer;

    fn vault() -> (CredentialVault, Arc<FakeAuthorizer>, StateSigner) {
        let authorizer = Arc::new(FakeAuthorizer::default());
        let signer = StateSigner::new("vault-secret").expect("signer");
        let vault = CredentialVault::new(
            Arc::new(InMemoryStore::new()),
            authorizer.clone(),
            signer.clone(),
        );
        (vault, authorizer, signer)
    }

    fn state_from_url(url: &str) -> String {
        url.split_once("state=")
            .map(|(_, state)| state.to_string())
            .expect("state in url")
    }

    #[tokio::test]
    async fn functional_writer_authorization_handshake_binds_credential() {
        let (vault, authorizer, _) = vault();
        let url = vault
            .begin_writer_authorization("T1:U1")
            .expect("authorization url");
        assert!(url.starts_with("https://consent.test/auth?state="));

        let writer_ref = vault
            .complete_writer_authorization("code-1", &state_from_url(&url))
            .await
            .expect("complete");
        assert_eq!(writer_ref, "T1:U1");
        let credential = vault
            .get_writer_credential("T1:U1")
            .await
            .expect("get")
            .expect("credential");
        assert_eq!(credential.payload, json!({"access_token": "token-for-code-1"}));
        assert_eq!(authorizer.exchanges(), vec!["code-1".to_string()]);
    }

    #[tokio::test]
    async fn regression_reused_code_fails_without_second_exchange() {
        let (vault, authorizer, _) = vault();
        let state = state_from_url(&vault.begin_writer_authorization("T1:U1").expect("url"));
        vault
            .complete_writer_authorization("code-1", &state)
            .await
            .expect("first exchange");

        let error = vault
            .complete_writer_authorization("code-1", &state)
            .await
            .expect_err("reused code");
        assert!(matches!(error, VaultError::ExchangeFailed(_)));
        assert_eq!(authorizer.exchanges().len(), 1);
    }

    #[tokio::test]
    async fn regression_forged_state_fails_before_consuming_code() {
        let (vault, authorizer, _) = vault();
        let forged = StateSigner::new("attacker")
            .expect("signer")
            .sign(StatePurpose::WriterAuthorization, "T1:U1")
            .expect("sign");

        let error = vault
            .complete_writer_authorization("code-1", &forged)
            .await
            .expect_err("forged state");
        assert!(matches!(error, VaultError::ExchangeFailed(_)));
        assert!(authorizer.exchanges().is_empty());
        assert!(vault
            .get_writer_credential("T1:U1")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn functional_provider_failure_is_exchange_failed_and_binds_nothing() {
        let (vault, authorizer, signer) = vault();
        authorizer.fail_next();
        let state = signer
            .sign(StatePurpose::WriterAuthorization, "T1:U2")
            .expect("sign");

        let error = vault
            .complete_writer_authorization("code-2", &state)
            .await
            .expect_err("provider failure");
        assert!(matches!(error, VaultError::ExchangeFailed(_)));
        assert!(vault
            .get_writer_credential("T1:U2")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn unit_tenant_token_round_trip() {
        let (vault, _, _) = vault();
        vault
            .store_tenant_token(TenantWorkspace::new("T1", "Acme", "xoxb-1"))
            .await
            .expect("store");
        let tenant = vault
            .get_tenant_token("T1")
            .await
            .expect("get")
            .expect("tenant");
        assert_eq!(tenant.bot_token, "xoxb-1");
        assert!(vault.get_tenant_token("T404").await.expect("get").is_none());
        assert_eq!(vault.list_tenants().await.expect("list").len(), 1);
    }

    #[test]
    fn unit_code_digest_is_sha256_hex() {
        assert_eq!(
            code_digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
