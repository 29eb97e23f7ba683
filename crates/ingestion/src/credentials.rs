//! Credential sources for reading buckets that belong to another account.

use async_trait::async_trait;
use aws_credential_types::provider::ProvideCredentials;
use tracing::{debug, instrument};

use storage::StorageCredentials;

use crate::error::DiscoveryError;

/// Supplies credentials before a cross-account store is opened.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self) -> Result<StorageCredentials, DiscoveryError>;
}

/// Fixed credentials (local MinIO, tests).
pub struct StaticCredentialProvider {
    credentials: StorageCredentials,
}

impl StaticCredentialProvider {
    pub fn new(credentials: StorageCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credentials(&self) -> Result<StorageCredentials, DiscoveryError> {
        Ok(self.credentials.clone())
    }
}

/// Assumes an IAM role in the bucket owner's account through STS.
pub struct StsAssumeRoleProvider {
    role_arn: String,
    session_name: String,
    external_id: Option<String>,
    region: String,
}

impl StsAssumeRoleProvider {
    pub fn new(role_arn: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            role_arn: role_arn.into(),
            session_name: "granule-discovery".to_string(),
            external_id: None,
            region: region.into(),
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

#[async_trait]
impl CredentialProvider for StsAssumeRoleProvider {
    #[instrument(skip(self), fields(role = %self.role_arn))]
    async fn credentials(&self) -> Result<StorageCredentials, DiscoveryError> {
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.region.clone()))
            .load()
            .await;

        let mut builder = aws_config::sts::AssumeRoleProvider::builder(&self.role_arn)
            .session_name(&self.session_name)
            .configure(&base);
        if let Some(external_id) = &self.external_id {
            builder = builder.external_id(external_id);
        }
        let provider = builder.build().await;

        let creds = provider
            .provide_credentials()
            .await
            .map_err(|e| DiscoveryError::Credentials(e.to_string()))?;
        debug!("Assumed cross-account role");

        Ok(StorageCredentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().map(str::to_string),
        })
    }
}
