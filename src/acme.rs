//! ACME (Let's Encrypt) certificate issuance
//!
//! Issues one certificate per routed hostname using the HTTP-01 challenge. The
//! serving engine forwards `/.well-known/acme-challenge/` to the admin API,
//! which answers from [`Http01Challenges`].
//!
//! The ACME account key is cached unencrypted in the certificate store
//! (`account.json`); keep the store on a filesystem only the service user can
//! read.

use crate::certs::{CertificateIssuer, IssuedCertificate};
use crate::config::TlsConfig;
use crate::error::CertificateError;
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 30;

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Issues certificates from an ACME directory
pub struct AcmeIssuer {
    email: String,
    directory_url: String,
    account_path: PathBuf,
    challenges: Http01Challenges,
    account: OnceCell<Account>,
}

impl AcmeIssuer {
    pub fn new(config: &TlsConfig, challenges: Http01Challenges) -> anyhow::Result<Self> {
        let email = config
            .email
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| anyhow::anyhow!("ACME email is required for account creation"))?;

        Ok(Self {
            email,
            directory_url: config
                .directory_url
                .clone()
                .unwrap_or_else(|| LetsEncrypt::Production.url().to_string()),
            account_path: config.store_dir.join("account.json"),
            challenges,
            account: OnceCell::new(),
        })
    }

    /// Load or create the ACME account, once per process
    async fn account(&self) -> anyhow::Result<&Account> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> anyhow::Result<Account> {
        if self.account_path.exists() {
            debug!(path = %self.account_path.display(), "Loading existing ACME account");
            let data = tokio::fs::read_to_string(&self.account_path).await?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!(directory = %self.directory_url, "Creating new ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", self.email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        if let Some(parent) = self.account_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(&credentials)?;
        crate::certs::write_private_file(&self.account_path, data.as_bytes())?;
        info!(path = %self.account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    async fn obtain(&self, hostname: &str) -> anyhow::Result<IssuedCertificate> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(hostname.to_string())];

        info!(hostname, "Requesting certificate");
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let mut tokens = Vec::new();
        let result = self.authorize(&mut order, hostname, &mut tokens).await;
        for token in &tokens {
            self.challenges.remove(token).await;
        }
        result?;

        wait_until_ready(&mut order).await?;

        let mut params = CertificateParams::new(vec![hostname.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, hostname.to_string());
        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(cert) => break cert,
                    None => anyhow::bail!("Order valid but no certificate returned"),
                },
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Certificate timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                status => anyhow::bail!("Unexpected order status: {:?}", status),
            }
        };

        info!(hostname, "Certificate obtained");
        Ok(IssuedCertificate {
            cert_chain_pem,
            private_key_pem: private_key.serialize_pem(),
        })
    }

    /// Publish HTTP-01 answers and wait for every authorization to turn valid
    async fn authorize(
        &self,
        order: &mut Order,
        hostname: &str,
        tokens: &mut Vec<String>,
    ) -> anyhow::Result<()> {
        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not offered for {}", hostname))?;

            let key_auth = order.key_authorization(challenge);
            debug!(hostname, token = %challenge.token, "Publishing HTTP-01 challenge");
            self.challenges
                .set(challenge.token.clone(), key_auth.as_str().to_string())
                .await;
            tokens.push(challenge.token.clone());

            order.set_challenge_ready(&challenge.url).await?;
        }

        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await?;

            let authorizations = order.authorizations().await?;
            if authorizations
                .iter()
                .any(|a| a.status == AuthorizationStatus::Invalid)
            {
                anyhow::bail!("Authorization failed for {}", hostname);
            }
            if authorizations
                .iter()
                .all(|a| a.status == AuthorizationStatus::Valid)
            {
                info!(hostname, "Authorization valid");
                return Ok(());
            }

            attempts += 1;
            if attempts > MAX_POLL_ATTEMPTS {
                anyhow::bail!("Authorization timeout for {}", hostname);
            }
            debug!(hostname, attempt = attempts, "Waiting for authorization");
        }
    }
}

async fn wait_until_ready(order: &mut Order) -> anyhow::Result<()> {
    let mut attempts = 0;
    loop {
        match order.state().status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => anyhow::bail!("Order invalid"),
            OrderStatus::Pending | OrderStatus::Processing => {
                attempts += 1;
                if attempts > MAX_POLL_ATTEMPTS {
                    anyhow::bail!("Order timeout");
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                order.refresh().await?;
            }
        }
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(&self, hostname: &str) -> Result<IssuedCertificate, CertificateError> {
        self.obtain(hostname)
            .await
            .map_err(|e| CertificateError::acquisition(hostname, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http01_challenges() {
        let challenges = Http01Challenges::new();

        challenges
            .set("token123".to_string(), "key_auth_123".to_string())
            .await;

        assert_eq!(
            challenges.get("token123").await,
            Some("key_auth_123".to_string())
        );
        assert_eq!(challenges.get("nonexistent").await, None);

        challenges.remove("token123").await;
        assert_eq!(challenges.get("token123").await, None);
    }

    #[test]
    fn test_issuer_requires_email() {
        let config = TlsConfig::default();
        assert!(AcmeIssuer::new(&config, Http01Challenges::new()).is_err());
    }

    #[test]
    fn test_issuer_defaults_to_production_directory() {
        let config = TlsConfig {
            email: Some("ops@example.com".to_string()),
            store_dir: PathBuf::from("/tmp/dockgate-certs"),
            ..Default::default()
        };
        let issuer = AcmeIssuer::new(&config, Http01Challenges::new()).unwrap();
        assert_eq!(issuer.directory_url, LetsEncrypt::Production.url());
        assert_eq!(issuer.account_path, PathBuf::from("/tmp/dockgate-certs/account.json"));
    }
}
