//! Per-hostname certificate resolution
//!
//! [`CertificateResolver::resolve`] never blocks on the certificate authority.
//! It answers from whatever material is usable right now and, for routed
//! hostnames, kicks off a background acquisition when the record is due one:
//!
//! ```text
//! Idle ──▶ Pending ──▶ Acquired ──(renewal window)──▶ Idle
//!             │
//!             └──────▶ Failed ──(cooldown elapsed)──▶ Pending
//! ```
//!
//! While a hostname has no usable issued certificate the shared certificate is
//! served if one is mounted, otherwise the process-wide self-signed one.

use crate::config::TlsConfig;
use crate::error::CertificateError;
use crate::labels::normalize_hostname;
use crate::routes::RouteTable;
use crate::shutdown::wait_for_shutdown;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use serde::Serialize;
use std::io::{BufReader, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const SELF_SIGNED_DIR: &str = ".self-signed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateSource {
    AcmeIssued,
    SharedFallback,
    SelfSigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    Idle,
    Pending,
    Acquired,
    Failed,
}

/// PEM output of a successful issuance
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_chain_pem: String,
    pub private_key_pem: String,
}

/// Certificate authority client
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, hostname: &str) -> Result<IssuedCertificate, CertificateError>;
}

/// Certificate and key on disk plus the parsed signing key
#[derive(Clone, Serialize)]
pub struct CertificateMaterial {
    pub source: CertificateSource,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    certified_key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("source", &self.source)
            .field("cert_path", &self.cert_path)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl CertificateMaterial {
    /// Read and parse a certificate/key pair from disk
    pub fn load(
        source: CertificateSource,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, CertificateError> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        Self::from_pem(source, &cert_pem, &key_pem, cert_path, key_path)
    }

    pub fn from_pem(
        source: CertificateSource,
        cert_pem: &[u8],
        key_pem: &[u8],
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, CertificateError> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_pem))
                .collect::<Result<_, _>>()
                .map_err(|e| CertificateError::Material(format!("unreadable certificate: {}", e)))?;
        let leaf = certs
            .first()
            .ok_or_else(|| CertificateError::Material("no certificate in PEM".to_string()))?;
        let expires_at = certificate_expiry(leaf);

        let key = load_private_key(key_pem)
            .ok_or_else(|| CertificateError::Material("no private key in PEM".to_string()))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| CertificateError::Material(format!("unsupported private key: {}", e)))?;

        Ok(Self {
            source,
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            expires_at,
            certified_key: Arc::new(CertifiedKey::new(certs, signing_key)),
        })
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }

    /// Expired, unknown expiry, or within `renew_before` of expiry
    fn needs_renewal(&self, now: DateTime<Utc>, renew_before: Duration) -> bool {
        match self.expires_at {
            Some(expires) => (expires - now)
                .to_std()
                .map_or(true, |remaining| remaining <= renew_before),
            None => true,
        }
    }
}

/// What the caller should present for a hostname
#[derive(Clone, Serialize)]
pub struct CertificateIdentity {
    pub hostname: String,
    pub source: CertificateSource,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub certified_key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for CertificateIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateIdentity")
            .field("hostname", &self.hostname)
            .field("source", &self.source)
            .field("cert_path", &self.cert_path)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl CertificateIdentity {
    fn new(hostname: &str, material: &CertificateMaterial) -> Self {
        Self {
            hostname: hostname.to_string(),
            source: material.source,
            cert_path: material.cert_path.clone(),
            key_path: material.key_path.clone(),
            expires_at: material.expires_at,
            certified_key: material.certified_key(),
        }
    }
}

/// Acquisition bookkeeping for one hostname; records are never deleted
#[derive(Debug, Clone, Serialize)]
pub struct CertificateRecord {
    pub hostname: String,
    pub state: AcquisitionState,
    /// Issued certificate, if any
    pub certificate: Option<CertificateMaterial>,
    pub last_failure: Option<DateTime<Utc>>,
    /// Consecutive failed acquisitions
    pub failures: u32,
}

impl CertificateRecord {
    fn new(hostname: String, cached: Option<CertificateMaterial>) -> Self {
        let state = if cached.is_some() {
            AcquisitionState::Acquired
        } else {
            AcquisitionState::Idle
        };
        Self {
            hostname,
            state,
            certificate: cached,
            last_failure: None,
            failures: 0,
        }
    }

    /// Whether an acquisition should start now
    fn due(&mut self, now: DateTime<Utc>, tls: &TlsConfig) -> bool {
        if self.state == AcquisitionState::Acquired {
            let renew = self
                .certificate
                .as_ref()
                .map_or(true, |cert| cert.needs_renewal(now, tls.renew_before()));
            if renew {
                info!(hostname = %self.hostname, "Certificate entering renewal window");
                self.state = AcquisitionState::Idle;
            }
        }

        match self.state {
            AcquisitionState::Idle => true,
            AcquisitionState::Failed => match self.last_failure {
                Some(failed_at) => (now - failed_at)
                    .to_std()
                    .map_or(false, |elapsed| elapsed >= tls.cooldown(self.failures)),
                None => true,
            },
            AcquisitionState::Pending | AcquisitionState::Acquired => false,
        }
    }

    fn usable_certificate(&self, now: DateTime<Utc>) -> Option<&CertificateMaterial> {
        self.certificate.as_ref().filter(|cert| cert.is_valid_at(now))
    }
}

/// Persisted certificates, one directory per hostname
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    pub fn new(dir: &Path) -> Result<Self, CertificateError> {
        if dir.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(CertificateError::Material(format!(
                "certificate store path cannot contain '..': {}",
                dir.display()
            )));
        }
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.canonicalize()?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths(&self, hostname: &str) -> (PathBuf, PathBuf) {
        let host_dir = self.dir.join(hostname);
        (host_dir.join(CERT_FILE), host_dir.join(KEY_FILE))
    }

    /// Previously issued certificate for `hostname`, if present and readable
    pub fn load(&self, hostname: &str) -> Option<CertificateMaterial> {
        let (cert_path, key_path) = self.paths(hostname);
        if !cert_path.exists() || !key_path.exists() {
            return None;
        }
        match CertificateMaterial::load(CertificateSource::AcmeIssued, &cert_path, &key_path) {
            Ok(material) => {
                debug!(hostname, expires_at = ?material.expires_at, "Loaded cached certificate");
                Some(material)
            }
            Err(e) => {
                warn!(hostname, error = %e, "Ignoring unreadable cached certificate");
                None
            }
        }
    }

    pub fn save(
        &self,
        hostname: &str,
        issued: &IssuedCertificate,
    ) -> Result<CertificateMaterial, CertificateError> {
        let (cert_path, key_path) = self.paths(hostname);
        let material = CertificateMaterial::from_pem(
            CertificateSource::AcmeIssued,
            issued.cert_chain_pem.as_bytes(),
            issued.private_key_pem.as_bytes(),
            &cert_path,
            &key_path,
        )?;

        let dir = self.dir.join(hostname);
        std::fs::create_dir_all(&dir)?;

        // Both halves are complete on disk before either replaces the active pair
        let staged_key = stage_file(&dir, issued.private_key_pem.as_bytes())?;
        let staged_cert = stage_file(&dir, issued.cert_chain_pem.as_bytes())?;
        staged_key.persist(&key_path).map_err(std::io::Error::from)?;
        staged_cert.persist(&cert_path).map_err(std::io::Error::from)?;

        info!(hostname, path = %cert_path.display(), "Certificate saved");
        Ok(material)
    }
}

/// Temporary file next to its destination, created owner-only
fn stage_file(dir: &Path, contents: &[u8]) -> std::io::Result<tempfile::NamedTempFile> {
    let mut staged = tempfile::Builder::new().prefix(".dockgate-").tempfile_in(dir)?;
    staged.write_all(contents)?;
    staged.as_file().sync_all()?;
    Ok(staged)
}

/// Write a file readable only by the owner
pub fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Generate the process-wide self-signed certificate and write it to the store
fn generate_self_signed(store: &CertificateStore) -> Result<CertificateMaterial, CertificateError> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| CertificateError::Material(format!("self-signed generation failed: {}", e)))?;

    let dir = store.dir().join(SELF_SIGNED_DIR);
    std::fs::create_dir_all(&dir)?;
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);
    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    std::fs::write(&cert_path, &cert_pem)?;
    write_private_file(&key_path, key_pem.as_bytes())?;

    CertificateMaterial::from_pem(
        CertificateSource::SelfSigned,
        cert_pem.as_bytes(),
        key_pem.as_bytes(),
        &cert_path,
        &key_path,
    )
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

fn certificate_expiry(cert: &CertificateDer<'_>) -> Option<DateTime<Utc>> {
    use x509_parser::prelude::*;

    match X509Certificate::from_der(cert.as_ref()) {
        Ok((_, parsed)) => DateTime::from_timestamp(parsed.validity().not_after.timestamp(), 0),
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            None
        }
    }
}

struct ResolverInner {
    records: DashMap<String, CertificateRecord>,
    routes: Arc<RouteTable>,
    issuer: Option<Arc<dyn CertificateIssuer>>,
    store: CertificateStore,
    shared: Option<CertificateMaterial>,
    self_signed: CertificateMaterial,
    tls: TlsConfig,
    runtime: Handle,
    shutdown_rx: watch::Receiver<bool>,
}

impl ResolverInner {
    fn fallback(&self) -> &CertificateMaterial {
        self.shared.as_ref().unwrap_or(&self.self_signed)
    }

    fn finish(&self, hostname: &str, result: Result<IssuedCertificate, CertificateError>) {
        let saved = result.and_then(|issued| self.store.save(hostname, &issued));

        let Some(mut record) = self.records.get_mut(hostname) else {
            return;
        };
        match saved {
            Ok(material) => {
                info!(hostname, expires_at = ?material.expires_at, "Certificate acquired");
                record.certificate = Some(material);
                record.state = AcquisitionState::Acquired;
                record.failures = 0;
            }
            Err(e) => {
                record.failures = record.failures.saturating_add(1);
                record.last_failure = Some(Utc::now());
                record.state = AcquisitionState::Failed;
                warn!(
                    hostname,
                    failures = record.failures,
                    cooldown_secs = self.tls.cooldown(record.failures).as_secs(),
                    error = %e,
                    "Certificate acquisition failed, serving fallback"
                );
            }
        }
    }

    fn abandon(&self, hostname: &str) {
        if let Some(mut record) = self.records.get_mut(hostname) {
            if record.state == AcquisitionState::Pending {
                record.state = AcquisitionState::Idle;
                debug!(hostname, "Certificate acquisition abandoned at shutdown");
            }
        }
    }
}

/// Shared handle; clones refer to the same records
#[derive(Clone)]
pub struct CertificateResolver {
    inner: Arc<ResolverInner>,
}

impl std::fmt::Debug for CertificateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateResolver")
            .field("records", &self.inner.records.len())
            .field("acme", &self.inner.issuer.is_some())
            .field("shared", &self.inner.shared.is_some())
            .finish()
    }
}

impl CertificateResolver {
    /// Must be called from within a tokio runtime
    pub fn new(
        tls: &TlsConfig,
        routes: Arc<RouteTable>,
        issuer: Option<Arc<dyn CertificateIssuer>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, CertificateError> {
        let runtime = Handle::try_current()
            .map_err(|e| CertificateError::Material(format!("no async runtime: {}", e)))?;
        let store = CertificateStore::new(&tls.store_dir)?;
        let self_signed = generate_self_signed(&store)?;

        let shared = tls.shared_dir.as_ref().and_then(|dir| {
            let cert_path = dir.join(CERT_FILE);
            let key_path = dir.join(KEY_FILE);
            match CertificateMaterial::load(CertificateSource::SharedFallback, &cert_path, &key_path) {
                Ok(material) => {
                    info!(path = %cert_path.display(), "Loaded shared fallback certificate");
                    Some(material)
                }
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Shared certificate unavailable, using self-signed fallback");
                    None
                }
            }
        });

        info!(
            store = %store.dir().display(),
            acme = issuer.is_some(),
            "Certificate resolver ready"
        );

        Ok(Self {
            inner: Arc::new(ResolverInner {
                records: DashMap::new(),
                routes,
                issuer,
                store,
                shared,
                self_signed,
                tls: tls.clone(),
                runtime,
                shutdown_rx,
            }),
        })
    }

    /// Certificate paths served when no issued certificate applies
    pub fn fallback_material(&self) -> &CertificateMaterial {
        self.inner.fallback()
    }

    pub fn resolve(&self, hostname: &str) -> CertificateIdentity {
        self.resolve_at(hostname, Utc::now())
    }

    pub(crate) fn resolve_at(&self, hostname: &str, now: DateTime<Utc>) -> CertificateIdentity {
        let inner = &self.inner;
        let Some(host) = normalize_hostname(hostname) else {
            return CertificateIdentity::new(hostname, inner.fallback());
        };

        // Hostnames outside the route table never create records or acquisitions
        if !inner.routes.contains(&host) {
            let served = inner
                .records
                .get(&host)
                .and_then(|record| record.usable_certificate(now).cloned());
            return CertificateIdentity::new(&host, served.as_ref().unwrap_or(inner.fallback()));
        }

        if !inner.records.contains_key(&host) {
            let cached = inner.store.load(&host);
            inner
                .records
                .entry(host.clone())
                .or_insert_with(|| CertificateRecord::new(host.clone(), cached));
        }

        let can_acquire = inner.issuer.is_some() && !*inner.shutdown_rx.borrow();
        let (start, served) = match inner.records.get_mut(&host) {
            Some(mut record) => {
                let start = can_acquire && record.due(now, &inner.tls);
                if start {
                    record.state = AcquisitionState::Pending;
                }
                (start, record.usable_certificate(now).cloned())
            }
            None => (false, None),
        };

        if start {
            self.spawn_acquisition(host.clone());
        }

        CertificateIdentity::new(&host, served.as_ref().unwrap_or(inner.fallback()))
    }

    fn spawn_acquisition(&self, hostname: String) {
        let inner = Arc::clone(&self.inner);
        let Some(issuer) = inner.issuer.clone() else {
            return;
        };
        let mut shutdown_rx = inner.shutdown_rx.clone();

        info!(hostname = %hostname, "Starting certificate acquisition");
        self.inner.runtime.spawn(async move {
            tokio::select! {
                result = issuer.issue(&hostname) => inner.finish(&hostname, result),
                _ = wait_for_shutdown(&mut shutdown_rx) => inner.abandon(&hostname),
            }
        });
    }

    pub fn record(&self, hostname: &str) -> Option<CertificateRecord> {
        self.inner.records.get(hostname).map(|r| r.value().clone())
    }

    /// All records, ordered by hostname
    pub fn records(&self) -> Vec<CertificateRecord> {
        let mut records: Vec<_> = self.inner.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        records
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let identity = match client_hello.server_name() {
            Some(name) => CertificateResolver::resolve(self, name),
            None => CertificateIdentity::new("", self.inner.fallback()),
        };
        Some(identity.certified_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::RouteEntry;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Issues real self-signed certificates, optionally failing or waiting for a release
    struct FakeIssuer {
        calls: AtomicUsize,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    impl FakeIssuer {
        fn new(fail: bool, gate: Option<Arc<Notify>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
                gate,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CertificateIssuer for FakeIssuer {
        async fn issue(&self, hostname: &str) -> Result<IssuedCertificate, CertificateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(CertificateError::acquisition(hostname, "rate limited"));
            }
            let rcgen::CertifiedKey { cert, key_pair } =
                rcgen::generate_simple_self_signed(vec![hostname.to_string()]).unwrap();
            Ok(IssuedCertificate {
                cert_chain_pem: cert.pem(),
                private_key_pem: key_pair.serialize_pem(),
            })
        }
    }

    fn routed(hosts: &[&str]) -> Arc<RouteTable> {
        let table = Arc::new(RouteTable::new());
        let entries: BTreeMap<String, RouteEntry> = hosts
            .iter()
            .map(|host| {
                (
                    host.to_string(),
                    RouteEntry {
                        hostname: host.to_string(),
                        upstream: "172.18.0.2:80".parse().unwrap(),
                        container_id: format!("c-{}", host),
                        updated_at: Utc::now(),
                    },
                )
            })
            .collect();
        table.commit(0, entries).unwrap();
        table
    }

    fn tls_config(store: &TempDir) -> TlsConfig {
        TlsConfig {
            email: Some("ops@example.com".to_string()),
            store_dir: store.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn write_shared(dir: &TempDir) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["*.example.com".to_string()]).unwrap();
        std::fs::write(dir.path().join(CERT_FILE), cert.pem()).unwrap();
        std::fs::write(dir.path().join(KEY_FILE), key_pair.serialize_pem()).unwrap();
    }

    async fn wait_for_state(resolver: &CertificateResolver, host: &str, state: AcquisitionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if resolver.record(host).map(|r| r.state) == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never reached {:?}", host, state));
    }

    #[tokio::test]
    async fn test_first_request_serves_self_signed_and_starts_acquisition() {
        let store = TempDir::new().unwrap();
        let issuer = FakeIssuer::new(false, None);
        let (_tx, rx) = watch::channel(false);
        let resolver = CertificateResolver::new(
            &tls_config(&store),
            routed(&["app.example.com"]),
            Some(issuer.clone()),
            rx,
        )
        .unwrap();

        let identity = resolver.resolve("app.example.com");
        assert_eq!(identity.source, CertificateSource::SelfSigned);
        assert!(identity.cert_path.exists());

        wait_for_state(&resolver, "app.example.com", AcquisitionState::Acquired).await;
        let identity = resolver.resolve("app.example.com");
        assert_eq!(identity.source, CertificateSource::AcmeIssued);
        assert_eq!(identity.cert_path, store.path().canonicalize().unwrap().join("app.example.com/cert.pem"));
        assert!(identity.expires_at.is_some());
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_start_one_acquisition() {
        let store = TempDir::new().unwrap();
        let gate = Arc::new(Notify::new());
        let issuer = FakeIssuer::new(false, Some(gate.clone()));
        let (_tx, rx) = watch::channel(false);
        let resolver = CertificateResolver::new(
            &tls_config(&store),
            routed(&["app.example.com"]),
            Some(issuer.clone()),
            rx,
        )
        .unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve("app.example.com").source })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), CertificateSource::SelfSigned);
        }

        assert_eq!(
            resolver.record("app.example.com").unwrap().state,
            AcquisitionState::Pending
        );
        gate.notify_one();
        wait_for_state(&resolver, "app.example.com", AcquisitionState::Acquired).await;
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_serves_shared_and_respects_cooldown() {
        let store = TempDir::new().unwrap();
        let shared = TempDir::new().unwrap();
        write_shared(&shared);
        let config = TlsConfig {
            shared_dir: Some(shared.path().to_path_buf()),
            ..tls_config(&store)
        };
        let issuer = FakeIssuer::new(true, None);
        let (_tx, rx) = watch::channel(false);
        let resolver =
            CertificateResolver::new(&config, routed(&["a.example.com"]), Some(issuer.clone()), rx)
                .unwrap();

        assert_eq!(
            resolver.resolve("a.example.com").source,
            CertificateSource::SharedFallback
        );
        wait_for_state(&resolver, "a.example.com", AcquisitionState::Failed).await;

        let record = resolver.record("a.example.com").unwrap();
        assert_eq!(record.failures, 1);
        let failed_at = record.last_failure.unwrap();

        // Inside the cooldown: fallback, no new attempt
        let identity = resolver.resolve_at("a.example.com", failed_at + chrono::Duration::seconds(30));
        assert_eq!(identity.source, CertificateSource::SharedFallback);
        assert_eq!(issuer.calls(), 1);

        // Cooldown elapsed: exactly one new attempt
        resolver.resolve_at("a.example.com", failed_at + chrono::Duration::seconds(61));
        wait_for_state(&resolver, "a.example.com", AcquisitionState::Failed).await;
        assert_eq!(issuer.calls(), 2);
        assert_eq!(resolver.record("a.example.com").unwrap().failures, 2);
    }

    #[tokio::test]
    async fn test_unrouted_hostname_never_acquires() {
        let store = TempDir::new().unwrap();
        let issuer = FakeIssuer::new(false, None);
        let (_tx, rx) = watch::channel(false);
        let resolver = CertificateResolver::new(
            &tls_config(&store),
            routed(&["app.example.com"]),
            Some(issuer.clone()),
            rx,
        )
        .unwrap();

        let identity = resolver.resolve("other.example.com");
        assert_eq!(identity.source, CertificateSource::SelfSigned);
        let identity = resolver.resolve("not a hostname");
        assert_eq!(identity.source, CertificateSource::SelfSigned);

        tokio::task::yield_now().await;
        assert_eq!(issuer.calls(), 0);
        assert!(resolver.records().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_abandons_acquisition_as_idle() {
        let store = TempDir::new().unwrap();
        let gate = Arc::new(Notify::new());
        let issuer = FakeIssuer::new(false, Some(gate));
        let (tx, rx) = watch::channel(false);
        let resolver = CertificateResolver::new(
            &tls_config(&store),
            routed(&["app.example.com"]),
            Some(issuer.clone()),
            rx,
        )
        .unwrap();

        resolver.resolve("app.example.com");
        assert_eq!(
            resolver.record("app.example.com").unwrap().state,
            AcquisitionState::Pending
        );
        while issuer.calls() == 0 {
            tokio::task::yield_now().await;
        }

        tx.send(true).unwrap();
        wait_for_state(&resolver, "app.example.com", AcquisitionState::Idle).await;
        assert_eq!(resolver.record("app.example.com").unwrap().failures, 0);

        // No new acquisitions once shutting down
        resolver.resolve("app.example.com");
        tokio::task::yield_now().await;
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn test_renewal_window_reacquires_while_serving_current() {
        let store = TempDir::new().unwrap();
        let gate = Arc::new(Notify::new());
        let issuer = FakeIssuer::new(false, Some(gate.clone()));
        let (_tx, rx) = watch::channel(false);
        let resolver = CertificateResolver::new(
            &tls_config(&store),
            routed(&["app.example.com"]),
            Some(issuer.clone()),
            rx,
        )
        .unwrap();

        resolver.resolve("app.example.com");
        gate.notify_one();
        wait_for_state(&resolver, "app.example.com", AcquisitionState::Acquired).await;
        let expires = resolver.resolve("app.example.com").expires_at.unwrap();

        let near_expiry = expires - chrono::Duration::days(10);
        let identity = resolver.resolve_at("app.example.com", near_expiry);
        assert_eq!(identity.source, CertificateSource::AcmeIssued);
        assert_eq!(
            resolver.record("app.example.com").unwrap().state,
            AcquisitionState::Pending
        );

        gate.notify_one();
        wait_for_state(&resolver, "app.example.com", AcquisitionState::Acquired).await;
        assert_eq!(issuer.calls(), 2);
    }

    #[tokio::test]
    async fn test_cached_certificate_loaded_on_first_request() {
        let store = TempDir::new().unwrap();
        let certs = CertificateStore::new(store.path()).unwrap();
        let issued = FakeIssuer::new(false, None).issue("app.example.com").await.unwrap();
        certs.save("app.example.com", &issued).unwrap();

        let issuer = FakeIssuer::new(false, None);
        let (_tx, rx) = watch::channel(false);
        let resolver = CertificateResolver::new(
            &tls_config(&store),
            routed(&["app.example.com"]),
            Some(issuer.clone()),
            rx,
        )
        .unwrap();

        let identity = resolver.resolve("APP.example.com.");
        assert_eq!(identity.hostname, "app.example.com");
        assert_eq!(identity.source, CertificateSource::AcmeIssued);
        tokio::task::yield_now().await;
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn test_without_issuer_records_stay_idle() {
        let store = TempDir::new().unwrap();
        let (_tx, rx) = watch::channel(false);
        let resolver =
            CertificateResolver::new(&tls_config(&store), routed(&["app.example.com"]), None, rx)
                .unwrap();

        assert_eq!(
            resolver.resolve("app.example.com").source,
            CertificateSource::SelfSigned
        );
        assert_eq!(
            resolver.record("app.example.com").unwrap().state,
            AcquisitionState::Idle
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_key_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let store = TempDir::new().unwrap();
        let certs = CertificateStore::new(store.path()).unwrap();
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["app.example.com".to_string()]).unwrap();
        let issued = IssuedCertificate {
            cert_chain_pem: cert.pem(),
            private_key_pem: key_pair.serialize_pem(),
        };
        let material = certs.save("app.example.com", &issued).unwrap();

        let mode = std::fs::metadata(&material.key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_save_replaces_pair_without_leftovers() {
        let store = TempDir::new().unwrap();
        let certs = CertificateStore::new(store.path()).unwrap();
        let issuer = FakeIssuer::new(false, None);

        let first = issuer.issue("app.example.com").await.unwrap();
        certs.save("app.example.com", &first).unwrap();
        let second = issuer.issue("app.example.com").await.unwrap();
        let material = certs.save("app.example.com", &second).unwrap();

        assert_eq!(
            std::fs::read_to_string(&material.cert_path).unwrap(),
            second.cert_chain_pem
        );
        assert_eq!(
            std::fs::read_to_string(&material.key_path).unwrap(),
            second.private_key_pem
        );
        let host_dir = material.cert_path.parent().unwrap();
        let mut names: Vec<String> = std::fs::read_dir(host_dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![CERT_FILE.to_string(), KEY_FILE.to_string()]);

        let loaded = certs.load("app.example.com").unwrap();
        assert_eq!(loaded.source, CertificateSource::AcmeIssued);
    }

    #[test]
    fn test_store_rejects_traversal() {
        assert!(CertificateStore::new(Path::new("../certs")).is_err());
        assert!(CertificateStore::new(Path::new("/var/lib/../../etc")).is_err());
    }

    #[test]
    fn test_invalid_material_is_rejected() {
        let result = CertificateMaterial::from_pem(
            CertificateSource::AcmeIssued,
            b"not a certificate",
            b"not a key",
            Path::new("cert.pem"),
            Path::new("key.pem"),
        );
        assert!(matches!(result, Err(CertificateError::Material(_))));
    }
}
