//! ACME certificate management
//!
//! Certificates are obtained per hostname, on demand: the first TLS
//! handshake for an unknown SNI name triggers issuance in the background
//! (that handshake fails; retries succeed once the certificate is ready).
//! Before ordering anything the manager consults the host policy, so
//! certificates are only ever requested for names the route table currently
//! serves. Issued certificates and the account key live in the cache
//! directory and survive restarts; a background loop renews certificates
//! that expire within 30 days.
//!
//! Only the HTTP-01 challenge is supported; the token responder runs on the
//! plain HTTP listener.

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::{Mutex, RwLock};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::{HashMap, HashSet};
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Predicate consulted before issuing a certificate for a hostname
pub type HostPolicy = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// How long before expiry a certificate is renewed
const RENEWAL_DAYS: u64 = 30;

/// Renewal check interval
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<tokio::sync::RwLock<HashMap<String, String>>>,
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

/// ACME certificate manager with an on-disk cache
pub struct AcmeManager {
    directory_url: String,
    cache_dir: PathBuf,
    challenges: Http01Challenges,
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    pending: Mutex<HashSet<String>>,
    policy: HostPolicy,
    account: tokio::sync::OnceCell<Account>,
}

impl AcmeManager {
    /// Create a manager caching into `cache_dir`, gated by `policy`.
    ///
    /// Returns `Arc<Self>` because the TLS resolver and the background
    /// issuance tasks share the manager.
    pub fn new(cache_dir: PathBuf, policy: HostPolicy) -> Arc<Self> {
        Arc::new(Self {
            directory_url: LetsEncrypt::Production.url().to_string(),
            cache_dir,
            challenges: Http01Challenges::new(),
            certs: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            policy,
            account: tokio::sync::OnceCell::new(),
        })
    }

    pub fn challenges(&self) -> Http01Challenges {
        self.challenges.clone()
    }

    pub fn resolver(self: &Arc<Self>) -> Arc<CertResolver> {
        Arc::new(CertResolver {
            manager: Arc::clone(self),
        })
    }

    /// Number of certificates currently installed
    pub fn cert_count(&self) -> usize {
        self.certs.read().len()
    }

    fn cert_path(&self, domain: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.crt", sanitize_domain(domain)))
    }

    fn key_path(&self, domain: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.key", sanitize_domain(domain)))
    }

    /// Load certificates persisted by earlier runs. Expired ones are
    /// skipped; they will be re-issued on demand.
    pub fn load_cached_certs(&self) {
        let entries = match std::fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "crt").unwrap_or(true) {
                continue;
            }
            let Some(domain) = path.file_stem().and_then(|s| s.to_str()).map(String::from)
            else {
                continue;
            };
            match self.load_cert_files(&domain) {
                Ok(()) => info!(domain, "loaded cached certificate"),
                Err(e) => debug!(domain, error = %e, "skipping cached certificate"),
            }
        }
    }

    fn load_cert_files(&self, domain: &str) -> anyhow::Result<()> {
        let cert_data = std::fs::read(self.cert_path(domain))?;
        let key_data = std::fs::read(self.key_path(domain))?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(&cert_data[..]))
                .collect::<Result<Vec<_>, _>>()?;
        let cert = certs
            .first()
            .ok_or_else(|| anyhow::anyhow!("no certificate in {:?}", self.cert_path(domain)))?;
        if !is_cert_valid_for_days(cert, 0) {
            anyhow::bail!("certificate for {} has expired", domain);
        }

        let key = load_private_key(&key_data)
            .ok_or_else(|| anyhow::anyhow!("no private key in {:?}", self.key_path(domain)))?;
        self.install_cert(domain, certs, key)
    }

    fn install_cert(
        &self,
        domain: &str,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> anyhow::Result<()> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| anyhow::anyhow!("failed to create signing key: {}", e))?;
        let certified = Arc::new(CertifiedKey::new(certs, signing_key));
        self.certs.write().insert(domain.to_string(), certified);
        Ok(())
    }

    /// Save a certificate chain and key with restricted key permissions
    fn save_cert(&self, domain: &str, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::write(self.cert_path(domain), cert_chain_pem)?;

        let key_path = self.key_path(domain);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            std::io::Write::write_all(&mut file, private_key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, private_key_pem)?;
        }
        info!(domain, path = %self.cert_path(domain).display(), "certificate saved to cache");
        Ok(())
    }

    /// Load or create the ACME account
    async fn account(&self) -> anyhow::Result<&Account> {
        self.account
            .get_or_try_init(|| async {
                let account_path = self.cache_dir.join("account.json");
                if account_path.exists() {
                    debug!(path = %account_path.display(), "loading existing ACME account");
                    let data = std::fs::read_to_string(&account_path)?;
                    let credentials: AccountCredentials = serde_json::from_str(&data)?;
                    return Ok(Account::from_credentials(credentials).await?);
                }

                info!("creating new ACME account");
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.directory_url,
                    None,
                )
                .await?;

                std::fs::create_dir_all(&self.cache_dir)?;
                std::fs::write(&account_path, serde_json::to_string_pretty(&credentials)?)?;
                info!(path = %account_path.display(), "ACME account credentials saved");
                Ok(account)
            })
            .await
    }

    /// Kick off background issuance for a hostname unless one is already
    /// running.
    pub fn request_certificate(self: &Arc<Self>, domain: String) {
        {
            let mut pending = self.pending.lock();
            if !pending.insert(domain.clone()) {
                return;
            }
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match manager.issue(&domain).await {
                Ok(()) => info!(domain, "certificate issued"),
                Err(e) => error!(domain, error = %e, "certificate issuance failed"),
            }
            manager.pending.lock().remove(&domain);
        });
    }

    /// Run one ACME order for a single hostname via HTTP-01
    async fn issue(&self, domain: &str) -> anyhow::Result<()> {
        let account = self.account().await?;

        info!(domain, "requesting certificate");
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    anyhow::anyhow!("no HTTP-01 challenge offered for {}", domain)
                })?;

            let key_auth = order.key_authorization(challenge);
            self.challenges
                .set(challenge.token.clone(), key_auth.as_str().to_string())
                .await;
            order.set_challenge_ready(&challenge.url).await?;

            let mut attempts = 0;
            let result = loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                order.refresh().await?;
                let auths = order.authorizations().await?;
                let status = auths
                    .iter()
                    .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == domain))
                    .map(|a| &a.status);

                match status {
                    Some(AuthorizationStatus::Valid) => break Ok(()),
                    Some(AuthorizationStatus::Invalid) => {
                        break Err(anyhow::anyhow!("authorization failed for {}", domain))
                    }
                    Some(_) | None => {
                        attempts += 1;
                        if attempts > 30 {
                            break Err(anyhow::anyhow!("authorization timeout for {}", domain));
                        }
                        debug!(domain, attempt = attempts, "waiting for authorization");
                    }
                }
            };
            self.challenges.remove(&challenge.token).await;
            result?;
        }

        // wait for the order to become ready for finalization
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("order invalid for {}", domain),
                _ => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("order timeout for {}", domain);
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domain.to_string());
        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("order valid but no certificate returned");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("certificate timeout for {}", domain);
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                status => anyhow::bail!("unexpected order status: {:?}", status),
            }
        };

        self.save_cert(domain, &cert_chain_pem, &private_key.serialize_pem())?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_chain_pem.as_bytes()))
                .collect::<Result<Vec<_>, _>>()?;
        let key = PrivateKeyDer::try_from(private_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("failed to parse private key: {}", e))?;
        self.install_cert(domain, certs, key)
    }

    /// Periodically re-issue certificates expiring within the renewal
    /// window, as long as the host policy still covers them.
    pub async fn run_renewals(self: Arc<Self>) {
        loop {
            tokio::time::sleep(RENEWAL_INTERVAL).await;

            let expiring: Vec<String> = {
                let certs = self.certs.read();
                certs
                    .iter()
                    .filter(|(_, ck)| {
                        ck.cert
                            .first()
                            .map(|c| !is_cert_valid_for_days(c, RENEWAL_DAYS))
                            .unwrap_or(true)
                    })
                    .map(|(domain, _)| domain.clone())
                    .collect()
            };

            for domain in expiring {
                if (self.policy)(&domain) {
                    info!(domain, "certificate renewal needed");
                    self.request_certificate(domain);
                } else {
                    warn!(domain, "certificate expiring but host no longer routed");
                }
            }
        }
    }
}

/// SNI certificate resolver backed by the manager's cache.
///
/// A miss for a policy-approved name triggers background issuance; the
/// current handshake fails and later ones succeed.
pub struct CertResolver {
    manager: Arc<AcmeManager>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("certs", &self.manager.cert_count())
            .finish()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?.to_string();
        if let Some(cert) = self.manager.certs.read().get(&sni) {
            return Some(Arc::clone(cert));
        }
        if (self.manager.policy)(&sni) {
            self.manager.request_certificate(sni);
        } else {
            debug!(sni, "refusing certificate for unrouted hostname");
        }
        None
    }
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

fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "failed to parse X.509 certificate");
            return false;
        }
    };

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let expiry = parsed.validity().not_after.timestamp();

    let remaining = expiry - now;
    remaining >= 0 && (remaining as u64) / 86400 >= days
}

/// Domains double as cache file names
fn sanitize_domain(domain: &str) -> String {
    domain
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
