//! Privacy-preserving lookup.
//!
//! Clients never send a plaintext address. They fetch [`HashDetails`], compute
//! `hash_address(algorithm, address, medium, pepper)` locally, and submit the
//! resulting hashes. The resolver answers from the `hashes` table, which the
//! [`HashIndexer`] fills from a [`Directory`].
//!
//! Only hashes stored under an acceptable pepper (current, or previous for one
//! rotation interval) ever resolve.

mod directory;
mod indexer;

pub use directory::{Directory, DirectoryEntry, StaticDirectory};
pub use indexer::{HashIndexer, IndexStats};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use crate::backend::{Backend, Match, Table, Value};
use crate::config::LookupConfig;
use crate::error::{Error, Result};
use crate::pepper::PepperManager;

/// Hashes per storage round-trip; keeps `IN (...)` under every engine's
/// bound-parameter limit.
const QUERY_CHUNK: usize = 500;

// ── Hashing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub const ALL: [Algorithm; 2] = [Algorithm::Sha256, Algorithm::Sha512];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    fn digest(self, input: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(input).to_vec(),
            Self::Sha512 => Sha512::digest(input).to_vec(),
        }
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(Error::invalid(format!("unsupported algorithm `{other}`"))),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of third-party address being hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    Email,
    Phone,
}

impl Medium {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }
}

impl FromStr for Medium {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" | "mail" => Ok(Self::Email),
            "phone" | "msisdn" => Ok(Self::Phone),
            other => Err(Error::invalid(format!("unsupported medium `{other}`"))),
        }
    }
}

impl std::fmt::Display for Medium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unpadded URL-safe base64 of `digest("{address} {medium} {pepper}")`.
pub fn hash_address(algorithm: Algorithm, address: &str, medium: Medium, pepper: &str) -> String {
    let input = format!("{address} {} {pepper}", medium.as_str());
    URL_SAFE_NO_PAD.encode(algorithm.digest(input.as_bytes()))
}

// ── Resolver ────────────────────────────────────────────────────────

/// What clients need to hash addresses before a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashDetails {
    pub algorithms: Vec<Algorithm>,
    pub lookup_pepper: String,
}

pub struct LookupResolver {
    backend: Arc<dyn Backend>,
    pepper: Arc<PepperManager>,
    algorithms: Vec<Algorithm>,
    max_batch: usize,
}

impl LookupResolver {
    pub fn new(
        backend: Arc<dyn Backend>,
        pepper: Arc<PepperManager>,
        config: &LookupConfig,
    ) -> Result<Self> {
        let algorithms = parse_algorithms(&config.algorithms)?;
        Ok(Self {
            backend,
            pepper,
            algorithms,
            max_batch: config.max_batch,
        })
    }

    pub fn hash_details(&self) -> HashDetails {
        HashDetails {
            algorithms: self.algorithms.clone(),
            lookup_pepper: self.pepper.current_salt(),
        }
    }

    /// Validate the algorithm and pepper a client claims to have hashed with.
    pub fn check_request(&self, algorithm: &str, pepper: &str) -> Result<Algorithm> {
        let algorithm: Algorithm = algorithm.parse()?;
        if !self.algorithms.contains(&algorithm) {
            return Err(Error::invalid(format!("algorithm `{algorithm}` is not enabled")));
        }
        if !self.pepper.is_acceptable(pepper) {
            return Err(Error::invalid("pepper is not current"));
        }
        Ok(algorithm)
    }

    /// Map each known hash to its identifier. Unknown hashes are absent from
    /// the result.
    pub async fn resolve<S: AsRef<str>>(&self, hashes: &[S]) -> Result<HashMap<String, String>> {
        if hashes.is_empty() {
            return Err(Error::invalid("no hashes to look up"));
        }
        if hashes.len() > self.max_batch {
            return Err(Error::invalid(format!(
                "{} hashes exceeds the batch limit of {}",
                hashes.len(),
                self.max_batch
            )));
        }

        let unique: Vec<&str> = hashes
            .iter()
            .map(AsRef::as_ref)
            .filter(|h| !h.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let peppers = self.pepper.snapshot();
        let acceptable =
            |p: &str| p == peppers.current || peppers.previous.as_deref() == Some(p);

        let mut mappings = HashMap::new();
        for chunk in unique.chunks(QUERY_CHUNK) {
            let rows = self
                .backend
                .get(
                    Table::Hashes,
                    &["hash", "value", "pepper"],
                    "hash",
                    chunk.iter().copied().collect::<Match>(),
                )
                .await?;

            for row in rows {
                let field = |name: &str| row.get(name).and_then(Value::as_str);
                let (Some(hash), Some(value), Some(pepper)) =
                    (field("hash"), field("value"), field("pepper"))
                else {
                    continue;
                };
                if acceptable(pepper) {
                    mappings
                        .entry(hash.to_string())
                        .or_insert_with(|| value.to_string());
                }
            }
        }

        tracing::debug!(requested = unique.len(), matched = mappings.len(), "Lookup resolved");
        Ok(mappings)
    }
}

pub(crate) fn parse_algorithms(names: &[String]) -> Result<Vec<Algorithm>> {
    let mut algorithms = Vec::with_capacity(names.len());
    for name in names {
        let algorithm: Algorithm = name.parse()?;
        if !algorithms.contains(&algorithm) {
            algorithms.push(algorithm);
        }
    }
    if algorithms.is_empty() {
        return Err(Error::invalid("no lookup algorithm configured"));
    }
    Ok(algorithms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{record, SqliteBackend};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        backend: Arc<dyn Backend>,
        pepper: Arc<PepperManager>,
        resolver: LookupResolver,
    }

    async fn fixture(config: LookupConfig) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(
            SqliteBackend::open(&tmp.path().join("lookup.db"), 4)
                .await
                .unwrap(),
        );
        let pepper = Arc::new(PepperManager::load(Arc::clone(&backend)).await.unwrap());
        let resolver =
            LookupResolver::new(Arc::clone(&backend), Arc::clone(&pepper), &config).unwrap();
        Fixture { _tmp: tmp, backend, pepper, resolver }
    }

    async fn register(f: &Fixture, hash: &str, pepper: &str, value: &str) {
        f.backend
            .insert(
                Table::Hashes,
                record([
                    ("hash", hash),
                    ("pepper", pepper),
                    ("algorithm", "sha256"),
                    ("medium", "email"),
                    ("value", value),
                ]),
            )
            .await
            .unwrap();
    }

    #[test]
    fn hash_matches_known_vector() {
        // sha256("alice@example.com email matrixrocks"), unpadded url-safe base64
        let hash = hash_address(Algorithm::Sha256, "alice@example.com", Medium::Email, "matrixrocks");
        assert_eq!(hash, "4kenr7N9drpCJ4AfalmlGQVsOn3o2RHjkADUpXJWZUc");
        assert!(!hash.contains('='));

        let long = hash_address(Algorithm::Sha512, "alice@example.com", Medium::Email, "matrixrocks");
        assert_eq!(long.len(), 86);
        assert_ne!(
            hash,
            hash_address(Algorithm::Sha256, "alice@example.com", Medium::Phone, "matrixrocks")
        );
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("SHA256".parse::<Algorithm>().unwrap(), Algorithm::Sha256);
        assert_eq!("msisdn".parse::<Medium>().unwrap(), Medium::Phone);
        assert!(matches!("md5".parse::<Algorithm>(), Err(Error::InvalidInput(_))));
        assert!(parse_algorithms(&[]).is_err());
        assert_eq!(
            parse_algorithms(&["sha512".into(), "sha512".into()]).unwrap(),
            vec![Algorithm::Sha512]
        );
    }

    #[tokio::test]
    async fn empty_batch_is_invalid() {
        let f = fixture(LookupConfig::default()).await;
        let err = f.resolver.resolve::<&str>(&[]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn oversized_batch_is_invalid() {
        let f = fixture(LookupConfig { max_batch: 2, ..LookupConfig::default() }).await;
        let err = f.resolver.resolve(&["a", "b", "c"]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn only_registered_hashes_resolve() {
        let f = fixture(LookupConfig::default()).await;
        let pepper = f.pepper.current_salt();
        register(&f, "h1", &pepper, "@dwho:example.com").await;

        let found = f.resolver.resolve(&["h1", "h2", "h1"]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["h1"], "@dwho:example.com");
    }

    #[tokio::test]
    async fn rows_under_unknown_pepper_never_resolve() {
        let f = fixture(LookupConfig::default()).await;
        register(&f, "stale", "some-retired-pepper", "@rtyler:example.com").await;
        assert!(f.resolver.resolve(&["stale"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn previous_pepper_is_honoured_for_one_rotation() {
        let f = fixture(LookupConfig::default()).await;
        let p0 = f.pepper.current_salt();
        register(&f, "old", &p0, "@dwho:example.com").await;

        f.pepper.rotate().await.unwrap();
        assert_eq!(f.resolver.resolve(&["old"]).await.unwrap().len(), 1);
        assert!(f.resolver.check_request("sha256", &p0).is_ok());

        f.pepper.rotate().await.unwrap();
        assert!(f.resolver.resolve(&["old"]).await.unwrap().is_empty());
        assert!(f.resolver.check_request("sha256", &p0).is_err());
    }

    #[tokio::test]
    async fn hash_details_advertise_current_pepper() {
        let f = fixture(LookupConfig {
            algorithms: vec!["sha256".into()],
            ..LookupConfig::default()
        })
        .await;
        let details = f.resolver.hash_details();
        assert_eq!(details.algorithms, vec![Algorithm::Sha256]);
        assert_eq!(details.lookup_pepper, f.pepper.current_salt());

        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["algorithms"][0], "sha256");

        assert!(f.resolver.check_request("sha512", &details.lookup_pepper).is_err());
        assert!(f.resolver.check_request("sha256", "nope").is_err());
    }
}
