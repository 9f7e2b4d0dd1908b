//! # Certificate Fingerprints
//!
//! Deterministic digests of certificate secret contents.
//!
//! A fingerprint identifies the certificate material a pod was started with.
//! Pods carry it in an annotation; the reconciler compares that stamp with the
//! fingerprint of the secret as it is now.
//!
//! Entries are hashed in key order with every key and value length-prefixed,
//! so the digest does not depend on map iteration order and no two distinct
//! maps can produce the same byte stream.

use k8s_openapi::api::core::v1::Secret;
use sha2::{Digest, Sha256};
use std::fmt;

/// Prefix identifying the digest algorithm
pub const FINGERPRINT_PREFIX: &str = "sha256:";

/// Fingerprint of a referenced secret
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// The secret does not exist
    Absent,
    /// `sha256:<hex>` digest of the secret data
    Digest(String),
}

impl Fingerprint {
    /// The digest, if the secret exists
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        match self {
            Fingerprint::Absent => None,
            Fingerprint::Digest(d) => Some(d),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Absent => f.write_str("<absent>"),
            Fingerprint::Digest(d) => f.write_str(d),
        }
    }
}

/// Digest of key/value pairs, independent of their order
pub fn fingerprint_data<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut entries: Vec<(&str, &[u8])> = entries.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(b.1)));

    let mut hasher = Sha256::new();
    for (key, value) in entries {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    format!("{FINGERPRINT_PREFIX}{:x}", hasher.finalize())
}

/// Fingerprint of a secret's `data`
///
/// A secret with no data still exists and gets the digest of the empty map.
#[must_use]
pub fn fingerprint_secret(secret: Option<&Secret>) -> Fingerprint {
    let Some(secret) = secret else {
        return Fingerprint::Absent;
    };
    let digest = match &secret.data {
        Some(data) => fingerprint_data(data.iter().map(|(k, v)| (k.as_str(), v.0.as_slice()))),
        None => fingerprint_data(std::iter::empty()),
    };
    Fingerprint::Digest(digest)
}

/// Required keys that are missing from the secret or empty
#[must_use]
pub fn missing_keys(secret: &Secret, required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|key| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key.as_str()))
                .is_none_or(|value| value.0.is_empty())
        })
        .cloned()
        .collect()
}
