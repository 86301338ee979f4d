//! Layer fingerprints.
//!
//! A fingerprint identifies everything that can influence the result of a
//! build step: the fingerprint of the step before it, the step itself after
//! variable expansion together with the execution context it depends on,
//! and the content hashes of the files it reads. Because every fingerprint
//! chains its parent, a change at step N changes every fingerprint after it.

use std::collections::BTreeMap;
use std::fmt;

use kiln_core::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::dockerfile::Instruction;

const DOMAIN: &str = "kiln-layer-v1";

/// Hex-encoded SHA256 identifying a layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of an external base image with the given digest.
    pub fn for_image(digest: &str) -> Self {
        let mut hasher = FieldHasher::new();
        hasher.field(DOMAIN);
        hasher.field("image");
        hasher.field(digest);
        hasher.finish()
    }

    /// Fingerprint of a step.
    ///
    /// `inputs` are `(path, content hash)` pairs and may be in any order.
    pub fn compute(
        parent: Option<&Fingerprint>,
        normalized: &str,
        inputs: &[(String, String)],
    ) -> Self {
        let mut sorted: Vec<&(String, String)> = inputs.iter().collect();
        sorted.sort();

        let mut hasher = FieldHasher::new();
        hasher.field(DOMAIN);
        hasher.field(parent.map(Fingerprint::as_str).unwrap_or(""));
        hasher.field(normalized);
        hasher.field(&sorted.len().to_string());
        for (path, hash) in sorted {
            hasher.field(path);
            hasher.field(hash);
        }
        hasher.finish()
    }

    /// Parse a stored fingerprint, rejecting anything but 64 hex digits.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit());
        valid.then(|| Fingerprint(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log output.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Length-prefixed field hashing, so `("ab", "c")` and `("a", "bc")` differ.
struct FieldHasher(Sha256);

impl FieldHasher {
    fn new() -> Self {
        FieldHasher(Sha256::new())
    }

    fn field(&mut self, value: &str) {
        self.0.update((value.len() as u64).to_le_bytes());
        self.0.update(value.as_bytes());
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(hex::encode(self.0.finalize()))
    }
}

/// Everything besides input files that determines a step's result.
///
/// Serialized to canonical JSON: struct fields keep declaration order and
/// maps are sorted.
#[derive(Debug, Serialize)]
pub struct StepKey<'a> {
    /// The step with variables already expanded
    pub instruction: &'a Instruction,
    pub workdir: &'a str,
    /// Present for RUN only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<&'a BTreeMap<String, String>>,
    /// Present for RUN only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<&'a BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<&'a str>,
}

impl StepKey<'_> {
    pub fn normalize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
