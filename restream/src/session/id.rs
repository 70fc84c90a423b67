//! Session identifiers.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::{Error, Result};

const ID_PREFIX: &str = "stream_";

/// Digest bytes kept in an identifier (128 bits).
const DIGEST_LEN: usize = 16;

/// Stable identifier of a stream session.
///
/// Derived from a SHA-256 digest of the normalized source URL, so repeated
/// requests for the same source converge on one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Identifier shared by every request for `source_url`.
    pub fn for_source(source_url: &str) -> Result<Self> {
        let normalized = normalize_source(source_url)?;
        let digest = Sha256::digest(normalized.as_bytes());
        Ok(Self(format!(
            "{ID_PREFIX}{}",
            hex::encode(&digest[..DIGEST_LEN])
        )))
    }

    /// Identifier unique to one request for `source_url`.
    ///
    /// Continuous sessions serve exactly one client, so each gets its own.
    pub fn exclusive_for_source(source_url: &str) -> Result<Self> {
        let shared = Self::for_source(source_url)?;
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Ok(Self(format!("{}_{}", shared.0, &nonce[..12])))
    }

    /// Accept an identifier taken from a request path.
    ///
    /// Only identifiers this module could have produced are accepted, which also
    /// keeps them safe to use as a directory name.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(ID_PREFIX)?;
        let valid = !rest.is_empty()
            && rest
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == '_');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a source URL so trivially different spellings share a session.
///
/// Scheme and host are lowercased, default ports and empty fragments dropped.
pub fn normalize_source(source_url: &str) -> Result<String> {
    let trimmed = source_url.trim();
    let mut url = Url::parse(trimmed)
        .map_err(|e| Error::validation(format!("Invalid url '{trimmed}': {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::validation(format!(
                "Unsupported url scheme '{other}'"
            )));
        }
    }

    if url.fragment() == Some("") {
        url.set_fragment(None);
    }

    Ok(url.to_string())
}
