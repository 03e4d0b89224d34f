//! Core job posting model and the hashes the enrichment pipeline keys on.

use std::collections::HashSet;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "senrich-core";

pub const CACHE_KEY_SEPARATOR: char = '\t';

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobPosting {
    pub url: String,
    pub company: String,
    pub title: String,
    pub location: String,
    pub scraped_on: i64,
}

impl JobPosting {
    pub fn new(
        url: impl Into<String>,
        company: impl Into<String>,
        title: impl Into<String>,
        location: impl Into<String>,
        scraped_on: i64,
    ) -> Self {
        Self {
            url: url.into(),
            company: company.into(),
            title: title.into(),
            location: location.into(),
            scraped_on,
        }
    }

    /// Seniority never takes part, so enrichment keeps the identity.
    pub fn identity(&self) -> Identity {
        let mut hasher = Sha256::new();
        for field in [&self.url, &self.company, &self.title, &self.location] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update(self.scraped_on.to_be_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Identity(u64::from_be_bytes(prefix))
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::for_company_title(&self.company, &self.title)
    }

    pub fn dedup_key(&self) -> DedupKey {
        self.cache_key().dedup_key()
    }

    pub fn with_seniority(self, seniority: i32) -> ProcessedJobPosting {
        ProcessedJobPosting {
            posting: self,
            seniority,
        }
    }

    pub fn from_json_line(line: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn to_json_line(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessedJobPosting {
    #[serde(flatten)]
    pub posting: JobPosting,
    pub seniority: i32,
}

impl ProcessedJobPosting {
    pub fn identity(&self) -> Identity {
        self.posting.identity()
    }

    pub fn from_json_line(line: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn to_json_line(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(u64);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({self})")
    }
}

/// SHA-256 of `company\ttitle`; rendered as lowercase hex when used as a cache store key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn for_company_title(company: &str, title: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(company.as_bytes());
        let mut sep = [0u8; 4];
        hasher.update(CACHE_KEY_SEPARATOR.encode_utf8(&mut sep).as_bytes());
        hasher.update(title.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn dedup_key(&self) -> DedupKey {
        let [a, b, c, d, ..] = self.0;
        DedupKey::from_digest_prefix([a, b, c, d])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

/// 32-bit key grouping identical company/title pairs inside one inference batch.
/// Distinct pairs can collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(i32);

impl DedupKey {
    pub fn from_digest_prefix(prefix: [u8; 4]) -> Self {
        Self(i32::from_be_bytes(prefix))
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl From<i32> for DedupKey {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub group_id: i64,
    pub expected: HashSet<Identity>,
}

impl Manifest {
    pub fn for_postings<'a>(
        group_id: i64,
        postings: impl IntoIterator<Item = &'a JobPosting>,
    ) -> Self {
        Self {
            group_id,
            expected: postings.into_iter().map(JobPosting::identity).collect(),
        }
    }
}

/// Blank lines are skipped; errors carry the 1-based line number.
pub fn parse_json_lines<T: DeserializeOwned>(text: &str) -> Result<Vec<T>, RecordError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| RecordError::Parse {
                line: idx + 1,
                source,
            })
        })
        .collect()
}

pub fn render_json_lines<'a, T: Serialize + 'a>(
    items: impl IntoIterator<Item = &'a T>,
) -> Result<String, RecordError> {
    let mut out = String::new();
    for item in items {
        out.push_str(&serde_json::to_string(item)?);
        out.push('\n');
    }
    Ok(out)
}
