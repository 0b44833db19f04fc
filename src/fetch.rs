use crate::config::{VersionRecord, ARTIFACT_PREFIX};
use crate::error::FgError;
use crate::version::compare_versions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const USER_AGENT: &str = "fg-cli";

/// Bounded retry budget with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub const ARTIFACT: RetryPolicy = RetryPolicy {
        max_retries: 3,
        min_wait: Duration::from_secs(1),
        max_wait: Duration::from_secs(5),
    };

    pub const INDEX: RetryPolicy = RetryPolicy {
        max_retries: 2,
        min_wait: Duration::from_secs(1),
        max_wait: Duration::from_secs(3),
    };

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.min_wait.saturating_mul(factor).min(self.max_wait)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Transport { .. } => true,
            FetchError::Io { .. } => false,
        }
    }
}

/// HTTP retrieval used for metadata documents and binary artifacts.
pub trait ArtifactFetcher: Send + Sync {
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    /// Streams `url` into `dest`, truncating any previous content. Returns
    /// the number of bytes written.
    fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(policy: RetryPolicy) -> Result<Self, FgError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| FgError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, policy })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    fn with_retry<T>(
        &self,
        url: &str,
        mut op: impl FnMut() -> Result<T, FetchError>,
    ) -> Result<T, FetchError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let wait = self.policy.backoff(attempt);
                    warn!(url, attempt = attempt + 1, ?wait, error = %err, "retrying request");
                    thread::sleep(wait);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.with_retry(url, || {
            let response = self.get(url)?;
            let bytes = response.bytes().map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
            Ok(bytes.to_vec())
        })
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let io_err = |source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        };
        self.with_retry(url, || {
            let mut response = self.get(url)?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
            let mut file = File::create(dest).map_err(io_err)?;
            let written = response
                .copy_to(&mut file)
                .map_err(|source| FetchError::Transport {
                    url: url.to_string(),
                    source,
                })?;
            debug!(url, bytes = written, dest = %dest.display(), "download complete");
            Ok(written)
        })
    }
}

/// One entry of the remote version index.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionIndexEntry {
    pub version: String,
    #[serde(default)]
    pub release_date: Option<DateTime<Utc>>,
}

/// Per-version metadata document as published next to the artifact.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct VersionMetadata {
    pub url: Option<String>,
    pub checksum: String,
    pub dependencies: Vec<String>,
    #[serde(alias = "requiredRuntimeVersion")]
    pub required_java: Option<String>,
    #[serde(alias = "defaultConfigFiles")]
    pub default_configs: BTreeMap<String, String>,
}

impl VersionMetadata {
    pub fn into_record(self, base_url: &str, version: &str) -> VersionRecord {
        let url = self
            .url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| default_artifact_url(base_url, version));
        VersionRecord {
            url,
            checksum: self.checksum.trim().to_string(),
            dependencies: self.dependencies,
            required_java: self.required_java.filter(|value| !value.trim().is_empty()),
            default_configs: self.default_configs,
            installed: false,
        }
    }
}

fn base(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}

pub fn index_url(base_url: &str) -> String {
    format!("{}/versions/index.json", base(base_url))
}

pub fn metadata_url(base_url: &str, version: &str) -> String {
    format!("{}/versions/{version}/metadata.json", base(base_url))
}

pub fn default_artifact_url(base_url: &str, version: &str) -> String {
    format!(
        "{}/versions/{version}/{ARTIFACT_PREFIX}-{version}.jar",
        base(base_url)
    )
}

/// Last path segment of `url`, ignoring any query string or fragment.
pub fn url_file_name(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or("");
    let name = without_query.rsplit('/').next().unwrap_or("").trim();
    if name.is_empty() || !without_query.contains('/') {
        None
    } else {
        Some(name.to_string())
    }
}

pub fn fetch_version_metadata(
    fetcher: &dyn ArtifactFetcher,
    base_url: &str,
    version: &str,
) -> Result<VersionRecord, FgError> {
    let url = metadata_url(base_url, version);
    let bytes = fetcher.fetch_bytes(&url).map_err(|err| FgError::MetadataFetch {
        version: version.to_string(),
        reason: match err {
            FetchError::Status { status: 404, .. } => format!("version not found ({url})"),
            other => other.to_string(),
        },
    })?;
    let metadata: VersionMetadata =
        serde_json::from_slice(&bytes).map_err(|err| FgError::MetadataFetch {
            version: version.to_string(),
            reason: format!("invalid metadata document: {err}"),
        })?;
    Ok(metadata.into_record(base_url, version))
}

/// Remote versions, newest first.
pub fn fetch_version_index(
    fetcher: &dyn ArtifactFetcher,
    base_url: &str,
) -> Result<Vec<VersionIndexEntry>, FgError> {
    let url = index_url(base_url);
    let index_err = |reason: String| FgError::MetadataFetch {
        version: "index".to_string(),
        reason,
    };
    let bytes = fetcher
        .fetch_bytes(&url)
        .map_err(|err| index_err(err.to_string()))?;
    let mut entries: Vec<VersionIndexEntry> = serde_json::from_slice(&bytes)
        .map_err(|err| index_err(format!("invalid version index: {err}")))?;
    entries.sort_by(|a, b| compare_versions(&b.version, &a.version));
    Ok(entries)
}

pub fn latest_version(entries: &[VersionIndexEntry]) -> Option<&VersionIndexEntry> {
    entries.first()
}
