use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// One dependency URL that could not be fetched (or unpacked).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyFailure {
    pub url: String,
    pub reason: String,
}

impl fmt::Display for DependencyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.url, self.reason)
    }
}

fn join_failures(failures: &[DependencyFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum FgError {
    #[error("invalid version format: {0} (expected x.y.z)")]
    InvalidVersionFormat(String),
    #[error("metadata fetch failed for version {version}: {reason}")]
    MetadataFetch { version: String, reason: String },
    #[error("download failed: {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("{} dependency download(s) failed: {}", .0.len(), join_failures(.0))]
    DependencyFetch(Vec<DependencyFailure>),
    #[error("version {0} is not installed; run 'fg install {0}' first")]
    NotInstalled(String),
    #[error("port {port} is already in use by instance {key} (pid {pid})")]
    PortInUse { port: u16, key: String, pid: u32 },
    #[error("process {0} is not running")]
    ProcessNotFound(u32),
    #[error("failed to terminate process {pid}: {reason}")]
    ProcessTermination { pid: u32, reason: String },
    #[error("no log file found: {0}")]
    LogNotFound(String),
    #[error("registry error: {0}")]
    RegistryIo(String),
    #[error("java runtime {found} does not satisfy requirement {required}")]
    RuntimeRequirement { required: String, found: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FgError {
    /// Stable machine-readable tag used in the `--json` error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            FgError::InvalidVersionFormat(_) => "invalid_version_format",
            FgError::MetadataFetch { .. } => "metadata_fetch",
            FgError::Download { .. } => "download",
            FgError::ChecksumMismatch { .. } => "checksum_mismatch",
            FgError::DependencyFetch(_) => "dependency_fetch",
            FgError::NotInstalled(_) => "not_installed",
            FgError::PortInUse { .. } => "port_in_use",
            FgError::ProcessNotFound(_) => "process_not_found",
            FgError::ProcessTermination { .. } => "process_termination",
            FgError::LogNotFound(_) => "log_not_found",
            FgError::RegistryIo(_) => "registry_io",
            FgError::RuntimeRequirement { .. } => "runtime_requirement",
            FgError::Config(_) => "config",
            FgError::Process(_) => "process",
            FgError::Prompt(_) => "prompt",
            FgError::Io(_) => "io",
            FgError::Yaml(_) => "yaml",
            FgError::Json(_) => "json",
        }
    }
}
