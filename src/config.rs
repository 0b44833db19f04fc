use crate::error::FgError;
use crate::supervisor::InstanceRegistry;
use crate::version::validate_version;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const HOME_ENV: &str = "FG_HOME";
pub const ARTIFACT_PREFIX: &str = "fhir-guard";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub java: JavaConfig,
    pub server: ServerConfig,
    pub versions: BTreeMap<String, VersionRecord>,
    pub log_level: String,
    pub download_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct JavaConfig {
    pub min_version: String,
    pub max_version: String,
    pub custom_java_cmd: String,
    pub jvm_args: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub contexts: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub max_memory: String,
}

/// Registry entry for one installable release.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct VersionRecord {
    pub url: String,
    /// Hex SHA-256; empty means the artifact is not verified.
    pub checksum: String,
    pub dependencies: Vec<String>,
    pub required_java: Option<String>,
    pub default_configs: BTreeMap<String, String>,
    pub installed: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            java: JavaConfig::default(),
            server: ServerConfig::default(),
            versions: BTreeMap::new(),
            log_level: "info".to_string(),
            download_url: "https://releases.fhir-guard.org".to_string(),
        }
    }
}

impl Default for JavaConfig {
    fn default() -> Self {
        Self {
            min_version: String::new(),
            max_version: String::new(),
            custom_java_cmd: String::new(),
            jvm_args: vec!["-Xms256m".to_string()],
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: String::new(),
            contexts: vec!["/fhir".to_string()],
            env: BTreeMap::new(),
            max_memory: "1g".to_string(),
        }
    }
}

/// On-disk layout under the fg home directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub home: PathBuf,
    pub versions_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub config_path: PathBuf,
    pub instances_path: PathBuf,
}

impl Paths {
    pub fn new(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            versions_dir: home.join("versions"),
            logs_dir: home.join("logs"),
            config_path: home.join("config").join("config.yaml"),
            instances_path: home.join("instances.json"),
        }
    }

    pub fn ensure_dirs(&self) -> Result<(), FgError> {
        fs::create_dir_all(&self.versions_dir)?;
        fs::create_dir_all(&self.logs_dir)?;
        ensure_parent(&self.config_path)?;
        Ok(())
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.versions_dir.join(version)
    }

    pub fn artifact_path(&self, version: &str) -> PathBuf {
        self.version_dir(version)
            .join(format!("{ARTIFACT_PREFIX}-{version}.jar"))
    }

    pub fn deps_dir(&self, version: &str) -> PathBuf {
        self.version_dir(version).join("deps")
    }

    pub fn version_config_dir(&self, version: &str) -> PathBuf {
        self.version_dir(version).join("config")
    }

    pub fn log_dir(&self, version: &str) -> PathBuf {
        self.logs_dir.join(version)
    }
}

pub fn resolve_home(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(HOME_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".fhir-guard");
    base
}

pub fn ensure_parent(path: &Path) -> Result<(), FgError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), FgError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "fg".to_string()),
        std::process::id(),
        ts
    ));
    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(FgError::Io(err));
    }
    Ok(())
}

pub fn read_config_from_str(content: &str) -> Result<Config, FgError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, FgError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

fn validate_config(cfg: &Config) -> Result<(), FgError> {
    if cfg.server.port == 0 {
        return Err(FgError::Config("server.port must be between 1 and 65535".to_string()));
    }
    if !LOG_LEVELS.contains(&cfg.log_level.as_str()) {
        return Err(FgError::Config(format!(
            "log_level must be one of {}, got '{}'",
            LOG_LEVELS.join(", "),
            cfg.log_level
        )));
    }
    if cfg.download_url.trim().is_empty() {
        return Err(FgError::Config("download_url must not be empty".to_string()));
    }
    for version in cfg.versions.keys() {
        validate_version(version).map_err(|_| {
            FgError::Config(format!("versions contains an invalid key '{version}'"))
        })?;
    }
    Ok(())
}

/// Process-wide state for one invocation: the config file (which also holds
/// the Version Registry) and the Instance Registry, loaded at command entry
/// and saved after each mutation.
#[derive(Debug)]
pub struct Store {
    pub paths: Paths,
    pub config: Config,
    pub instances: InstanceRegistry,
}

impl Store {
    pub fn load(home: &Path) -> Result<Self, FgError> {
        let paths = Paths::new(home);
        paths.ensure_dirs()?;
        if !paths.config_path.exists() {
            write_atomic_text_file(&paths.config_path, DEFAULT_CONFIG_YAML)?;
        }
        let config = read_config(&paths.config_path).map_err(|err| {
            FgError::Config(format!(
                "failed to load {}: {}",
                paths.config_path.display(),
                err
            ))
        })?;
        let instances = InstanceRegistry::load(&paths.instances_path)?;
        Ok(Self {
            paths,
            config,
            instances,
        })
    }

    pub fn save_config(&self) -> Result<(), FgError> {
        let body = serde_yaml::to_string(&self.config)?;
        write_atomic_text_file(&self.paths.config_path, &body).map_err(|err| {
            FgError::RegistryIo(format!(
                "failed to write {}: {}",
                self.paths.config_path.display(),
                err
            ))
        })
    }

    pub fn save_instances(&self) -> Result<(), FgError> {
        self.instances.save(&self.paths.instances_path)
    }

    pub fn version_record(&self, version: &str) -> Option<&VersionRecord> {
        self.config.versions.get(version)
    }
}

fn lookup<'a>(root: &'a serde_yaml::Value, key: &str) -> Option<&'a serde_yaml::Value> {
    let mut current = root;
    for segment in key.split('.') {
        current = current.as_mapping()?.get(segment)?;
    }
    Some(current)
}

pub fn config_get(cfg: &Config, key: &str) -> Result<serde_yaml::Value, FgError> {
    let root = serde_yaml::to_value(cfg)?;
    lookup(&root, key)
        .cloned()
        .ok_or_else(|| FgError::Config(format!("unknown config key '{key}'")))
}

/// Returns a copy of `cfg` with `key` set to `raw` parsed as YAML. The
/// result is re-validated as a whole, so type errors surface here.
pub fn config_set(cfg: &Config, key: &str, raw: &str) -> Result<Config, FgError> {
    let mut root = serde_yaml::to_value(cfg)?;
    let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
    let segments: Vec<&str> = key.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| FgError::Config("config key must not be empty".to_string()))?;
    let mut current = &mut root;
    for segment in parents {
        current = current
            .as_mapping_mut()
            .and_then(|map| map.get_mut(*segment))
            .ok_or_else(|| FgError::Config(format!("unknown config key '{key}'")))?;
    }
    let map = current
        .as_mapping_mut()
        .ok_or_else(|| FgError::Config(format!("'{key}' does not name a settable field")))?;
    map.insert(serde_yaml::Value::String(last.to_string()), value);
    let updated: Config = serde_yaml::from_value(root)
        .map_err(|err| FgError::Config(format!("invalid value for '{key}': {err}")))?;
    validate_config(&updated)?;
    Ok(updated)
}
