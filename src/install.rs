use crate::archive::{archive_stem, extractor_for};
use crate::checksum::verify_checksum;
use crate::config::{write_atomic_text_file, Store, VersionRecord};
use crate::error::{DependencyFailure, FgError};
use crate::fetch::{
    fetch_version_index, fetch_version_metadata, latest_version, url_file_name, ArtifactFetcher,
};
use crate::jvm::{check_required, verify_artifact, JavaRuntime};
use crate::process::ProcessControl;
use crate::version::{compare_versions, validate_version};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

/// Simultaneous dependency transfers.
pub const DEPENDENCY_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub force: bool,
    pub skip_deps: bool,
    pub verify: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub version: String,
    pub artifact: PathBuf,
    pub already_installed: bool,
    pub bytes: u64,
    pub checksum_verified: bool,
    pub dependencies_fetched: usize,
    pub dependencies_skipped: usize,
    pub config_files: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl InstallOutcome {
    fn new(version: &str, artifact: PathBuf) -> Self {
        Self {
            version: version.to_string(),
            artifact,
            already_installed: false,
            bytes: 0,
            checksum_verified: false,
            dependencies_fetched: 0,
            dependencies_skipped: 0,
            config_files: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

/// Registry hit first; otherwise the remote metadata document.
pub fn resolve_record(
    store: &Store,
    fetcher: &dyn ArtifactFetcher,
    version: &str,
) -> Result<VersionRecord, FgError> {
    if let Some(record) = store.version_record(version) {
        debug!(version, "using registered metadata");
        return Ok(record.clone());
    }
    debug!(version, "fetching remote metadata");
    fetch_version_metadata(fetcher, &store.config.download_url, version)
}

pub fn install(
    store: &mut Store,
    fetcher: &dyn ArtifactFetcher,
    runtime: &dyn JavaRuntime,
    version: &str,
    options: InstallOptions,
) -> Result<InstallOutcome, FgError> {
    validate_version(version)?;
    let artifact = store.paths.artifact_path(version);
    let mut outcome = InstallOutcome::new(version, artifact.clone());
    // An artifact on disk is enough; `--force` repairs partial installs.
    if !options.force && artifact.is_file() {
        info!(version, "already installed");
        outcome.already_installed = true;
        return Ok(outcome);
    }

    let mut record = resolve_record(store, fetcher, version)?;
    if let Some(required) = record.required_java.as_deref() {
        let found = check_required(runtime, required)?;
        debug!(required, found = %found, "java runtime accepted");
    }

    outcome.bytes = download_artifact(fetcher, &record, &artifact)?;
    outcome.checksum_verified = !record.checksum.is_empty();

    if !options.skip_deps && !record.dependencies.is_empty() {
        let deps = download_dependencies(
            fetcher,
            &record.dependencies,
            &store.paths.deps_dir(version),
        )?;
        outcome.dependencies_fetched = deps.fetched;
        outcome.dependencies_skipped = deps.skipped;
    }

    record.installed = true;
    store
        .config
        .versions
        .insert(version.to_string(), record.clone());
    if let Err(err) = store.save_config() {
        outcome.warn(format!(
            "version {version} was installed but the version registry may be inconsistent: {err}"
        ));
    }
    let config_dir = store.paths.version_config_dir(version);
    for (name, result) in write_default_configs(&config_dir, &record.default_configs) {
        match result {
            Ok(()) => outcome.config_files.push(name),
            Err(err) => outcome.warn(format!(
                "version {version} was installed but default config '{name}' was not written: {err}"
            )),
        }
    }

    if options.verify {
        verify_artifact(runtime, &artifact)?;
    }
    info!(version, bytes = outcome.bytes, "installed");
    Ok(outcome)
}

/// Streams the artifact to `<jar>.part`, verifies it, then moves it into
/// place. The partial file never outlives a failure.
fn download_artifact(
    fetcher: &dyn ArtifactFetcher,
    record: &VersionRecord,
    artifact: &Path,
) -> Result<u64, FgError> {
    let part = artifact.with_extension("jar.part");
    if let Some(parent) = artifact.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = match fetcher.download(&record.url, &part) {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = fs::remove_file(&part);
            return Err(FgError::Download {
                url: record.url.clone(),
                reason: err.to_string(),
            });
        }
    };
    if !record.checksum.is_empty() {
        if let Err(err) = verify_checksum(&part, &record.checksum) {
            let _ = fs::remove_file(&part);
            return Err(match err {
                FgError::ChecksumMismatch {
                    expected, actual, ..
                } => FgError::ChecksumMismatch {
                    path: artifact.to_path_buf(),
                    expected,
                    actual,
                },
                other => other,
            });
        }
    }
    if let Err(err) = fs::rename(&part, artifact) {
        let _ = fs::remove_file(&part);
        return Err(err.into());
    }
    Ok(bytes)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependencyReport {
    pub fetched: usize,
    pub skipped: usize,
}

enum DependencyStatus {
    Fetched,
    Skipped,
}

fn fetch_dependency(
    fetcher: &dyn ArtifactFetcher,
    url: &str,
    dest_dir: &Path,
) -> Result<DependencyStatus, String> {
    let name = url_file_name(url).ok_or_else(|| "cannot derive a file name".to_string())?;
    let target = dest_dir.join(&name);
    if target.exists() {
        debug!(url, "dependency already present");
        return Ok(DependencyStatus::Skipped);
    }
    let part = dest_dir.join(format!("{name}.part"));
    if let Err(err) = fetcher.download(url, &part) {
        let _ = fs::remove_file(&part);
        return Err(err.to_string());
    }
    if let Err(err) = fs::rename(&part, &target) {
        let _ = fs::remove_file(&part);
        return Err(err.to_string());
    }
    if let (Some(extractor), Some(stem)) = (extractor_for(&name), archive_stem(&name)) {
        let unpack_dir = dest_dir.join(stem);
        if let Err(err) = extractor.extract(&target, &unpack_dir) {
            let _ = fs::remove_file(&target);
            let _ = fs::remove_dir_all(&unpack_dir);
            return Err(format!("unpack failed: {err}"));
        }
        debug!(url, dir = %unpack_dir.display(), format = extractor.name(), "dependency unpacked");
    }
    Ok(DependencyStatus::Fetched)
}

/// Fetches every URL with a fixed-size worker pool. All transfers run to
/// completion; any failures are reported together, in input order.
pub fn download_dependencies(
    fetcher: &dyn ArtifactFetcher,
    urls: &[String],
    dest_dir: &Path,
) -> Result<DependencyReport, FgError> {
    fs::create_dir_all(dest_dir)?;
    let queue: Mutex<VecDeque<(usize, &str)>> =
        Mutex::new(urls.iter().map(String::as_str).enumerate().collect());
    let failures: Mutex<Vec<(usize, DependencyFailure)>> = Mutex::new(Vec::new());
    let fetched = AtomicUsize::new(0);
    let skipped = AtomicUsize::new(0);
    let workers = DEPENDENCY_CONCURRENCY.min(urls.len());

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let next = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                let Some((index, url)) = next else {
                    break;
                };
                match fetch_dependency(fetcher, url, dest_dir) {
                    Ok(DependencyStatus::Fetched) => {
                        fetched.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(DependencyStatus::Skipped) => {
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(reason) => {
                        warn!(url, reason = %reason, "dependency failed");
                        failures
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push((
                                index,
                                DependencyFailure {
                                    url: url.to_string(),
                                    reason,
                                },
                            ));
                    }
                }
            });
        }
    });

    let mut failures = failures.into_inner().unwrap_or_else(PoisonError::into_inner);
    if !failures.is_empty() {
        failures.sort_by_key(|(index, _)| *index);
        return Err(FgError::DependencyFetch(
            failures.into_iter().map(|(_, failure)| failure).collect(),
        ));
    }
    Ok(DependencyReport {
        fetched: fetched.into_inner(),
        skipped: skipped.into_inner(),
    })
}

fn plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Writes each default config file; one result per file so a single
/// failure does not hide the rest.
pub fn write_default_configs(
    dir: &Path,
    files: &BTreeMap<String, String>,
) -> Vec<(String, Result<(), FgError>)> {
    files
        .iter()
        .map(|(name, content)| {
            let result = if plain_file_name(name) {
                write_atomic_text_file(&dir.join(name), content)
            } else {
                Err(FgError::Config(format!("'{name}' is not a plain file name")))
            };
            (name.clone(), result)
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct UninstallOutcome {
    pub version: String,
    pub removed_dir: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Live instances of `version`, by instance key.
pub fn running_instances(store: &Store, control: &dyn ProcessControl, version: &str) -> Vec<String> {
    store
        .instances
        .iter()
        .filter(|(_, record)| record.version == version && control.is_running(record.pid))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Removes the version directory, then the registry entry. The entry is
/// kept when the directory cannot be removed.
pub fn uninstall(
    store: &mut Store,
    control: &dyn ProcessControl,
    version: &str,
) -> Result<UninstallOutcome, FgError> {
    validate_version(version)?;
    let dir = store.paths.version_dir(version);
    if !dir.exists() && store.version_record(version).is_none() {
        return Err(FgError::NotInstalled(version.to_string()));
    }
    let running = running_instances(store, control, version);
    if !running.is_empty() {
        return Err(FgError::Process(format!(
            "version {version} has running instances ({}); stop them first",
            running.join(", ")
        )));
    }
    let removed_dir = dir.exists();
    if removed_dir {
        fs::remove_dir_all(&dir)?;
    }
    let mut outcome = UninstallOutcome {
        version: version.to_string(),
        removed_dir,
        warnings: Vec::new(),
    };
    if store.config.versions.remove(version).is_some() {
        if let Err(err) = store.save_config() {
            let message = format!(
                "version {version} was removed but the version registry may be inconsistent: {err}"
            );
            warn!("{message}");
            outcome.warnings.push(message);
        }
    }
    info!(version, "uninstalled");
    Ok(outcome)
}

/// Installs `version`, or the newest remote version when none is given.
pub fn update(
    store: &mut Store,
    fetcher: &dyn ArtifactFetcher,
    runtime: &dyn JavaRuntime,
    version: Option<&str>,
    options: InstallOptions,
) -> Result<InstallOutcome, FgError> {
    let target = match version {
        Some(version) => version.to_string(),
        None => {
            let index = fetch_version_index(fetcher, &store.config.download_url)?;
            latest_version(&index)
                .map(|entry| entry.version.clone())
                .ok_or_else(|| FgError::MetadataFetch {
                    version: "latest".to_string(),
                    reason: "remote version index is empty".to_string(),
                })?
        }
    };
    install(store, fetcher, runtime, &target, options)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub remote: bool,
    pub all: bool,
    pub latest: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionListing {
    pub version: String,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_date: Option<DateTime<Utc>>,
}

/// Versions with an artifact on disk.
pub fn installed_versions(store: &Store) -> Result<Vec<String>, FgError> {
    let entries = match fs::read_dir(&store.paths.versions_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut versions = Vec::new();
    for entry in entries {
        let name = entry?.file_name().to_string_lossy().to_string();
        if validate_version(&name).is_ok() && store.paths.artifact_path(&name).is_file() {
            versions.push(name);
        }
    }
    versions.sort_by(|a, b| compare_versions(b, a));
    Ok(versions)
}

pub fn list_versions(
    store: &Store,
    fetcher: &dyn ArtifactFetcher,
    options: ListOptions,
) -> Result<Vec<VersionListing>, FgError> {
    let installed = installed_versions(store)?;
    let mut listing: BTreeMap<String, VersionListing> = BTreeMap::new();
    if !options.remote || options.all {
        for version in &installed {
            listing.insert(
                version.clone(),
                VersionListing {
                    version: version.clone(),
                    installed: true,
                    release_date: None,
                },
            );
        }
    }
    if options.remote || options.all {
        for entry in fetch_version_index(fetcher, &store.config.download_url)? {
            let slot = listing
                .entry(entry.version.clone())
                .or_insert_with(|| VersionListing {
                    version: entry.version.clone(),
                    installed: installed.contains(&entry.version),
                    release_date: None,
                });
            slot.release_date = entry.release_date;
        }
    }
    let mut versions: Vec<VersionListing> = listing.into_values().collect();
    versions.sort_by(|a, b| compare_versions(&b.version, &a.version));
    if options.latest {
        versions.truncate(1);
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::MockFetcher;
    use crate::jvm::testing::MockRuntime;
    use crate::supervisor::testing::{record, MockControl};
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    const BASE: &str = "https://releases.example";

    fn metadata_url(version: &str) -> String {
        format!("{BASE}/versions/{version}/metadata.json")
    }

    fn artifact_url(version: &str) -> String {
        format!("{BASE}/versions/{version}/fhir-guard-{version}.jar")
    }

    fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn store(dir: &Path) -> Store {
        let mut store = Store::load(dir).unwrap();
        store.config.download_url = BASE.to_string();
        store
    }

    fn published(version: &str, body: &[u8], extra: &str) -> MockFetcher {
        MockFetcher::default()
            .with(
                &metadata_url(version),
                format!(r#"{{"checksum":"{}"{extra}}}"#, digest(body)),
            )
            .with(&artifact_url(version), body.to_vec())
    }

    /// Every file under `root` with its content, for no-mutation checks.
    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut files = BTreeMap::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    files.insert(path.clone(), fs::read(&path).unwrap());
                }
            }
        }
        files
    }

    #[test]
    fn install_downloads_verifies_and_registers() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let fetcher = published(
            "1.0.0",
            b"server-jar",
            r#","defaultConfigs":{"application.yaml":"server: {}\n"}"#,
        );
        let outcome = install(
            &mut store,
            &fetcher,
            &MockRuntime::new("17"),
            "1.0.0",
            InstallOptions::default(),
        )
        .unwrap();
        assert!(!outcome.already_installed);
        assert!(outcome.checksum_verified);
        assert_eq!(outcome.bytes, 10);
        assert_eq!(fs::read(store.paths.artifact_path("1.0.0")).unwrap(), b"server-jar");
        assert!(!store.paths.artifact_path("1.0.0").with_extension("jar.part").exists());
        assert_eq!(
            fs::read_to_string(store.paths.version_config_dir("1.0.0").join("application.yaml"))
                .unwrap(),
            "server: {}\n"
        );
        let reloaded = Store::load(dir.path()).unwrap();
        assert!(reloaded.version_record("1.0.0").unwrap().installed);
    }

    #[test]
    fn reinstall_without_force_touches_nothing() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let fetcher = published("1.0.0", b"v1", "");
        let runtime = MockRuntime::new("17");
        install(&mut store, &fetcher, &runtime, "1.0.0", InstallOptions::default()).unwrap();
        let before = snapshot(dir.path());
        let requests_before = fetcher.requests().len();

        let outcome =
            install(&mut store, &fetcher, &runtime, "1.0.0", InstallOptions::default()).unwrap();
        assert!(outcome.already_installed);
        assert_eq!(fetcher.requests().len(), requests_before);
        assert_eq!(snapshot(dir.path()), before);
    }

    #[test]
    fn force_replaces_artifact_content() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let runtime = MockRuntime::new("17");
        install(
            &mut store,
            &published("1.0.0", b"old", ""),
            &runtime,
            "1.0.0",
            InstallOptions::default(),
        )
        .unwrap();
        store.config.versions.clear();

        let options = InstallOptions {
            force: true,
            ..InstallOptions::default()
        };
        install(&mut store, &published("1.0.0", b"new", ""), &runtime, "1.0.0", options).unwrap();
        assert_eq!(fs::read(store.paths.artifact_path("1.0.0")).unwrap(), b"new");
    }

    #[test]
    fn checksum_mismatch_removes_download_and_skips_registry() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let fetcher = MockFetcher::default()
            .with(&metadata_url("1.0.0"), format!(r#"{{"checksum":"{}"}}"#, digest(b"other")))
            .with(&artifact_url("1.0.0"), b"tampered".to_vec());
        let err = install(
            &mut store,
            &fetcher,
            &MockRuntime::new("17"),
            "1.0.0",
            InstallOptions::default(),
        )
        .expect_err("checksum mismatch");
        assert!(matches!(err, FgError::ChecksumMismatch { .. }));
        let artifact = store.paths.artifact_path("1.0.0");
        assert!(!artifact.exists());
        assert!(!artifact.with_extension("jar.part").exists());
        assert!(Store::load(dir.path()).unwrap().version_record("1.0.0").is_none());
    }

    #[test]
    fn download_failure_is_download_error() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let fetcher = MockFetcher::default().with(&metadata_url("1.0.0"), "{}");
        let err = install(
            &mut store,
            &fetcher,
            &MockRuntime::new("17"),
            "1.0.0",
            InstallOptions::default(),
        )
        .expect_err("artifact missing");
        match err {
            FgError::Download { url, .. } => assert_eq!(url, artifact_url("1.0.0")),
            other => panic!("unexpected error variant: {other:?}"),
        }
        assert!(store.version_record("1.0.0").is_none());
    }

    #[test]
    fn failing_dependencies_are_all_reported() {
        let dir = tempdir().unwrap();
        let deps_dir = dir.path().join("deps");
        let urls: Vec<String> = (0..7)
            .map(|n| format!("https://repo.example/lib/dep-{n}.jar"))
            .collect();
        let mut fetcher = MockFetcher::default();
        for (n, url) in urls.iter().enumerate() {
            if n % 3 != 1 {
                fetcher = fetcher.with(url, format!("dep {n}"));
            }
        }
        let err = download_dependencies(&fetcher, &urls, &deps_dir).expect_err("two fail");
        let FgError::DependencyFetch(failures) = err else {
            panic!("expected dependency error");
        };
        let failed: Vec<&str> = failures.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(failed, vec![urls[1].as_str(), urls[4].as_str()]);
        assert_eq!(fs::read_dir(&deps_dir).unwrap().count(), 5);
    }

    #[test]
    fn present_dependencies_are_skipped() {
        let dir = tempdir().unwrap();
        let deps_dir = dir.path().join("deps");
        fs::create_dir_all(&deps_dir).unwrap();
        fs::write(deps_dir.join("cached.jar"), "local").unwrap();
        let urls = vec![
            "https://repo.example/cached.jar".to_string(),
            "https://repo.example/fresh.jar?sig=1".to_string(),
        ];
        let fetcher = MockFetcher::default().with(&urls[1], "fresh");
        let report = download_dependencies(&fetcher, &urls, &deps_dir).unwrap();
        assert_eq!(report, DependencyReport { fetched: 1, skipped: 1 });
        assert_eq!(fs::read_to_string(deps_dir.join("cached.jar")).unwrap(), "local");
        assert_eq!(fs::read_to_string(deps_dir.join("fresh.jar")).unwrap(), "fresh");
        assert_eq!(fetcher.requests(), vec![urls[1].clone()]);
    }

    #[test]
    fn dependency_failure_leaves_version_unregistered() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let fetcher = published(
            "1.0.0",
            b"jar",
            r#","dependencies":["https://repo.example/missing.jar"]"#,
        );
        let runtime = MockRuntime::new("17");
        let err = install(&mut store, &fetcher, &runtime, "1.0.0", InstallOptions::default())
            .expect_err("dependency missing");
        assert!(matches!(err, FgError::DependencyFetch(ref f) if f.len() == 1));
        assert!(store.version_record("1.0.0").is_none());

        let outcome =
            install(&mut store, &fetcher, &runtime, "1.0.0", InstallOptions::default()).unwrap();
        assert!(outcome.already_installed);
        assert!(store.version_record("1.0.0").is_none());

        let options = InstallOptions {
            force: true,
            skip_deps: true,
            ..InstallOptions::default()
        };
        let outcome = install(&mut store, &fetcher, &runtime, "1.0.0", options).unwrap();
        assert!(!outcome.already_installed);
        assert!(store.version_record("1.0.0").unwrap().installed);
    }

    #[test]
    fn existing_artifact_without_record_is_left_alone() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let artifact = store.paths.artifact_path("1.0.0");
        fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        fs::write(&artifact, "OLD").unwrap();
        let fetcher = published("1.0.0", b"NEW", "");

        let outcome = install(
            &mut store,
            &fetcher,
            &MockRuntime::new("17"),
            "1.0.0",
            InstallOptions::default(),
        )
        .unwrap();
        assert!(outcome.already_installed);
        assert_eq!(fs::read_to_string(&artifact).unwrap(), "OLD");
        assert!(fetcher.requests().is_empty());
    }

    #[test]
    fn dependency_pool_never_exceeds_concurrency_limit() {
        use crate::fetch::FetchError;
        use std::time::Duration;

        struct SlowFetcher {
            active: AtomicUsize,
            peak: AtomicUsize,
        }

        impl ArtifactFetcher for SlowFetcher {
            fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
                Ok(Vec::new())
            }

            fn download(&self, _url: &str, dest: &Path) -> Result<u64, FetchError> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                fs::write(dest, b"dep").unwrap();
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(3)
            }
        }

        let dir = tempdir().unwrap();
        let deps_dir = dir.path().join("deps");
        let urls: Vec<String> = (0..20)
            .map(|n| format!("https://repo.example/lib/dep-{n}.jar"))
            .collect();
        let fetcher = SlowFetcher {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        let report = download_dependencies(&fetcher, &urls, &deps_dir).unwrap();
        assert_eq!(report.fetched, 20);
        let peak = fetcher.peak.load(Ordering::SeqCst);
        assert!(peak <= DEPENDENCY_CONCURRENCY, "peak {peak}");
        assert!(peak > 1, "peak {peak}");
    }

    #[test]
    fn registry_hit_skips_remote_metadata() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        store.config.versions.insert(
            "2.0.0".to_string(),
            VersionRecord {
                url: "https://mirror.example/fg-2.0.0.jar".to_string(),
                ..VersionRecord::default()
            },
        );
        let fetcher = MockFetcher::default().with("https://mirror.example/fg-2.0.0.jar", "jar");
        install(
            &mut store,
            &fetcher,
            &MockRuntime::new("17"),
            "2.0.0",
            InstallOptions::default(),
        )
        .unwrap();
        assert_eq!(
            fetcher.requests(),
            vec!["https://mirror.example/fg-2.0.0.jar".to_string()]
        );
    }

    #[test]
    fn runtime_preflight_runs_before_download() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let fetcher = published("1.0.0", b"jar", r#","requiredJava":"21""#);
        let err = install(
            &mut store,
            &fetcher,
            &MockRuntime::new("17.0.2"),
            "1.0.0",
            InstallOptions::default(),
        )
        .expect_err("java 17 < 21");
        assert!(matches!(err, FgError::RuntimeRequirement { .. }));
        assert_eq!(fetcher.requests(), vec![metadata_url("1.0.0")]);
        assert!(!store.paths.version_dir("1.0.0").exists());
    }

    #[test]
    fn invalid_version_is_rejected_before_any_request() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let fetcher = MockFetcher::default();
        let err = install(
            &mut store,
            &fetcher,
            &MockRuntime::new("17"),
            "1.0.0-beta",
            InstallOptions::default(),
        )
        .expect_err("qualifier");
        assert!(matches!(err, FgError::InvalidVersionFormat(_)));
        assert!(fetcher.requests().is_empty());
    }

    #[test]
    fn verify_flag_runs_artifact_self_check() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let mut runtime = MockRuntime::new("17");
        runtime.smoke_output = "unrelated".to_string();
        let options = InstallOptions {
            verify: true,
            ..InstallOptions::default()
        };
        let err = install(&mut store, &published("1.0.0", b"jar", ""), &runtime, "1.0.0", options)
            .expect_err("self check");
        assert!(err.to_string().contains("FHIR Guard"));
    }

    #[test]
    fn default_config_names_must_be_plain() {
        let dir = tempdir().unwrap();
        let mut files = BTreeMap::new();
        files.insert("ok.yaml".to_string(), "a: 1".to_string());
        files.insert("../escape.yaml".to_string(), "b: 2".to_string());
        let results = write_default_configs(dir.path(), &files);
        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(failed, vec!["../escape.yaml"]);
        assert!(dir.path().join("ok.yaml").is_file());
    }

    #[test]
    fn uninstall_refuses_running_version() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        install(
            &mut store,
            &published("1.0.0", b"jar", ""),
            &MockRuntime::new("17"),
            "1.0.0",
            InstallOptions::default(),
        )
        .unwrap();
        store.instances.insert(record("1.0.0", 8080, 77));
        let err = uninstall(&mut store, &MockControl::with_live(&[77]), "1.0.0")
            .expect_err("running");
        assert!(err.to_string().contains("1.0.0:8080"));
        assert!(store.paths.version_dir("1.0.0").exists());

        let outcome = uninstall(&mut store, &MockControl::default(), "1.0.0").unwrap();
        assert!(outcome.removed_dir);
        assert!(!store.paths.version_dir("1.0.0").exists());
        assert!(Store::load(dir.path()).unwrap().version_record("1.0.0").is_none());
        assert!(matches!(
            uninstall(&mut store, &MockControl::default(), "1.0.0"),
            Err(FgError::NotInstalled(_))
        ));
    }

    #[test]
    fn update_installs_latest_remote_version() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let fetcher = published("1.10.0", b"latest", "").with(
            &format!("{BASE}/versions/index.json"),
            r#"[{"version":"1.9.0"},{"version":"1.10.0"}]"#,
        );
        let outcome = update(
            &mut store,
            &fetcher,
            &MockRuntime::new("17"),
            None,
            InstallOptions::default(),
        )
        .unwrap();
        assert_eq!(outcome.version, "1.10.0");
        assert!(store.paths.artifact_path("1.10.0").is_file());
    }

    #[test]
    fn list_merges_installed_and_remote() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path());
        let fetcher = published("1.0.0", b"jar", "").with(
            &format!("{BASE}/versions/index.json"),
            r#"[{"version":"1.0.0","releaseDate":"2024-05-01T00:00:00Z"},{"version":"1.1.0"}]"#,
        );
        let runtime = MockRuntime::new("17");
        install(&mut store, &fetcher, &runtime, "1.0.0", InstallOptions::default()).unwrap();
        fs::create_dir_all(store.paths.version_dir("0.9.0")).unwrap();

        let installed = list_versions(&store, &fetcher, ListOptions::default()).unwrap();
        assert_eq!(installed.len(), 1);
        assert!(installed[0].installed);

        let all = list_versions(
            &store,
            &fetcher,
            ListOptions {
                all: true,
                ..ListOptions::default()
            },
        )
        .unwrap();
        let versions: Vec<(&str, bool)> = all
            .iter()
            .map(|v| (v.version.as_str(), v.installed))
            .collect();
        assert_eq!(versions, vec![("1.1.0", false), ("1.0.0", true)]);
        assert!(all[1].release_date.is_some());

        let latest = list_versions(
            &store,
            &fetcher,
            ListOptions {
                remote: true,
                latest: true,
                ..ListOptions::default()
            },
        )
        .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, "1.1.0");
    }

    #[cfg(unix)]
    #[test]
    fn archive_dependencies_are_unpacked() {
        use std::process::Command;

        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("plugin.txt"), "plugin").unwrap();
        let tarball = dir.path().join("plugins.tar.gz");
        let status = Command::new("tar")
            .arg("-czf")
            .arg(&tarball)
            .arg("-C")
            .arg(&src)
            .arg("plugin.txt")
            .status()
            .unwrap();
        assert!(status.success());

        let urls = vec!["https://repo.example/plugins.tar.gz".to_string()];
        let fetcher = MockFetcher::default().with(&urls[0], fs::read(&tarball).unwrap());
        let deps_dir = dir.path().join("deps");
        download_dependencies(&fetcher, &urls, &deps_dir).unwrap();
        assert_eq!(
            fs::read_to_string(deps_dir.join("plugins").join("plugin.txt")).unwrap(),
            "plugin"
        );
    }
}
