use crate::config::{write_atomic_text_file, Config, Store};
use crate::error::FgError;
use crate::jvm::{check_bounds, JavaRuntime};
use crate::logs::log_file_name;
use crate::process::{format_uptime, ProcessControl, ProcessStats};
use crate::version::validate_version;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const KILL_WAIT: Duration = Duration::from_secs(5);

pub fn instance_key(version: &str, port: u16) -> String {
    format!("{version}:{port}")
}

/// Persisted entry for one started server process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub version: String,
    pub port: u16,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub log_file: PathBuf,
    #[serde(default)]
    pub command_line: Vec<String>,
}

impl InstanceRecord {
    pub fn key(&self) -> String {
        instance_key(&self.version, self.port)
    }
}

/// Instance Registry: `version:port` -> record, stored as JSON.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceRegistry {
    instances: BTreeMap<String, InstanceRecord>,
}

impl InstanceRegistry {
    pub fn load(path: &Path) -> Result<Self, FgError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(FgError::RegistryIo(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content).map_err(|err| {
            FgError::RegistryIo(format!("failed to parse {}: {err}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), FgError> {
        let body = serde_json::to_string_pretty(self)?;
        write_atomic_text_file(path, &body).map_err(|err| {
            FgError::RegistryIo(format!("failed to write {}: {err}", path.display()))
        })
    }

    /// Adds `record` under its key. Any other record claiming the same pid
    /// is dropped, so one live process never appears twice.
    pub fn insert(&mut self, record: InstanceRecord) {
        let key = record.key();
        self.instances
            .retain(|existing, other| *existing == key || other.pid != record.pid);
        self.instances.insert(key, record);
    }

    pub fn remove(&mut self, key: &str) -> Option<InstanceRecord> {
        self.instances.remove(key)
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&InstanceRecord> {
        self.instances.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InstanceRecord)> {
        self.instances.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Drops every record whose process is gone and returns them.
    pub fn reap_stale(&mut self, control: &dyn ProcessControl) -> Vec<InstanceRecord> {
        let stale: Vec<String> = self
            .instances
            .iter()
            .filter(|(_, record)| !control.is_running(record.pid))
            .map(|(key, _)| key.clone())
            .collect();
        stale
            .iter()
            .filter_map(|key| self.instances.remove(key))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Exited,
    Stopped,
    Stale,
}

/// Persists the Instance Registry after a side effect that already
/// happened; a failure becomes a warning instead of an error.
fn save_after_side_effect(store: &Store, warnings: &mut Vec<String>) {
    if let Err(err) = store.save_instances() {
        warn!(error = %err, "instance registry not saved");
        warnings.push(format!(
            "operation succeeded but the instance registry may be inconsistent: {err}"
        ));
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub version: String,
    pub port: Option<u16>,
    pub host: Option<String>,
    /// Extra JVM flags, whitespace separated.
    pub jvm_args: Option<String>,
    pub env: Vec<(String, String)>,
    pub background: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl LaunchCommand {
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// JVM flags first (configured, then extra, then `-Xmx` unless already
/// given), then the artifact, then application arguments.
pub fn build_launch_command(
    cfg: &Config,
    program: &Path,
    artifact: &Path,
    port: u16,
    host: &str,
    extra_jvm_args: &[String],
    env_overrides: &[(String, String)],
) -> LaunchCommand {
    let mut args: Vec<String> = cfg
        .java
        .jvm_args
        .iter()
        .chain(extra_jvm_args)
        .filter(|arg| !arg.trim().is_empty())
        .cloned()
        .collect();
    let max_memory = cfg.server.max_memory.trim();
    if !max_memory.is_empty() && !args.iter().any(|arg| arg.starts_with("-Xmx")) {
        args.push(format!("-Xmx{max_memory}"));
    }
    args.push("-jar".to_string());
    args.push(artifact.to_string_lossy().to_string());
    args.push(format!("--server.port={port}"));
    if !host.trim().is_empty() {
        args.push(format!("--server.address={}", host.trim()));
    }
    for context in &cfg.server.contexts {
        args.push(format!("--server.servlet.context-path={context}"));
    }
    let mut env = cfg.server.env.clone();
    for (key, value) in env_overrides {
        env.insert(key.clone(), value.clone());
    }
    LaunchCommand {
        program: program.to_path_buf(),
        args,
        env,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub key: String,
    pub version: String,
    pub port: u16,
    pub pid: u32,
    pub log_file: PathBuf,
    pub state: InstanceState,
    pub command_line: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Refuses when a live tracked instance already holds `port`. Stale
/// records met during the scan are reaped and persisted once.
fn ensure_port_free(
    store: &mut Store,
    control: &dyn ProcessControl,
    port: u16,
) -> Result<(), FgError> {
    let reaped = store.instances.reap_stale(control);
    if !reaped.is_empty() {
        debug!(count = reaped.len(), "reaped stale instance records");
        store.save_instances()?;
    }
    if let Some((key, record)) = store.instances.iter().find(|(_, record)| record.port == port) {
        return Err(FgError::PortInUse {
            port,
            key: key.clone(),
            pid: record.pid,
        });
    }
    Ok(())
}

fn open_log_file(store: &Store, version: &str, port: u16) -> Result<(PathBuf, File), FgError> {
    let dir = store.paths.log_dir(version);
    fs::create_dir_all(&dir)?;
    let path = dir.join(log_file_name(version, port, Local::now()));
    let file = File::options().create(true).append(true).open(&path)?;
    Ok((path, file))
}

pub fn start(
    store: &mut Store,
    control: &dyn ProcessControl,
    runtime: &dyn JavaRuntime,
    request: &StartRequest,
) -> Result<StartOutcome, FgError> {
    let version = request.version.as_str();
    validate_version(version)?;
    let artifact = store.paths.artifact_path(version);
    if !artifact.is_file() {
        return Err(FgError::NotInstalled(version.to_string()));
    }
    let port = request.port.unwrap_or(store.config.server.port);
    if port == 0 {
        return Err(FgError::Config("port must be between 1 and 65535".to_string()));
    }
    let host = request
        .host
        .clone()
        .unwrap_or_else(|| store.config.server.host.clone());

    ensure_port_free(store, control, port)?;
    check_bounds(runtime, &store.config.java)?;

    let extra: Vec<String> = request
        .jvm_args
        .as_deref()
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let launch = build_launch_command(
        &store.config,
        runtime.program(),
        &artifact,
        port,
        &host,
        &extra,
        &request.env,
    );
    let (log_file, log) = open_log_file(store, version, port)?;
    debug!(command = ?launch.command_line(), log = %log_file.display(), "launching");

    let mut command = Command::new(&launch.program);
    command.args(&launch.args).envs(&launch.env).stdin(Stdio::null());
    if request.background {
        command.stdout(log.try_clone()?).stderr(log.try_clone()?);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
    } else {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    }
    let mut child = command.spawn().map_err(|err| {
        FgError::Process(format!(
            "failed to launch {}: {err}",
            launch.program.display()
        ))
    })?;

    let record = InstanceRecord {
        version: version.to_string(),
        port,
        pid: child.id(),
        start_time: Utc::now(),
        log_file: log_file.clone(),
        command_line: launch.command_line(),
    };
    let key = record.key();
    store.instances.insert(record.clone());
    let mut warnings = Vec::new();
    save_after_side_effect(store, &mut warnings);
    info!(key = %key, pid = record.pid, "instance started");

    let mut outcome = StartOutcome {
        key: key.clone(),
        version: record.version,
        port,
        pid: record.pid,
        log_file,
        state: InstanceState::Running,
        command_line: record.command_line,
        warnings,
    };
    if request.background {
        return Ok(outcome);
    }

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump(stdout, log.try_clone()?, false));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump(stderr, log, true));
    }
    let status = child.wait();
    for handle in pumps {
        let _ = handle.join();
    }
    store.instances.remove(&key);
    save_after_side_effect(store, &mut outcome.warnings);
    let status = status?;
    outcome.state = InstanceState::Exited;
    if !status.success() {
        return Err(FgError::Process(format!("instance {key} exited with {status}")));
    }
    Ok(outcome)
}

/// Copies child output into the log file and onto the terminal.
fn pump<R: Read + Send + 'static>(mut source: R, log: File, to_stderr: bool) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut log = Some(log);
        let mut buf = [0u8; 8192];
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    warn!(error = %err, "reading instance output failed");
                    break;
                }
            };
            if let Some(file) = log.as_mut() {
                if let Err(err) = file.write_all(&buf[..n]) {
                    warn!(error = %err, "instance log write failed; terminal output continues");
                    log = None;
                }
            }
            if to_stderr {
                let _ = io::stderr().write_all(&buf[..n]);
            } else {
                let mut out = io::stdout().lock();
                let _ = out.write_all(&buf[..n]);
                let _ = out.flush();
            }
        }
    })
}

/// Intersection of optional filters; both `None` selects every instance.
#[derive(Debug, Clone, Default)]
pub struct StopFilter {
    pub version: Option<String>,
    pub port: Option<u16>,
}

impl StopFilter {
    pub fn matches(&self, record: &InstanceRecord) -> bool {
        self.version.as_deref().map_or(true, |v| v == record.version)
            && self.port.map_or(true, |p| p == record.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    pub force: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            force: false,
            timeout: DEFAULT_STOP_TIMEOUT,
            poll_interval: STOP_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub key: String,
    pub pid: u32,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StopSummary {
    pub stopped: usize,
    pub failed: usize,
    pub instances: Vec<StopOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

fn wait_for_exit(
    control: &dyn ProcessControl,
    pid: u32,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !control.is_running(pid) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(poll_interval.min(deadline - now));
    }
}

/// Graceful signal, bounded wait, then a forced kill. `force` goes
/// straight to the kill.
pub fn terminate_process(
    control: &dyn ProcessControl,
    pid: u32,
    options: &StopOptions,
) -> Result<(), FgError> {
    if !options.force {
        match control.terminate(pid) {
            Ok(()) => {}
            Err(FgError::ProcessNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        }
        if wait_for_exit(control, pid, options.timeout, options.poll_interval) {
            return Ok(());
        }
        warn!(pid, timeout = ?options.timeout, "graceful stop timed out, killing");
    }
    match control.kill(pid) {
        Ok(()) | Err(FgError::ProcessNotFound(_)) => {}
        Err(err) => return Err(err),
    }
    if wait_for_exit(control, pid, KILL_WAIT, options.poll_interval) {
        Ok(())
    } else {
        Err(FgError::ProcessTermination {
            pid,
            reason: format!("still running {}s after kill", KILL_WAIT.as_secs()),
        })
    }
}

pub fn stop(
    store: &mut Store,
    control: &dyn ProcessControl,
    filter: &StopFilter,
    options: &StopOptions,
) -> StopSummary {
    let targets: Vec<InstanceRecord> = store
        .instances
        .iter()
        .filter(|(_, record)| filter.matches(record))
        .map(|(_, record)| record.clone())
        .collect();
    let mut summary = StopSummary::default();
    for record in targets {
        let key = record.key();
        let result = if control.is_running(record.pid) {
            terminate_process(control, record.pid, options)
        } else {
            Err(FgError::ProcessNotFound(record.pid))
        };
        match result {
            Ok(()) => {
                info!(key = %key, pid = record.pid, "instance stopped");
                store.instances.remove(&key);
                summary.stopped += 1;
                summary.instances.push(StopOutcome {
                    key,
                    pid: record.pid,
                    state: InstanceState::Stopped,
                    error: None,
                });
            }
            Err(err) => {
                warn!(key = %key, pid = record.pid, error = %err, "stop failed");
                summary.failed += 1;
                let state = match err {
                    FgError::ProcessNotFound(_) => InstanceState::Stale,
                    _ => InstanceState::Running,
                };
                summary.instances.push(StopOutcome {
                    key,
                    pid: record.pid,
                    state,
                    error: Some(err.to_string()),
                });
            }
        }
    }
    if summary.stopped > 0 {
        save_after_side_effect(store, &mut summary.warnings);
    }
    summary
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub key: String,
    pub version: String,
    pub port: u16,
    pub pid: u32,
    pub state: InstanceState,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub uptime: String,
    pub log_file: PathBuf,
    pub command_line: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub instances: Vec<StatusRow>,
    pub reaped: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Live view of every tracked instance. Dead records are dropped from the
/// registry in one batch and persisted once.
pub fn status(store: &mut Store, control: &dyn ProcessControl) -> StatusReport {
    let mut report = StatusReport::default();
    if store.instances.is_empty() {
        return report;
    }
    let mut stale = Vec::new();
    for (key, record) in store.instances.iter() {
        if !control.is_running(record.pid) {
            stale.push(key.clone());
            continue;
        }
        let (stats, uptime) = match control.inspect(record.pid) {
            Some(stats) => {
                let uptime = format_uptime(stats.uptime_secs);
                (stats, uptime)
            }
            None => {
                debug!(key = %key, pid = record.pid, "process stats unavailable");
                (ProcessStats::default(), "-".to_string())
            }
        };
        let command_line = if stats.command_line.is_empty() {
            record.command_line.join(" ")
        } else {
            stats.command_line
        };
        report.instances.push(StatusRow {
            key: key.clone(),
            version: record.version.clone(),
            port: record.port,
            pid: record.pid,
            state: InstanceState::Running,
            cpu_percent: stats.cpu_percent,
            memory_mb: stats.memory_mb,
            uptime,
            log_file: record.log_file.clone(),
            command_line,
        });
    }
    for key in &stale {
        store.instances.remove(key);
    }
    if !stale.is_empty() {
        debug!(count = stale.len(), "reaped stale instance records");
        save_after_side_effect(store, &mut report.warnings);
    }
    report.reaped = stale;
    report
}
