use crate::config::ARTIFACT_PREFIX;
use crate::error::FgError;
use crate::process::ProcessControl;
use crate::supervisor::InstanceRegistry;
use crate::version::validate_version;
use chrono::{DateTime, Local};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::debug;

pub const DEFAULT_TAIL_LINES: usize = 100;
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TAIL_CHUNK: u64 = 8 * 1024;
const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// `fhir-guard-<version>-<port>-<YYYYmmdd-HHMMSS>.log`
pub fn log_file_name(version: &str, port: u16, started: DateTime<Local>) -> String {
    format!(
        "{ARTIFACT_PREFIX}-{version}-{port}-{}.log",
        started.format(STAMP_FORMAT)
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileName {
    pub version: String,
    pub port: u16,
    pub stamp: String,
}

/// Recovers version and port from a log file name; `None` for files that
/// do not follow the naming convention.
pub fn parse_log_file_name(name: &str) -> Option<LogFileName> {
    let rest = name
        .strip_prefix(ARTIFACT_PREFIX)?
        .strip_prefix('-')?
        .strip_suffix(".log")?;
    let parts: Vec<&str> = rest.split('-').collect();
    let [version, port, date, time] = parts.as_slice() else {
        return None;
    };
    validate_version(version).ok()?;
    let port = port.parse::<u16>().ok()?;
    let digits = |value: &str, len: usize| {
        value.len() == len && value.chars().all(|c| c.is_ascii_digit())
    };
    if !digits(*date, 8) || !digits(*time, 6) {
        return None;
    }
    Some(LogFileName {
        version: version.to_string(),
        port,
        stamp: format!("{date}-{time}"),
    })
}

/// Version of the live instance started most recently.
pub fn latest_live_version(
    registry: &InstanceRegistry,
    control: &dyn ProcessControl,
) -> Option<String> {
    registry
        .iter()
        .filter(|(_, record)| control.is_running(record.pid))
        .max_by_key(|(_, record)| record.start_time)
        .map(|(_, record)| record.version.clone())
}

/// Newest (by modification time) log file of `version` under `log_dir`,
/// optionally restricted to one port.
pub fn locate_latest_log(
    log_dir: &Path,
    version: &str,
    port: Option<u16>,
) -> Result<PathBuf, FgError> {
    let describe = || match port {
        Some(port) => format!("version {version} on port {port}"),
        None => format!("version {version}"),
    };
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(FgError::LogNotFound(describe()));
        }
        Err(err) => return Err(err.into()),
    };
    let mut best: Option<(SystemTime, String, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(parsed) = parse_log_file_name(&name) else {
            continue;
        };
        if parsed.version != version || port.is_some_and(|port| port != parsed.port) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let candidate = (modified, parsed.stamp, entry.path());
        if best
            .as_ref()
            .map_or(true, |current| (&candidate.0, &candidate.1) > (&current.0, &current.1))
        {
            best = Some(candidate);
        }
    }
    best.map(|(_, _, path)| path)
        .ok_or_else(|| FgError::LogNotFound(describe()))
}

fn tail_start(buf: &[u8], lines: usize) -> Option<usize> {
    let body = buf.strip_suffix(b"\n").unwrap_or(buf);
    let mut seen = 0;
    for (idx, byte) in body.iter().enumerate().rev() {
        if *byte == b'\n' {
            seen += 1;
            if seen == lines {
                return Some(idx + 1);
            }
        }
    }
    None
}

/// Last `lines` lines of `path`, read backwards in chunks. Also returns
/// the file length the tail ends at, which is where following resumes.
pub fn read_tail(path: &Path, lines: usize) -> Result<(Vec<u8>, u64), FgError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if lines == 0 {
        return Ok((Vec::new(), len));
    }
    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();
    while pos > 0 {
        let step = TAIL_CHUNK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        if let Some(start) = tail_start(&buf, lines) {
            return Ok((buf.split_off(start), len));
        }
    }
    Ok((buf, len))
}

/// Incremental reader over a growing log file. Each poll yields exactly
/// the bytes appended since the previous poll.
#[derive(Debug)]
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
}

impl LogFollower {
    pub fn new(path: PathBuf, offset: u64) -> Self {
        Self { path, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn poll(&mut self) -> Result<Vec<u8>, FgError> {
        let len = fs::metadata(&self.path)?.len();
        if len < self.offset {
            debug!(path = %self.path.display(), from = self.offset, to = len, "log file shrank");
            self.offset = len;
            return Ok(Vec::new());
        }
        if len == self.offset {
            return Ok(Vec::new());
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut appended = Vec::new();
        file.take(len - self.offset).read_to_end(&mut appended)?;
        self.offset += appended.len() as u64;
        Ok(appended)
    }
}

/// Writes the tail, then streams appended bytes forever. Only returns on
/// an I/O error; the caller is expected to be interrupted by a signal.
pub fn follow(
    path: &Path,
    lines: usize,
    interval: Duration,
    out: &mut dyn Write,
) -> Result<(), FgError> {
    let (tail, offset) = read_tail(path, lines)?;
    out.write_all(&tail)?;
    out.flush()?;
    let mut follower = LogFollower::new(path.to_path_buf(), offset);
    debug!(path = %path.display(), offset = follower.offset(), "following log");
    loop {
        thread::sleep(interval);
        let appended = follower.poll()?;
        if !appended.is_empty() {
            out.write_all(&appended)?;
            out.flush()?;
        }
    }
}
