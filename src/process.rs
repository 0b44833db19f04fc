use crate::error::FgError;
use serde::Serialize;

/// Point-in-time view of a live process.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessStats {
    /// Lifetime average CPU usage in percent of one core.
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub uptime_secs: u64,
    pub command_line: String,
}

/// OS process capability used by the supervisor. The OS is the ground
/// truth for liveness; registry contents are only an index into it.
pub trait ProcessControl {
    fn is_running(&self, pid: u32) -> bool;

    /// Cooperative shutdown request (SIGTERM on unix).
    fn terminate(&self, pid: u32) -> Result<(), FgError>;

    /// Forceful kill (SIGKILL on unix).
    fn kill(&self, pid: u32) -> Result<(), FgError>;

    /// `None` when the process is gone or cannot be inspected.
    fn inspect(&self, pid: u32) -> Option<ProcessStats>;
}

pub struct SystemProcessControl;

#[cfg(unix)]
mod unix {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    fn to_pid(pid: u32) -> Option<Pid> {
        i32::try_from(pid).ok().filter(|raw| *raw > 0).map(Pid::from_raw)
    }

    pub(super) fn probe(pid: u32) -> bool {
        let Some(pid) = to_pid(pid) else {
            return false;
        };
        match kill(pid, None) {
            Ok(()) => true,
            // Exists but owned by someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    pub(super) fn send(pid: u32, signal: Signal) -> Result<(), FgError> {
        let target = to_pid(pid).ok_or(FgError::ProcessNotFound(pid))?;
        match kill(target, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(FgError::ProcessNotFound(pid)),
            Err(errno) => Err(FgError::ProcessTermination {
                pid,
                reason: format!("{} failed: {errno}", signal.as_str()),
            }),
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::ProcessStats;
    use procfs::process::Process;

    pub(super) fn is_zombie(pid: u32) -> bool {
        Process::new(pid as i32)
            .and_then(|proc| proc.stat())
            .map(|stat| stat.state == 'Z' || stat.state == 'X')
            .unwrap_or(false)
    }

    pub(super) fn stats(pid: u32) -> Option<ProcessStats> {
        let proc = Process::new(pid as i32).ok()?;
        let stat = proc.stat().ok()?;
        let ticks = procfs::ticks_per_second() as f64;
        let boot = procfs::boot_time_secs().ok()? as f64;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_secs_f64();
        let started = boot + stat.starttime as f64 / ticks;
        let age = (now - started).max(0.0);
        let cpu_secs = (stat.utime + stat.stime) as f64 / ticks;
        let cpu_percent = if age > 0.0 {
            (cpu_secs / age * 1000.0).round() / 10.0
        } else {
            0.0
        };
        let memory_mb = (stat.rss * procfs::page_size()) as f64 / 1024.0 / 1024.0;
        let command_line = proc
            .cmdline()
            .ok()
            .filter(|args| !args.is_empty())
            .map(|args| args.join(" "))
            .unwrap_or_else(|| stat.comm.clone());
        Some(ProcessStats {
            cpu_percent,
            memory_mb: (memory_mb * 10.0).round() / 10.0,
            uptime_secs: age as u64,
            command_line,
        })
    }
}

#[cfg(unix)]
impl ProcessControl for SystemProcessControl {
    fn is_running(&self, pid: u32) -> bool {
        if !unix::probe(pid) {
            return false;
        }
        #[cfg(target_os = "linux")]
        {
            if linux::is_zombie(pid) {
                return false;
            }
        }
        true
    }

    fn terminate(&self, pid: u32) -> Result<(), FgError> {
        unix::send(pid, nix::sys::signal::Signal::SIGTERM)
    }

    fn kill(&self, pid: u32) -> Result<(), FgError> {
        unix::send(pid, nix::sys::signal::Signal::SIGKILL)
    }

    fn inspect(&self, pid: u32) -> Option<ProcessStats> {
        if !self.is_running(pid) {
            return None;
        }
        platform_stats(pid)
    }
}

#[cfg(target_os = "linux")]
fn platform_stats(pid: u32) -> Option<ProcessStats> {
    linux::stats(pid)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn platform_stats(_pid: u32) -> Option<ProcessStats> {
    Some(ProcessStats::default())
}

#[cfg(not(unix))]
impl ProcessControl for SystemProcessControl {
    fn is_running(&self, _pid: u32) -> bool {
        false
    }

    fn terminate(&self, pid: u32) -> Result<(), FgError> {
        Err(FgError::ProcessTermination {
            pid,
            reason: "process signals are not supported on this platform".to_string(),
        })
    }

    fn kill(&self, pid: u32) -> Result<(), FgError> {
        self.terminate(pid)
    }

    fn inspect(&self, _pid: u32) -> Option<ProcessStats> {
        None
    }
}

pub fn format_uptime(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_is_hours_minutes_seconds() {
        assert_eq!(format_uptime(0), "00:00:00");
        assert_eq!(format_uptime(3725), "01:02:05");
        assert_eq!(format_uptime(90_061), "25:01:01");
    }

    #[cfg(unix)]
    #[test]
    fn system_control_tracks_child_lifecycle() {
        use std::process::Command;

        let control = SystemProcessControl;
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(control.is_running(pid));
        #[cfg(target_os = "linux")]
        {
            let stats = control.inspect(pid).expect("stats for live child");
            assert!(stats.command_line.contains("sleep"));
        }
        control.terminate(pid).unwrap();
        child.wait().unwrap();
        assert!(!control.is_running(pid));
        assert!(control.inspect(pid).is_none());
        assert!(matches!(control.kill(pid), Err(FgError::ProcessNotFound(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn zombie_children_are_not_running() {
        use std::process::Command;
        use std::thread;
        use std::time::{Duration, Instant};

        let control = SystemProcessControl;
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        let deadline = Instant::now() + Duration::from_secs(5);
        while control.is_running(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!control.is_running(pid));
        child.wait().unwrap();
    }

    #[test]
    fn pid_zero_is_never_running() {
        assert!(!SystemProcessControl.is_running(0));
    }
}
