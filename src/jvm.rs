use crate::config::JavaConfig;
use crate::error::FgError;
use crate::version::{compare_runtime_versions, extract_runtime_version, runtime_within_bounds};
use std::cmp::Ordering;
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

const SMOKE_TEST_MARKER: &str = "FHIR Guard";

/// The Java runtime used to launch and probe server artifacts.
pub trait JavaRuntime {
    fn program(&self) -> &Path;

    /// Runtime version as reported by `java -version`, e.g. `17.0.2`.
    fn version(&self) -> Result<String, FgError>;

    /// Runs `java -jar <jar> --version` and returns its combined output.
    fn smoke_test(&self, jar: &Path) -> Result<String, FgError>;
}

pub struct JavaCommand {
    program: PathBuf,
}

impl JavaCommand {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    pub fn from_config(cfg: &JavaConfig) -> Self {
        Self::new(resolve_java_command(cfg))
    }

    fn run(&self, args: &[&str]) -> Result<(bool, String), FgError> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                FgError::Process(format!(
                    "failed to run {}: {err}",
                    self.program.display()
                ))
            })?;
        let mut text = String::from_utf8_lossy(&output.stderr).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        Ok((output.status.success(), text))
    }
}

impl JavaRuntime for JavaCommand {
    fn program(&self) -> &Path {
        &self.program
    }

    fn version(&self) -> Result<String, FgError> {
        let (_, text) = self.run(&["-version"])?;
        let version = extract_runtime_version(&text).ok_or_else(|| {
            FgError::Process(format!(
                "could not determine java version from {} output",
                self.program.display()
            ))
        })?;
        debug!(program = %self.program.display(), %version, "detected java runtime");
        Ok(version)
    }

    fn smoke_test(&self, jar: &Path) -> Result<String, FgError> {
        let jar = jar.to_string_lossy();
        let (success, text) = self.run(&["-jar", &jar, "--version"])?;
        if !success {
            return Err(FgError::Process(format!(
                "artifact self-check failed: {}",
                text.trim()
            )));
        }
        Ok(text)
    }
}

/// `java.custom_java_cmd`, then `$JAVA_HOME/bin/java`, then `java` on PATH.
pub fn resolve_java_command(cfg: &JavaConfig) -> PathBuf {
    let custom = cfg.custom_java_cmd.trim();
    if !custom.is_empty() {
        return PathBuf::from(custom);
    }
    if let Some(java_home) = env::var_os("JAVA_HOME").filter(|value| !value.is_empty()) {
        let candidate = PathBuf::from(java_home).join("bin").join("java");
        if candidate.is_file() {
            return candidate;
        }
    }
    which::which("java").unwrap_or_else(|_| PathBuf::from("java"))
}

/// Install pre-flight: the runtime must report at least `required`.
pub fn check_required(runtime: &dyn JavaRuntime, required: &str) -> Result<String, FgError> {
    let found = runtime.version()?;
    if compare_runtime_versions(&found, required) == Ordering::Less {
        return Err(FgError::RuntimeRequirement {
            required: format!(">= {required}"),
            found,
        });
    }
    Ok(found)
}

/// Start pre-flight against the configured `min_version`/`max_version`
/// window. No probe runs when both bounds are empty.
pub fn check_bounds(runtime: &dyn JavaRuntime, cfg: &JavaConfig) -> Result<(), FgError> {
    let (min, max) = (cfg.min_version.trim(), cfg.max_version.trim());
    if min.is_empty() && max.is_empty() {
        return Ok(());
    }
    let found = runtime.version()?;
    if !runtime_within_bounds(&found, min, max) {
        let required = match (min.is_empty(), max.is_empty()) {
            (false, false) => format!("{min}..={max}"),
            (false, true) => format!(">= {min}"),
            _ => format!("<= {max}"),
        };
        return Err(FgError::RuntimeRequirement { required, found });
    }
    Ok(())
}

pub fn verify_artifact(runtime: &dyn JavaRuntime, jar: &Path) -> Result<(), FgError> {
    let text = runtime.smoke_test(jar)?;
    if !text.contains(SMOKE_TEST_MARKER) {
        return Err(FgError::Process(format!(
            "{} did not identify itself as {SMOKE_TEST_MARKER}",
            jar.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::Cell;

    /// Fixed-answer runtime; counts version probes.
    pub struct MockRuntime {
        pub version: String,
        pub smoke_output: String,
        pub probes: Cell<usize>,
    }

    impl MockRuntime {
        pub fn new(version: &str) -> Self {
            Self {
                version: version.to_string(),
                smoke_output: "FHIR Guard test build".to_string(),
                probes: Cell::new(0),
            }
        }
    }

    impl JavaRuntime for MockRuntime {
        fn program(&self) -> &Path {
            Path::new("java")
        }

        fn version(&self) -> Result<String, FgError> {
            self.probes.set(self.probes.get() + 1);
            Ok(self.version.clone())
        }

        fn smoke_test(&self, _jar: &Path) -> Result<String, FgError> {
            Ok(self.smoke_output.clone())
        }
    }
}
