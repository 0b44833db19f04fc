use crate::error::FgError;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

/// Unpacks an archive into a destination directory.
pub trait Extractor {
    fn name(&self) -> &'static str;
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), FgError>;
}

pub struct TarGzExtractor;

pub struct ZipExtractor;

fn run_tool(program: &str, args: &[&OsStr]) -> Result<(), FgError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| FgError::Process(format!("failed to run {program}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FgError::Process(format!(
            "{program} failed with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

impl Extractor for TarGzExtractor {
    fn name(&self) -> &'static str {
        "tar.gz"
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), FgError> {
        fs::create_dir_all(dest)?;
        run_tool(
            "tar",
            &[OsStr::new("-xzf"), archive.as_os_str(), OsStr::new("-C"), dest.as_os_str()],
        )
    }
}

impl Extractor for ZipExtractor {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), FgError> {
        fs::create_dir_all(dest)?;
        run_tool(
            "unzip",
            &[
                OsStr::new("-q"),
                OsStr::new("-o"),
                archive.as_os_str(),
                OsStr::new("-d"),
                dest.as_os_str(),
            ],
        )
    }
}

const SUFFIXES: [(&str, ArchiveKind); 3] = [
    (".tar.gz", ArchiveKind::TarGz),
    (".tgz", ArchiveKind::TarGz),
    (".zip", ArchiveKind::Zip),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    TarGz,
    Zip,
}

fn classify(file_name: &str) -> Option<(&'static str, ArchiveKind)> {
    let lower = file_name.to_ascii_lowercase();
    SUFFIXES
        .iter()
        .find(|(suffix, _)| lower.ends_with(suffix) && lower.len() > suffix.len())
        .map(|(suffix, kind)| (*suffix, *kind))
}

/// Picks the extractor for `file_name` by extension; `None` for plain files.
pub fn extractor_for(file_name: &str) -> Option<Box<dyn Extractor + Send>> {
    classify(file_name).map(|(_, kind)| -> Box<dyn Extractor + Send> {
        match kind {
            ArchiveKind::TarGz => Box::new(TarGzExtractor),
            ArchiveKind::Zip => Box::new(ZipExtractor),
        }
    })
}

/// File name with the archive suffix removed (`lib-1.0.tar.gz` -> `lib-1.0`).
pub fn archive_stem(file_name: &str) -> Option<String> {
    classify(file_name).map(|(suffix, _)| file_name[..file_name.len() - suffix.len()].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn extractor_selection_follows_extension() {
        assert_eq!(extractor_for("jdk-17.tar.gz").unwrap().name(), "tar.gz");
        assert_eq!(extractor_for("plugin.TGZ").unwrap().name(), "tar.gz");
        assert_eq!(extractor_for("bundle.zip").unwrap().name(), "zip");
        assert!(extractor_for("library-1.0.jar").is_none());
        assert!(extractor_for(".zip").is_none());
    }

    #[test]
    fn archive_stem_strips_suffix() {
        assert_eq!(archive_stem("lib-1.0.tar.gz"), Some("lib-1.0".to_string()));
        assert_eq!(archive_stem("plugins.zip"), Some("plugins".to_string()));
        assert_eq!(archive_stem("plain.jar"), None);
    }

    #[cfg(unix)]
    #[test]
    fn tar_extractor_unpacks_into_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("hello.txt"), "hi\n").unwrap();
        let archive = dir.path().join("bundle.tar.gz");
        let status = Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(&src)
            .arg("hello.txt")
            .status()
            .unwrap();
        assert!(status.success());

        let dest = dir.path().join("out");
        extractor_for("bundle.tar.gz")
            .unwrap()
            .extract(&archive, &dest)
            .unwrap();
        assert_eq!(fs::read_to_string(dest.join("hello.txt")).unwrap(), "hi\n");
    }

    #[test]
    fn corrupt_archive_reports_tool_failure() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("broken.tar.gz");
        fs::write(&archive, b"not a tarball").unwrap();
        let err = TarGzExtractor
            .extract(&archive, &dir.path().join("out"))
            .expect_err("corrupt archive");
        assert!(matches!(err, FgError::Process(_)));
    }
}
