use crate::errors::UpdateError;
use semver::Version;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Parse a release tag into a version, tolerating a leading `v`.
///
/// A tag that does not parse is an error, never treated as 0.0.0; callers
/// must be able to tell "malformed index" from "ancient version".
pub fn parse_tag(tag: &str) -> Result<Version, UpdateError> {
    let cleaned = tag.trim().trim_start_matches('v');
    Version::parse(cleaned).map_err(|e| UpdateError::Parse(format!("bad version tag '{}': {}", tag, e)))
}

/// The local installed-version marker: a plain-text file holding exactly a
/// semver string.
///
/// This file is the single source of truth for "what is installed here".
/// The running binary's embedded metadata is deliberately not consulted,
/// since the swap helper replaces the binary out from under the running
/// process and updates this marker with it.
#[derive(Debug, Clone)]
pub struct VersionStore {
    path: PathBuf,
}

impl VersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Version, UpdateError> {
        if !self.path.exists() {
            return Err(UpdateError::Marker(self.path.clone()));
        }
        let content = fs::read_to_string(&self.path)?;
        parse_tag(&content)
    }

    /// Write the marker atomically: a crash mid-write must not leave a
    /// truncated marker behind.
    pub fn write(&self, version: &Version) -> Result<(), UpdateError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        writeln!(tmp, "{}", version)?;
        tmp.persist(&self.path)
            .map_err(|e| UpdateError::Io(e.error))?;
        Ok(())
    }
}
