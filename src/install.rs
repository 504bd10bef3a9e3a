//! Binary swap.
//!
//! A running executable cannot overwrite its own image, so the swap runs in
//! a detached helper process: the freshly downloaded binary re-invoked with
//! the hidden `finalize-update` subcommand. The helper waits for the parent
//! to exit, backs up the installed binary, copies the new one into place
//! with bounded retries, relaunches, and deletes the backup only after the
//! relaunched process reports a clean start.

use crate::config::{self, CLEAN_START_MARKER, VERSION_FILE_NAME};
use crate::errors::UpdateError;
use crate::version::VersionStore;
use semver::Version;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant, SystemTime};
use sysinfo::{Pid, System};

const WAIT_EXIT_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_EXIT_POLL: Duration = Duration::from_millis(500);
const COPY_ATTEMPTS: u32 = 5;
const COPY_RETRY_DELAY: Duration = Duration::from_millis(500);
const HANDSHAKE_GRACE: Duration = Duration::from_secs(10);
const HANDSHAKE_POLL: Duration = Duration::from_millis(250);

/// Everything the helper needs: the downloaded binary, the path it
/// replaces, and the process it must outlive.
#[derive(Debug, Clone)]
pub struct SwapPlan {
    pub source: PathBuf,
    pub target: PathBuf,
    pub parent_pid: u32,
    pub version: Version,
}

/// Seam between the orchestrator and the process-level swap, so the state
/// machine can be driven end to end in tests without spawning anything.
pub trait Swapper: Send + Sync {
    fn begin_swap(&self, plan: &SwapPlan) -> Result<(), UpdateError>;
}

/// Production swapper: marks the downloaded binary executable and launches
/// it detached as the swap helper. The caller is expected to exit shortly
/// after; the helper waits for that.
pub struct HelperSwapper;

impl Swapper for HelperSwapper {
    fn begin_swap(&self, plan: &SwapPlan) -> Result<(), UpdateError> {
        make_executable(&plan.source)?;

        let mut cmd = Command::new(&plan.source);
        cmd.arg("finalize-update")
            .arg("--source")
            .arg(&plan.source)
            .arg("--target")
            .arg(&plan.target)
            .arg("--pid")
            .arg(plan.parent_pid.to_string())
            .arg("--release-version")
            .arg(plan.version.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn()?;
        tracing::info!(
            "Spawned swap helper (pid {}) for {}",
            child.id(),
            plan.target.display()
        );
        Ok(())
    }
}

/// Record that this process came up cleanly. Called once at startup; the
/// swap helper waits for a marker newer than its relaunch before it deletes
/// the pre-update backup.
pub fn mark_clean_start() -> anyhow::Result<()> {
    let path = config::get_data_dir()?.join(CLEAN_START_MARKER);
    fs::write(&path, chrono::Utc::now().to_rfc3339())?;
    tracing::debug!("Wrote clean-start marker at {}", path.display());
    Ok(())
}

pub fn backup_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!("{}.backup", name))
}

/// Helper entry point: runs the full swap and returns the process exit
/// code. Zero only after a verified relaunch.
pub fn run_helper(source: &Path, target: &Path, parent_pid: u32, version: &Version) -> i32 {
    if !source.exists() {
        tracing::error!("Update source not found: {}", source.display());
        return 1;
    }
    if !target.exists() {
        tracing::error!("Installed binary not found: {}", target.display());
        return 1;
    }

    // Step 1: the parent must be gone before its image can be replaced.
    // On timeout we abort without force-terminating anything; the old
    // binary stays in place and the update is simply retried later.
    if !wait_for_exit(parent_pid, WAIT_EXIT_TIMEOUT) {
        tracing::error!(
            "Parent process {} still running after {:?}; aborting update",
            parent_pid,
            WAIT_EXIT_TIMEOUT
        );
        discard_staged(source);
        return 1;
    }

    // Step 2: backup, then swap with bounded retries.
    let backup = match install_binary(source, target, &mut |s, d| fs::copy(s, d)) {
        Ok(backup) => backup,
        Err(e) => {
            tracing::error!("Swap failed, old binary left in place: {}", e);
            discard_staged(source);
            return 1;
        }
    };

    if let Err(e) = record_installed_version(version) {
        // The binary is already swapped; a stale marker self-corrects on
        // the next check, so this is not worth failing the update over.
        tracing::warn!("Could not update version marker: {}", e);
    }

    // Step 3: relaunch and wait for the clean-start handshake before the
    // backup may be removed.
    match confirm_relaunch(target, HANDSHAKE_GRACE) {
        Ok(()) => {
            if let Err(e) = fs::remove_file(&backup) {
                tracing::warn!("Could not remove backup {}: {}", backup.display(), e);
            }
            discard_staged(source);
            tracing::info!("Update applied, relaunch confirmed");
            0
        }
        Err(e) => {
            tracing::error!(
                "Relaunch not confirmed ({}); keeping backup at {}",
                e,
                backup.display()
            );
            1
        }
    }
}

/// Aborted updates must not leave the staged download behind. On Windows
/// the helper is the staged binary itself and cannot unlink its own image;
/// that residue is overwritten by the next download.
fn discard_staged(source: &Path) {
    if let Err(e) = fs::remove_file(source) {
        tracing::warn!("Could not remove staged update {}: {}", source.display(), e);
    }
}

/// Poll until the process is gone. Returns false on timeout.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut sys = System::new();
    loop {
        sys.refresh_processes();
        if sys.process(Pid::from_u32(pid)).is_none() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(WAIT_EXIT_POLL);
    }
}

/// Copy `source` over `target`, keeping a backup of the old binary for the
/// whole operation. On failure the backup is restored so the target is
/// never left partially written; the backup file itself is kept (it is
/// removed only after a verified relaunch).
///
/// The copy operation is injected so tests can simulate lagging file locks.
pub fn install_binary(
    source: &Path,
    target: &Path,
    copy: &mut dyn FnMut(&Path, &Path) -> io::Result<u64>,
) -> Result<PathBuf, UpdateError> {
    let backup = backup_path(target);
    fs::copy(target, &backup)?;
    tracing::debug!("Backed up {} to {}", target.display(), backup.display());

    match copy_with_retries(source, target, copy) {
        Ok(()) => Ok(backup),
        Err(swap_err) => {
            tracing::warn!("Copy failed after retries: {}; restoring backup", swap_err);
            fs::copy(&backup, target).map_err(|e| {
                UpdateError::BackupRestore(format!(
                    "could not restore {} from {}: {}",
                    target.display(),
                    backup.display(),
                    e
                ))
            })?;
            Err(swap_err)
        }
    }
}

fn copy_with_retries(
    source: &Path,
    target: &Path,
    copy: &mut dyn FnMut(&Path, &Path) -> io::Result<u64>,
) -> Result<(), UpdateError> {
    let mut last_err: Option<io::Error> = None;
    for attempt in 1..=COPY_ATTEMPTS {
        match copy(source, target) {
            Ok(_) => {
                make_executable(target)?;
                return Ok(());
            }
            Err(e) => {
                // File locks can lag process exit, so a failed copy is
                // retried a bounded number of times before giving up.
                tracing::debug!(
                    "Copy attempt {}/{} failed: {}",
                    attempt,
                    COPY_ATTEMPTS,
                    e
                );
                last_err = Some(e);
                if attempt < COPY_ATTEMPTS {
                    std::thread::sleep(COPY_RETRY_DELAY);
                }
            }
        }
    }

    let err = last_err.expect("at least one attempt");
    if err.kind() == io::ErrorKind::PermissionDenied {
        Err(UpdateError::Locked(target.to_path_buf()))
    } else {
        Err(UpdateError::Io(err))
    }
}

fn record_installed_version(version: &Version) -> anyhow::Result<()> {
    let dir = config::get_data_dir()?;
    VersionStore::new(dir.join(VERSION_FILE_NAME)).write(version)?;
    Ok(())
}

/// Launch the swapped binary and wait for it to write a clean-start marker
/// newer than the relaunch. Only a verified handshake lets the caller
/// delete the backup.
fn confirm_relaunch(target: &Path, grace: Duration) -> anyhow::Result<()> {
    let marker = config::get_data_dir()?.join(CLEAN_START_MARKER);
    let relaunched_at = SystemTime::now();

    Command::new(target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    tracing::info!("Relaunched {}", target.display());

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(meta) = fs::metadata(&marker) {
            if let Ok(modified) = meta.modified() {
                if modified >= relaunched_at {
                    return Ok(());
                }
            }
        }
        std::thread::sleep(HANDSHAKE_POLL);
    }
    anyhow::bail!("no clean-start marker within {:?}", grace)
}

fn make_executable(path: &Path) -> Result<(), UpdateError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
