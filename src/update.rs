//! Update orchestration.
//!
//! Drives `Idle → Checking → (Idle | Downloading) → ReadyToApply → Applying
//! → Restarting`, with `Failed` reachable from any non-terminal state. One
//! cycle runs at a time; concurrent triggers are coalesced, not queued.
//! Cancellation is honored up to `Applying`; once the swap begins the cycle
//! always runs to a terminal state, because a half-copied binary is worse
//! than a slow one.

use crate::errors::UpdateError;
use crate::install::{SwapPlan, Swapper};
use crate::release::{ReleaseInfo, ReleaseSource};
use crate::version::VersionStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Checking,
    Downloading,
    ReadyToApply,
    Applying,
    Restarting,
    Failed { reason: String },
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateState::Idle => write!(f, "idle"),
            UpdateState::Checking => write!(f, "checking"),
            UpdateState::Downloading => write!(f, "downloading"),
            UpdateState::ReadyToApply => write!(f, "ready to apply"),
            UpdateState::Applying => write!(f, "applying"),
            UpdateState::Restarting => write!(f, "restarting"),
            UpdateState::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

pub struct UpdateOrchestrator {
    source: Arc<dyn ReleaseSource>,
    swapper: Arc<dyn Swapper>,
    version_store: VersionStore,
    /// Where downloaded assets are staged. Must be on the same filesystem
    /// as nothing in particular; the helper copies, not renames, into the
    /// target path.
    download_dir: PathBuf,
    /// Path of the executable the helper will replace.
    target: PathBuf,
    state_tx: watch::Sender<UpdateState>,
    in_flight: AtomicBool,
    /// Token for the cycle currently in flight; replaced on every trigger
    /// so an earlier cancellation cannot poison the next cycle.
    cancel: std::sync::Mutex<CancellationToken>,
}

impl UpdateOrchestrator {
    pub fn new(
        source: Arc<dyn ReleaseSource>,
        swapper: Arc<dyn Swapper>,
        version_store: VersionStore,
        download_dir: PathBuf,
        target: PathBuf,
    ) -> Self {
        let (state_tx, _) = watch::channel(UpdateState::Idle);
        Self {
            source,
            swapper,
            version_store,
            download_dir,
            target,
            state_tx,
            in_flight: AtomicBool::new(false),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    /// Current state plus a stream of transitions for the UI to poll or
    /// subscribe to; nothing in the pipeline ever blocks the caller.
    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> UpdateState {
        self.state_tx.borrow().clone()
    }

    /// Start one background check/apply cycle. Returns `None` when a cycle
    /// is already in flight (triggers coalesce).
    ///
    /// An embedding host is expected to call this once shortly after
    /// startup and again for user-initiated checks; the `upkeep` CLI runs
    /// a cycle only per `update` invocation.
    pub fn trigger(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Update cycle already in flight; trigger coalesced");
            return None;
        }

        let token = CancellationToken::new();
        *self.cancel.lock().expect("cancel token lock") = token.clone();

        Some(tokio::spawn(async move {
            self.run_cycle(token).await;
            self.in_flight.store(false, Ordering::SeqCst);
        }))
    }

    /// Abort the in-flight cycle. Effective only before `Applying`.
    pub fn cancel(&self) {
        self.cancel.lock().expect("cancel token lock").cancel();
    }

    /// Manual check: resolve the latest release and report whether it is
    /// newer than the installed version, without downloading anything.
    /// Unlike the background cycle this surfaces parse errors to the
    /// caller.
    pub async fn check_only(&self) -> Result<Option<ReleaseInfo>, UpdateError> {
        let release = self.source.latest().await?;
        match self.version_store.read() {
            Ok(installed) if release.version <= installed => Ok(None),
            Ok(_) => Ok(Some(release)),
            // No marker yet: first run on this machine, anything published
            // counts as newer.
            Err(UpdateError::Marker(_)) => Ok(Some(release)),
            Err(e) => Err(e),
        }
    }

    async fn run_cycle(&self, token: CancellationToken) {
        match self.cycle_inner(&token).await {
            Ok(terminal) => self.set_state(terminal),
            Err(e) => {
                if e.is_transient() {
                    tracing::info!("Update check failed, will retry later: {}", e);
                } else {
                    tracing::warn!("Update cycle failed: {}", e);
                }
                self.set_state(UpdateState::Failed {
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn cycle_inner(&self, token: &CancellationToken) -> Result<UpdateState, UpdateError> {
        self.set_state(UpdateState::Checking);

        let release = tokio::select! {
            _ = token.cancelled() => {
                tracing::info!("Update check cancelled");
                return Ok(UpdateState::Idle);
            }
            result = self.check_only() => match result? {
                Some(release) => release,
                None => {
                    tracing::info!("Already on the latest version");
                    return Ok(UpdateState::Idle);
                }
            },
        };

        tracing::info!(
            "New version available: {} ({})",
            release.version,
            release.asset_name
        );
        self.set_state(UpdateState::Downloading);

        let staged = self
            .download_dir
            .join(format!("update_{}", release.asset_name));

        let fetched = tokio::select! {
            _ = token.cancelled() => None,
            result = self.source.fetch(&release, &staged) => Some(result),
        };
        let written = match fetched {
            Some(Ok(written)) => written,
            Some(Err(e)) => {
                self.discard(&staged);
                return Err(e);
            }
            None => {
                // User dismissed the update mid-download: no residue.
                tracing::info!("Download cancelled, removing {}", staged.display());
                self.discard(&staged);
                return Ok(UpdateState::Idle);
            }
        };
        tracing::debug!("Staged {} bytes at {}", written, staged.display());

        self.set_state(UpdateState::ReadyToApply);
        if token.is_cancelled() {
            self.discard(&staged);
            return Ok(UpdateState::Idle);
        }

        // Point of no return: from here the cycle ignores cancellation and
        // runs to Restarting or Failed.
        self.set_state(UpdateState::Applying);
        let plan = SwapPlan {
            source: staged,
            target: self.target.clone(),
            parent_pid: std::process::id(),
            version: release.version.clone(),
        };
        self.swapper.begin_swap(&plan)?;

        Ok(UpdateState::Restarting)
    }

    fn discard(&self, staged: &std::path::Path) {
        if staged.exists() {
            if let Err(e) = std::fs::remove_file(staged) {
                tracing::warn!("Could not remove {}: {}", staged.display(), e);
            }
        }
    }

    fn set_state(&self, state: UpdateState) {
        tracing::debug!("Update state: {}", state);
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use semver::Version;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeSource {
        release: ReleaseInfo,
        latest_delay: Duration,
        fetch_calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(version: &str) -> Self {
            Self {
                release: ReleaseInfo {
                    version: Version::parse(version).unwrap(),
                    asset_url: "https://example.com/scanner".into(),
                    asset_name: "scanner".into(),
                    asset_size: Some(10),
                },
                latest_delay: Duration::ZERO,
                fetch_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReleaseSource for FakeSource {
        async fn latest(&self) -> Result<ReleaseInfo, UpdateError> {
            tokio::time::sleep(self.latest_delay).await;
            Ok(self.release.clone())
        }

        async fn fetch(&self, _release: &ReleaseInfo, dest: &Path) -> Result<u64, UpdateError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(dest, b"new binary")?;
            Ok(10)
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ReleaseSource for FailingSource {
        async fn latest(&self) -> Result<ReleaseInfo, UpdateError> {
            Err(UpdateError::Network("connection refused".into()))
        }
        async fn fetch(&self, _: &ReleaseInfo, _: &Path) -> Result<u64, UpdateError> {
            unreachable!("fetch must not run when the check fails")
        }
    }

    #[derive(Default)]
    struct RecordingSwapper {
        plans: Mutex<Vec<SwapPlan>>,
    }

    impl Swapper for RecordingSwapper {
        fn begin_swap(&self, plan: &SwapPlan) -> Result<(), UpdateError> {
            self.plans.lock().unwrap().push(plan.clone());
            Ok(())
        }
    }

    fn orchestrator(
        source: Arc<dyn ReleaseSource>,
        installed: Option<&str>,
    ) -> (Arc<UpdateOrchestrator>, Arc<RecordingSwapper>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path().join("VERSION"));
        if let Some(v) = installed {
            store.write(&Version::parse(v).unwrap()).unwrap();
        }
        let swapper = Arc::new(RecordingSwapper::default());
        let orch = Arc::new(UpdateOrchestrator::new(
            source,
            swapper.clone(),
            store,
            dir.path().join("staging"),
            dir.path().join("app"),
        ));
        (orch, swapper, dir)
    }

    #[tokio::test]
    async fn newer_release_reaches_restarting() {
        let source = Arc::new(FakeSource::new("1.0.1"));
        let (orch, swapper, _dir) = orchestrator(source.clone(), Some("1.0.0"));

        orch.clone().trigger().unwrap().await.unwrap();

        assert_eq!(orch.state(), UpdateState::Restarting);
        let plans = swapper.plans.lock().unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].version, Version::new(1, 0, 1));
        assert!(plans[0].source.exists(), "staged binary left for helper");
    }

    #[tokio::test]
    async fn same_version_returns_to_idle_without_downloading() {
        let source = Arc::new(FakeSource::new("1.0.1"));
        let (orch, swapper, _dir) = orchestrator(source.clone(), Some("1.0.1"));

        orch.clone().trigger().unwrap().await.unwrap();

        assert_eq!(orch.state(), UpdateState::Idle);
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 0);
        assert!(swapper.plans.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn older_release_never_downloads() {
        let source = Arc::new(FakeSource::new("0.9.0"));
        let (orch, _swapper, _dir) = orchestrator(source.clone(), Some("1.0.0"));

        orch.clone().trigger().unwrap().await.unwrap();

        assert_eq!(orch.state(), UpdateState::Idle);
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn network_failure_reaches_failed() {
        let (orch, swapper, _dir) = orchestrator(Arc::new(FailingSource), Some("1.0.0"));

        orch.clone().trigger().unwrap().await.unwrap();

        assert!(matches!(orch.state(), UpdateState::Failed { .. }));
        assert!(swapper.plans.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_triggers_are_coalesced() {
        let mut source = FakeSource::new("1.0.1");
        source.latest_delay = Duration::from_millis(200);
        let (orch, _swapper, _dir) = orchestrator(Arc::new(source), Some("1.0.0"));

        let handle = orch.clone().trigger().unwrap();
        assert!(orch.clone().trigger().is_none(), "second trigger must coalesce");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_before_apply_returns_to_idle() {
        let mut source = FakeSource::new("1.0.1");
        source.latest_delay = Duration::from_secs(30);
        let (orch, swapper, _dir) = orchestrator(Arc::new(source), Some("1.0.0"));

        let handle = orch.clone().trigger().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.cancel();
        handle.await.unwrap();

        assert_eq!(orch.state(), UpdateState::Idle);
        assert!(swapper.plans.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_marker_counts_as_update_available() {
        let source = Arc::new(FakeSource::new("1.0.1"));
        let (orch, swapper, _dir) = orchestrator(source, None);

        orch.clone().trigger().unwrap().await.unwrap();

        assert_eq!(orch.state(), UpdateState::Restarting);
        assert_eq!(swapper.plans.lock().unwrap().len(), 1);
    }
}
