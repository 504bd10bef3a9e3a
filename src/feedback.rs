//! Durable feedback telemetry.
//!
//! Records are persisted write-ahead: every submission lands in the local
//! store before any network activity, so a crash or an unreachable endpoint
//! never loses a record. Delivery is best effort with a short timeout;
//! undelivered records stay queued and are retried by `flush`. Failures are
//! internal and logged, never surfaced to the caller.

use crate::config::{FeedbackSettings, FormFields, FEEDBACK_CSV_NAME, FEEDBACK_FILE_NAME};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// A problem the user explicitly reported.
    Error,
    /// Implicit success: the user moved on without reporting anything.
    AutoSuccess,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Error => "error",
            FeedbackKind::AutoSuccess => "auto_success",
        }
    }
}

/// One feedback event. Immutable after creation; only the `delivered` flag
/// is ever updated in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: FeedbackKind,
    /// May be empty for `AutoSuccess`.
    #[serde(default)]
    pub description: String,
    /// Model name, app version, free-form technical context.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub delivered: bool,
}

impl FeedbackRecord {
    pub fn new(
        kind: FeedbackKind,
        description: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            description: description.into(),
            metadata,
            delivered: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackStats {
    pub total: usize,
    pub errors: usize,
    pub auto_successes: usize,
    /// Percentage of records confirmed received by the remote endpoint.
    pub delivery_rate: f64,
}

/// Append-only durable log bounded to the most recent `max_records`, with a
/// CSV mirror for external analysis. Both files are regenerated together on
/// every write, atomically (temp file + rename in the same directory).
#[derive(Debug)]
pub struct FeedbackStore {
    json_path: PathBuf,
    csv_path: PathBuf,
    max_records: usize,
}

impl FeedbackStore {
    pub fn new(data_dir: &Path, max_records: usize) -> Self {
        Self {
            json_path: data_dir.join(FEEDBACK_FILE_NAME),
            csv_path: data_dir.join(FEEDBACK_CSV_NAME),
            max_records,
        }
    }

    pub fn load(&self) -> Result<Vec<FeedbackRecord>> {
        if !self.json_path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.json_path).with_context(|| {
            format!("Could not read feedback store at {}", self.json_path.display())
        })?;
        serde_json::from_str(&content).with_context(|| "Could not parse feedback store as JSON")
    }

    pub fn append(&self, record: FeedbackRecord) -> Result<()> {
        let mut records = self.load().unwrap_or_else(|e| {
            // A corrupt store must not block new records; start over and
            // keep the evidence in the logs.
            tracing::warn!("Feedback store unreadable ({}); starting fresh", e);
            Vec::new()
        });
        records.push(record);
        self.write_all(records)
    }

    /// Acknowledge one send. Marks a single undelivered record per call, so
    /// records that happen to share a timestamp are not marked together.
    pub fn mark_delivered(&self, timestamp: &DateTime<Utc>) -> Result<()> {
        let mut records = self.load()?;
        let found = records
            .iter_mut()
            .find(|r| r.timestamp == *timestamp && !r.delivered);
        if let Some(record) = found {
            record.delivered = true;
            self.write_all(records)?;
        }
        Ok(())
    }

    pub fn undelivered(&self) -> Result<Vec<FeedbackRecord>> {
        Ok(self.load()?.into_iter().filter(|r| !r.delivered).collect())
    }

    pub fn statistics(&self) -> FeedbackStats {
        let records = self.load().unwrap_or_default();
        let total = records.len();
        let errors = records
            .iter()
            .filter(|r| r.kind == FeedbackKind::Error)
            .count();
        let auto_successes = records
            .iter()
            .filter(|r| r.kind == FeedbackKind::AutoSuccess)
            .count();
        let delivered = records.iter().filter(|r| r.delivered).count();
        let delivery_rate = if total > 0 {
            delivered as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        FeedbackStats {
            total,
            errors,
            auto_successes,
            delivery_rate,
        }
    }

    fn write_all(&self, mut records: Vec<FeedbackRecord>) -> Result<()> {
        if records.len() > self.max_records {
            let drop = records.len() - self.max_records;
            records.drain(..drop);
        }

        let dir = self
            .json_path
            .parent()
            .ok_or_else(|| anyhow!("feedback store has no parent directory"))?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_string_pretty(&records)?.as_bytes())?;
        tmp.persist(&self.json_path)?;

        let mut csv = tempfile::NamedTempFile::new_in(dir)?;
        writeln!(csv, "timestamp,kind,delivered,description,metadata")?;
        for record in &records {
            writeln!(
                csv,
                "{},{},{},{},{}",
                record.timestamp.to_rfc3339(),
                record.kind.as_str(),
                record.delivered,
                csv_escape(&record.description),
                csv_escape(&serde_json::to_string(&record.metadata)?),
            )?;
        }
        csv.persist(&self.csv_path)?;

        Ok(())
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Where delivered records go. The endpoint is a write-only sink: anything
/// other than an acknowledged POST counts as undelivered.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn deliver(&self, record: &FeedbackRecord) -> Result<()>;
}

/// POSTs records to a public form as url-encoded named fields.
pub struct FormSink {
    http: reqwest::Client,
    url: String,
    fields: FormFields,
    app_version: String,
}

impl FormSink {
    pub fn new(
        url: impl Into<String>,
        fields: FormFields,
        timeout: Duration,
        app_version: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
            fields,
            app_version: app_version.into(),
        })
    }
}

#[async_trait]
impl FeedbackSink for FormSink {
    async fn deliver(&self, record: &FeedbackRecord) -> Result<()> {
        let metadata_blob = serde_json::to_string(&record.metadata)?;
        let form = [
            (self.fields.kind.as_str(), record.kind.as_str().to_string()),
            (self.fields.description.as_str(), record.description.clone()),
            (self.fields.metadata.as_str(), metadata_blob),
            (
                self.fields.timestamp.as_str(),
                record.timestamp.to_rfc3339(),
            ),
            (self.fields.version.as_str(), self.app_version.clone()),
        ];

        let response = self.http.post(&self.url).form(&form).send().await?;
        let status = response.status();
        // Form backends answer the POST with a redirect on success.
        if status.is_success() || status.as_u16() == 302 {
            Ok(())
        } else {
            Err(anyhow!("feedback endpoint returned {}", status))
        }
    }
}

/// Persist-then-send feedback queue.
///
/// Constructed once at process start and passed by handle to every caller;
/// there is deliberately no process-wide accessor.
pub struct FeedbackQueue {
    store: Mutex<FeedbackStore>,
    sink: Option<Arc<dyn FeedbackSink>>,
    flush_in_flight: AtomicBool,
}

impl FeedbackQueue {
    pub fn new(
        settings: &FeedbackSettings,
        data_dir: &Path,
        app_version: &str,
    ) -> Result<Self> {
        let store = FeedbackStore::new(data_dir, settings.max_records);
        let sink: Option<Arc<dyn FeedbackSink>> = match &settings.form_url {
            Some(url) => Some(Arc::new(FormSink::new(
                url.clone(),
                settings.fields.clone(),
                Duration::from_secs(settings.send_timeout_secs),
                app_version,
            )?)),
            None => {
                tracing::debug!("No feedback endpoint configured; storing locally only");
                None
            }
        };
        Ok(Self::with_sink(store, sink))
    }

    pub fn with_sink(store: FeedbackStore, sink: Option<Arc<dyn FeedbackSink>>) -> Self {
        Self {
            store: Mutex::new(store),
            sink,
            flush_in_flight: AtomicBool::new(false),
        }
    }

    /// Record a feedback event. Never fails from the caller's point of
    /// view: the record is persisted before any network attempt, and
    /// delivery problems degrade to local durability.
    pub async fn submit(
        &self,
        kind: FeedbackKind,
        description: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) {
        let record = FeedbackRecord::new(kind, description, metadata);

        // Write-ahead: the store sees the record before the network does.
        {
            let store = self.store.lock().expect("feedback store lock");
            if let Err(e) = store.append(record.clone()) {
                tracing::error!("Could not persist feedback record: {}", e);
                return;
            }
        }
        tracing::debug!("Persisted {} feedback record", record.kind.as_str());

        self.try_deliver(&record).await;
    }

    /// Retry every undelivered record. At most one flush runs at a time;
    /// overlapping calls return immediately.
    pub async fn flush(&self) -> usize {
        if self
            .flush_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Feedback flush already in flight");
            return 0;
        }

        let pending = {
            let store = self.store.lock().expect("feedback store lock");
            store.undelivered().unwrap_or_default()
        };

        let mut delivered = 0;
        for record in &pending {
            if self.try_deliver(record).await {
                delivered += 1;
            }
        }
        if !pending.is_empty() {
            tracing::info!(
                "Feedback flush: {}/{} records delivered",
                delivered,
                pending.len()
            );
        }

        self.flush_in_flight.store(false, Ordering::SeqCst);
        delivered
    }

    pub fn statistics(&self) -> FeedbackStats {
        self.store
            .lock()
            .expect("feedback store lock")
            .statistics()
    }

    async fn try_deliver(&self, record: &FeedbackRecord) -> bool {
        let Some(sink) = &self.sink else {
            return false;
        };

        match sink.deliver(record).await {
            Ok(()) => {
                let store = self.store.lock().expect("feedback store lock");
                if let Err(e) = store.mark_delivered(&record.timestamp) {
                    // Worst case the record is re-sent on the next flush;
                    // the endpoint tolerates duplicates.
                    tracing::warn!("Delivered but could not mark record: {}", e);
                }
                true
            }
            Err(e) => {
                tracing::warn!("Feedback delivery failed, record stays queued: {}", e);
                false
            }
        }
    }
}

/// Tracks the implicit-success policy: silence is success.
///
/// A completed job for which the user never reports an error becomes an
/// `AutoSuccess` record when the next job completes or the application
/// shuts down. This mirrors the deployed behavior on purpose; adding an
/// explicit confirmation step would change what the telemetry means.
pub struct SessionTracker {
    current: Mutex<Option<JobState>>,
}

#[derive(Debug, Clone)]
struct JobState {
    id: String,
    metadata: BTreeMap<String, String>,
    error_reported: bool,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Note a successfully completed job. If an earlier job ended without
    /// an error report, it is now counted as an implicit success.
    pub async fn job_completed(
        &self,
        queue: &FeedbackQueue,
        job_id: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) {
        let job_id = job_id.into();
        let previous = {
            let mut current = self.current.lock().expect("session lock");
            let previous = match current.take() {
                Some(prev) if prev.id != job_id && !prev.error_reported => Some(prev),
                _ => None,
            };
            *current = Some(JobState {
                id: job_id,
                metadata,
                error_reported: false,
            });
            previous
        };

        if let Some(prev) = previous {
            tracing::debug!("Job {} ended without an error report", prev.id);
            let mut metadata = prev.metadata;
            metadata.insert("job".to_string(), prev.id);
            queue
                .submit(FeedbackKind::AutoSuccess, "", metadata)
                .await;
        }
    }

    /// Explicit user error report for the current job. Returns false when
    /// there is no current job or one report was already filed for it.
    pub async fn report_error(
        &self,
        queue: &FeedbackQueue,
        description: impl Into<String>,
        extra: BTreeMap<String, String>,
    ) -> bool {
        let job = {
            let mut current = self.current.lock().expect("session lock");
            match current.as_mut() {
                None => {
                    tracing::debug!("Error report ignored: no job in progress");
                    return false;
                }
                Some(job) if job.error_reported => {
                    tracing::debug!("Error report ignored: already filed for {}", job.id);
                    return false;
                }
                Some(job) => {
                    job.error_reported = true;
                    job.clone()
                }
            }
        };

        let mut metadata = job.metadata;
        metadata.extend(extra);
        metadata.insert("job".to_string(), job.id);
        queue.submit(FeedbackKind::Error, description, metadata).await;
        true
    }

    /// Application shutdown: the job in progress, if unreported, counts as
    /// an implicit success.
    pub async fn shutdown(&self, queue: &FeedbackQueue) {
        let last = {
            let mut current = self.current.lock().expect("session lock");
            match current.take() {
                Some(job) if !job.error_reported => Some(job),
                _ => None,
            }
        };

        if let Some(job) = last {
            let mut metadata = job.metadata;
            metadata.insert("job".to_string(), job.id);
            queue
                .submit(FeedbackKind::AutoSuccess, "", metadata)
                .await;
        }
    }
}
