//! Scrape job orchestration: lifecycle state machine, dedup pipeline,
//! persistence sequencing and webhook notification.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use seekwatch_core::{
    new_job_id, new_webhook_id, JobEvent, JobRecord, JobStatus, KeyField, ScrapeRequest,
    WebhookRegistration,
};
use seekwatch_scraper::{ScrapeConfig, ScrapeExecutor};
use seekwatch_storage::JsonRecordStore;
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "seekwatch-engine";

/// Records included in a webhook payload are capped to bound its size.
const WEBHOOK_PAYLOAD_RECORD_CAP: usize = 10;
const WEBHOOK_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scraper: ScraperSection,
    pub deduplication: DedupSection,
    pub output: OutputSection,
    pub schedule: ScheduleSection,
    pub api: ApiSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperSection {
    pub base_url: String,
    pub search_path: String,
    pub headless: bool,
    pub max_pages: u32,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ScraperSection {
    fn default() -> Self {
        let defaults = ScrapeConfig::default();
        Self {
            base_url: defaults.base_url,
            search_path: defaults.search_path,
            headless: defaults.headless,
            max_pages: defaults.max_pages,
            timeout_secs: defaults.timeout_secs,
            user_agent: defaults.user_agent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    pub retention_days: i64,
    pub key_field: KeyField,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            retention_days: 30,
            key_field: KeyField::JobUrl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub records_path: PathBuf,
    pub seen_path: PathBuf,
    pub csv_path: PathBuf,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            records_path: PathBuf::from("data/jobs.json"),
            seen_path: PathBuf::from("data/seen_jobs.json"),
            csv_path: PathBuf::from("data/jobs.csv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    pub enabled: bool,
    /// Six-field cron expression (with seconds).
    pub cron: String,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: "0 0 6 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub bind: String,
    /// Accepted `X-API-Key` values. Empty disables authentication.
    pub api_keys: Vec<String>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            api_keys: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: AppConfig =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Explicit path, then `SEEKWATCH_CONFIG`, then `config/config.yaml` if it
    /// exists, then built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        if let Ok(env_path) = std::env::var("SEEKWATCH_CONFIG") {
            return Self::load(Path::new(&env_path));
        }
        let default_path = Path::new("config/config.yaml");
        if default_path.exists() {
            return Self::load(default_path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(keys) = std::env::var("SEEKWATCH_API_KEYS") {
            self.api.api_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(bind) = std::env::var("SEEKWATCH_BIND") {
            self.api.bind = bind;
        }
    }

    /// Effective executor configuration for one job: request-level overrides
    /// merged over the configured defaults.
    pub fn scrape_config(&self, request: &ScrapeRequest) -> ScrapeConfig {
        ScrapeConfig {
            base_url: self.scraper.base_url.clone(),
            search_path: self.scraper.search_path.clone(),
            headless: request.headless.unwrap_or(self.scraper.headless),
            max_pages: request.max_pages.unwrap_or(self.scraper.max_pages),
            timeout_secs: self.scraper.timeout_secs,
            user_agent: self.scraper.user_agent.clone(),
        }
    }
}

/// One orchestration run. Owned by the orchestrator and mutated only under
/// its registry lock; readers get cloned snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeJob {
    pub job_id: String,
    pub request: ScrapeRequest,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub jobs_found: Option<usize>,
    pub jobs_new: Option<usize>,
    pub error: Option<String>,
    pub results: Vec<JobRecord>,
}

impl ScrapeJob {
    fn new(job_id: String, request: ScrapeRequest) -> Self {
        Self {
            job_id,
            request,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            jobs_found: None,
            jobs_new: None,
            error: None,
            results: Vec::new(),
        }
    }

    fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        // Set exactly once even if re-invoked.
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    fn mark_completed(&mut self, jobs_found: usize, results: Vec<JobRecord>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.jobs_found = Some(jobs_found);
        self.jobs_new = Some(results.len());
        self.results = results;
    }

    fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
    }
}

/// Two-stage dedup: collapse duplicates inside one batch, then drop records
/// whose key is already in the store's live seen-set.
#[derive(Debug, Clone, Copy)]
pub struct Deduplicator {
    key_field: KeyField,
}

impl Deduplicator {
    pub fn new(key_field: KeyField) -> Self {
        Self { key_field }
    }

    /// First occurrence of each key wins; order is preserved. Pure.
    pub fn dedup_within_batch(&self, records: Vec<JobRecord>) -> Vec<JobRecord> {
        let mut seen = std::collections::HashSet::new();
        let total = records.len();
        let unique: Vec<JobRecord> = records
            .into_iter()
            .filter(|record| seen.insert(record.dedup_key(self.key_field).to_string()))
            .collect();
        if unique.len() < total {
            debug!(removed = total - unique.len(), "removed within-batch duplicates");
        }
        unique
    }

    /// Keep only records whose key is not in the store's live seen-set.
    /// Reflects the current retention window: pruned entries read as unseen.
    pub async fn filter_unseen(
        &self,
        store: &JsonRecordStore,
        records: Vec<JobRecord>,
    ) -> Vec<JobRecord> {
        let mut unseen = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        for record in records {
            if store.exists(record.dedup_key(self.key_field)).await {
                skipped += 1;
                debug!(title = %record.title, company = %record.company, "skipping previously seen record");
            } else {
                unseen.push(record);
            }
        }
        info!(skipped, new = unseen.len(), "filtered against seen-set");
        unseen
    }
}

/// Owns the job and webhook registries. One instance per process is typical
/// but nothing is global; tests spin up as many as they like.
pub struct Orchestrator {
    config: AppConfig,
    store: Arc<JsonRecordStore>,
    executor: Arc<dyn ScrapeExecutor>,
    jobs: RwLock<HashMap<String, ScrapeJob>>,
    webhooks: RwLock<HashMap<String, WebhookRegistration>>,
    http: reqwest::Client,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        store: Arc<JsonRecordStore>,
        executor: Arc<dyn ScrapeExecutor>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()
            .context("building webhook http client")?;
        Ok(Self {
            config,
            store,
            executor,
            jobs: RwLock::new(HashMap::new()),
            webhooks: RwLock::new(HashMap::new()),
            http,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<JsonRecordStore> {
        self.store.clone()
    }

    /// Register a new job in `Pending` and return its identifier. Execution
    /// is the caller's responsibility, via [`Orchestrator::run`].
    pub fn submit(&self, request: ScrapeRequest) -> String {
        let job_id = new_job_id(Utc::now());
        let job = ScrapeJob::new(job_id.clone(), request);
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.clone(), job);
        info!(%job_id, "scrape job submitted");
        job_id
    }

    pub fn get(&self, job_id: &str) -> Option<ScrapeJob> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    /// Jobs newest-first, optionally filtered by status, capped at `limit`.
    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Vec<ScrapeJob> {
        let mut jobs: Vec<ScrapeJob> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        jobs.truncate(limit);
        jobs
    }

    pub fn register_webhook(
        &self,
        url: String,
        events: Vec<String>,
        description: Option<String>,
    ) -> WebhookRegistration {
        let registration = WebhookRegistration {
            webhook_id: new_webhook_id(),
            url,
            events,
            description,
            created_at: Utc::now(),
        };
        self.webhooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(registration.webhook_id.clone(), registration.clone());
        info!(webhook_id = %registration.webhook_id, "webhook registered");
        registration
    }

    pub fn list_webhooks(&self) -> Vec<WebhookRegistration> {
        let mut registrations: Vec<WebhookRegistration> = self
            .webhooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        registrations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        registrations
    }

    /// False when no registration with that id exists.
    pub fn unregister_webhook(&self, webhook_id: &str) -> bool {
        self.webhooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(webhook_id)
            .is_some()
    }

    /// Execute a submitted job to a terminal state.
    ///
    /// Only a `Pending` job starts; invoking `run` on a running or terminal
    /// job is a no-op, so concurrent or repeated invocations for the same id
    /// are harmless. The blocking executor call runs on the blocking pool so
    /// status polls are never held up. Executor and storage failures become
    /// the `Failed` state; nothing propagates to the submitter.
    pub async fn run(&self, job_id: &str) {
        let span = info_span!("scrape_run", %job_id);
        self.run_inner(job_id).instrument(span).await;
    }

    async fn run_inner(&self, job_id: &str) {
        let Some(request) = self.begin(job_id) else {
            return;
        };

        let scrape_config = match self.effective_config(&request) {
            Ok(config) => config,
            Err(err) => {
                self.fail(job_id, request, format!("config error: {err:#}"));
                return;
            }
        };

        let executor = self.executor.clone();
        let outcome =
            tokio::task::spawn_blocking(move || executor.scrape(&scrape_config)).await;

        let raw = match outcome {
            Ok(Ok(records)) => records,
            Ok(Err(err)) => {
                self.fail(job_id, request, err.to_string());
                return;
            }
            Err(join_err) => {
                self.fail(job_id, request, format!("scrape task aborted: {join_err}"));
                return;
            }
        };

        let deduper = Deduplicator::new(self.config.deduplication.key_field);
        let batch = deduper.dedup_within_batch(raw);
        let jobs_found = batch.len();
        let new_records = deduper.filter_unseen(&self.store, batch).await;

        if let Err(err) = self.store.save(&new_records).await {
            self.fail(job_id, request, err.to_string());
            return;
        }

        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            if let Some(job) = jobs.get_mut(job_id) {
                job.mark_completed(jobs_found, new_records.clone());
            }
        }
        info!(jobs_found, jobs_new = new_records.len(), "scrape job completed");

        let preview: Vec<&JobRecord> = new_records
            .iter()
            .take(WEBHOOK_PAYLOAD_RECORD_CAP)
            .collect();
        let payload = serde_json::json!({
            "jobs_found": jobs_found,
            "jobs_new": new_records.len(),
            "jobs": preview,
        });
        self.dispatch(JobEvent::ScrapeCompleted, job_id, payload, request.webhook_url);
    }

    /// Atomically move a pending job to running and hand back its request.
    fn begin(&self, job_id: &str) -> Option<ScrapeRequest> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(job_id) else {
            warn!(%job_id, "run invoked for unknown job");
            return None;
        };
        if job.status != JobStatus::Pending {
            warn!(%job_id, status = %job.status, "run invoked on non-pending job; ignoring");
            return None;
        }
        job.mark_running();
        Some(job.request.clone())
    }

    fn effective_config(&self, request: &ScrapeRequest) -> Result<ScrapeConfig> {
        match &request.config_path {
            Some(path) => {
                let override_config = AppConfig::load(Path::new(path))?;
                Ok(override_config.scrape_config(request))
            }
            None => Ok(self.config.scrape_config(request)),
        }
    }

    fn fail(&self, job_id: &str, request: ScrapeRequest, error: String) {
        warn!(%job_id, %error, "scrape job failed");
        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            if let Some(job) = jobs.get_mut(job_id) {
                job.mark_failed(error.clone());
            }
        }
        let payload = serde_json::json!({ "error": error });
        self.dispatch(JobEvent::ScrapeFailed, job_id, payload, request.webhook_url);
    }

    /// Best-effort delivery to every subscribed registration plus the
    /// optional one-shot per-job target. Each POST runs on its own task so a
    /// slow endpoint never stalls the caller; failures are logged, not
    /// retried.
    fn dispatch(
        &self,
        event: JobEvent,
        job_id: &str,
        data: serde_json::Value,
        one_shot_url: Option<String>,
    ) {
        let targets: Vec<String> = self
            .webhooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|registration| registration.subscribes_to(event))
            .map(|registration| registration.url.clone())
            .collect();

        let wrapped = serde_json::json!({
            "event": event.as_str(),
            "job_id": job_id,
            "data": data,
            "timestamp": Utc::now(),
        });
        for url in targets {
            let client = self.http.clone();
            let payload = wrapped.clone();
            tokio::spawn(async move { post_webhook(client, url, payload).await });
        }

        // The one-shot target gets the bare data payload, not the envelope.
        if let Some(url) = one_shot_url {
            let client = self.http.clone();
            tokio::spawn(async move { post_webhook(client, url, data).await });
        }
    }
}

async fn post_webhook(client: reqwest::Client, url: String, payload: serde_json::Value) {
    match client.post(&url).json(&payload).send().await {
        Ok(response) if response.status().is_success() => {
            debug!(%url, "webhook delivered");
        }
        Ok(response) => {
            warn!(%url, status = %response.status(), "webhook endpoint rejected delivery");
        }
        Err(err) => {
            warn!(%url, error = %err, "webhook delivery failed");
        }
    }
}

/// Cron-driven recurring scrapes with default request parameters. Returns
/// `None` when scheduling is disabled in config.
pub async fn build_scheduler(orchestrator: Arc<Orchestrator>) -> Result<Option<JobScheduler>> {
    let schedule = orchestrator.config().schedule.clone();
    if !schedule.enabled {
        return Ok(None);
    }

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let cron = schedule.cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            let job_id = orchestrator.submit(ScrapeRequest::default());
            info!(%job_id, "scheduled scrape triggered");
            orchestrator.run(&job_id).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    scheduler.add(job).await.context("adding scheduler job")?;
    Ok(Some(scheduler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use seekwatch_scraper::ScrapeError;
    use tempfile::tempdir;

    struct StubExecutor {
        outcome: Result<Vec<JobRecord>, String>,
    }

    impl StubExecutor {
        fn returning(records: Vec<JobRecord>) -> Arc<Self> {
            Arc::new(Self {
                outcome: Ok(records),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                outcome: Err(message.to_string()),
            })
        }
    }

    impl ScrapeExecutor for StubExecutor {
        fn scrape(&self, _config: &ScrapeConfig) -> Result<Vec<JobRecord>, ScrapeError> {
            match &self.outcome {
                Ok(records) => Ok(records.clone()),
                Err(message) => Err(ScrapeError::Http(message.clone())),
            }
        }
    }

    fn record(url: &str) -> JobRecord {
        JobRecord {
            title: format!("Role {url}"),
            company: "Tech Corp".into(),
            location: "Sydney NSW".into(),
            classification: "Human Resources & Recruitment".into(),
            subcategory: "Management".into(),
            job_url: url.into(),
            posted_date: None,
            salary: None,
            job_type: None,
            description: None,
            scraped_at: Utc::now(),
            job_id: None,
        }
    }

    async fn orchestrator_with(
        dir: &Path,
        executor: Arc<dyn ScrapeExecutor>,
    ) -> Arc<Orchestrator> {
        let store = Arc::new(
            JsonRecordStore::open(
                dir.join("jobs.json"),
                dir.join("seen.json"),
                30,
                KeyField::JobUrl,
            )
            .await
            .expect("open store"),
        );
        Arc::new(Orchestrator::new(AppConfig::default(), store, executor).expect("orchestrator"))
    }

    #[test]
    fn within_batch_dedup_preserves_first_occurrence_order() {
        let deduper = Deduplicator::new(KeyField::JobUrl);
        let records = vec![record("a"), record("b"), record("a"), record("c"), record("b")];
        let unique = deduper.dedup_within_batch(records);
        let urls: Vec<&str> = unique.iter().map(|r| r.job_url.as_str()).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn filter_unseen_drops_only_stored_keys() {
        let dir = tempdir().expect("tempdir");
        let store = JsonRecordStore::open(
            dir.path().join("jobs.json"),
            dir.path().join("seen.json"),
            30,
            KeyField::JobUrl,
        )
        .await
        .expect("open store");
        store.save(&[record("a")]).await.expect("seed");

        let deduper = Deduplicator::new(KeyField::JobUrl);
        let unseen = deduper
            .filter_unseen(&store, vec![record("a"), record("b")])
            .await;
        assert_eq!(unseen.len(), 1);
        assert_eq!(unseen[0].job_url, "b");
    }

    #[tokio::test]
    async fn submitted_job_is_pending_until_run() {
        let dir = tempdir().expect("tempdir");
        let orchestrator = orchestrator_with(dir.path(), StubExecutor::returning(vec![])).await;

        let job_id = orchestrator.submit(ScrapeRequest::default());
        let job = orchestrator.get(&job_id).expect("registered");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_batch_against_empty_seen_set() {
        // Raw {A, B, A}: batch-dedup yields {A, B}, both unseen.
        let dir = tempdir().expect("tempdir");
        let executor = StubExecutor::returning(vec![record("a"), record("b"), record("a")]);
        let orchestrator = orchestrator_with(dir.path(), executor).await;

        let job_id = orchestrator.submit(ScrapeRequest::default());
        orchestrator.run(&job_id).await;

        let job = orchestrator.get(&job_id).expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.jobs_found, Some(2));
        assert_eq!(job.jobs_new, Some(2));
        let urls: Vec<&str> = job.results.iter().map(|r| r.job_url.as_str()).collect();
        assert_eq!(urls, vec!["a", "b"]);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn already_seen_key_is_not_reported_again() {
        let dir = tempdir().expect("tempdir");
        let executor = StubExecutor::returning(vec![record("a"), record("b"), record("a")]);
        let orchestrator = orchestrator_with(dir.path(), executor).await;
        orchestrator.store().save(&[record("a")]).await.expect("seed seen-set");

        let job_id = orchestrator.submit(ScrapeRequest::default());
        orchestrator.run(&job_id).await;

        let job = orchestrator.get(&job_id).expect("job");
        assert_eq!(job.jobs_found, Some(2));
        assert_eq!(job.jobs_new, Some(1));
        assert_eq!(job.results[0].job_url, "b");
    }

    #[tokio::test]
    async fn executor_failure_marks_job_failed_and_persists_nothing() {
        let dir = tempdir().expect("tempdir");
        let orchestrator =
            orchestrator_with(dir.path(), StubExecutor::failing("browser crashed")).await;

        let job_id = orchestrator.submit(ScrapeRequest::default());
        orchestrator.run(&job_id).await;

        let job = orchestrator.get(&job_id).expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.expect("error message");
        assert!(error.contains("browser crashed"));
        assert!(job.started_at.is_some());
        assert!(orchestrator.store().load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn rerunning_a_terminal_job_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let executor = StubExecutor::returning(vec![record("a")]);
        let orchestrator = orchestrator_with(dir.path(), executor).await;

        let job_id = orchestrator.submit(ScrapeRequest::default());
        orchestrator.run(&job_id).await;
        let first = orchestrator.get(&job_id).expect("job");

        orchestrator.run(&job_id).await;
        let second = orchestrator.get(&job_id).expect("job");

        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(second.started_at, first.started_at);
        assert_eq!(second.completed_at, first.completed_at);
        // A second run must not double-report the same records as new.
        assert_eq!(second.jobs_new, Some(1));
        assert_eq!(orchestrator.store().load().await.expect("load").len(), 1);
    }

    #[tokio::test]
    async fn run_for_unknown_job_does_nothing() {
        let dir = tempdir().expect("tempdir");
        let orchestrator = orchestrator_with(dir.path(), StubExecutor::returning(vec![])).await;
        orchestrator.run("scrape_20260829_000000_deadbeef").await;
        assert!(orchestrator.list(None, 10).is_empty());
    }

    #[tokio::test]
    async fn list_is_newest_first_filtered_and_bounded() {
        let dir = tempdir().expect("tempdir");
        let executor = StubExecutor::returning(vec![record("a")]);
        let orchestrator = orchestrator_with(dir.path(), executor).await;

        let first = orchestrator.submit(ScrapeRequest::default());
        let second = orchestrator.submit(ScrapeRequest::default());
        orchestrator.run(&second).await;

        let all = orchestrator.list(None, 10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].job_id, second);
        assert_eq!(all[1].job_id, first);

        let pending = orchestrator.list(Some(JobStatus::Pending), 10);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, first);

        assert_eq!(orchestrator.list(None, 1).len(), 1);
    }

    /// Accept one HTTP POST on `listener`, answer 200 and hand back the
    /// decoded JSON body.
    async fn recv_webhook(listener: tokio::net::TcpListener) -> serde_json::Value {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.expect("read");
            assert!(n > 0, "connection closed before a full request arrived");
            raw.extend_from_slice(&chunk[..n]);
            if let Some(body) = complete_body(&raw) {
                let payload = serde_json::from_slice(body).expect("json payload");
                socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await
                    .expect("respond");
                return payload;
            }
        }
    }

    fn complete_body(raw: &[u8]) -> Option<&[u8]> {
        let headers_end = raw.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
        let headers = std::str::from_utf8(&raw[..headers_end]).ok()?;
        let length = headers.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })?;
        let body = &raw[headers_end..];
        (body.len() >= length).then(|| &body[..length])
    }

    async fn local_webhook_target(path: &str) -> (String, tokio::task::JoinHandle<serde_json::Value>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let url = format!("http://{}{path}", listener.local_addr().expect("addr"));
        (url, tokio::spawn(recv_webhook(listener)))
    }

    #[tokio::test]
    async fn completed_dispatch_delivers_envelope_and_bare_one_shot() {
        let dir = tempdir().expect("tempdir");
        let executor = StubExecutor::returning(vec![record("a"), record("b"), record("a")]);
        let orchestrator = orchestrator_with(dir.path(), executor).await;

        let (registered_url, registered) = local_webhook_target("/hook").await;
        orchestrator.register_webhook(
            registered_url,
            vec!["scrape.completed".to_string()],
            None,
        );
        let (one_shot_url, one_shot) = local_webhook_target("/notify").await;

        let job_id = orchestrator.submit(ScrapeRequest {
            webhook_url: Some(one_shot_url),
            ..Default::default()
        });
        orchestrator.run(&job_id).await;

        let envelope = tokio::time::timeout(Duration::from_secs(5), registered)
            .await
            .expect("registered webhook delivered")
            .expect("receiver task");
        assert_eq!(envelope["event"], "scrape.completed");
        assert_eq!(envelope["job_id"], job_id.as_str());
        assert!(envelope["timestamp"].is_string());
        assert_eq!(envelope["data"]["jobs_found"], 2);
        assert_eq!(envelope["data"]["jobs_new"], 2);
        assert_eq!(envelope["data"]["jobs"].as_array().expect("jobs").len(), 2);

        // The one-shot target gets the data payload without the envelope.
        let bare = tokio::time::timeout(Duration::from_secs(5), one_shot)
            .await
            .expect("one-shot webhook delivered")
            .expect("receiver task");
        assert!(bare.get("event").is_none());
        assert_eq!(bare["jobs_found"], 2);
        assert_eq!(bare["jobs_new"], 2);
    }

    #[tokio::test]
    async fn failed_dispatch_carries_the_error() {
        let dir = tempdir().expect("tempdir");
        let orchestrator =
            orchestrator_with(dir.path(), StubExecutor::failing("browser crashed")).await;

        let (url, receiver) = local_webhook_target("/hook").await;
        orchestrator.register_webhook(url, vec!["scrape.failed".to_string()], None);

        let job_id = orchestrator.submit(ScrapeRequest::default());
        orchestrator.run(&job_id).await;

        let envelope = tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .expect("failure webhook delivered")
            .expect("receiver task");
        assert_eq!(envelope["event"], "scrape.failed");
        assert_eq!(envelope["job_id"], job_id.as_str());
        let error = envelope["data"]["error"].as_str().expect("error field");
        assert!(error.contains("browser crashed"));
    }

    #[tokio::test]
    async fn unreachable_webhook_does_not_delay_terminal_state() {
        let dir = tempdir().expect("tempdir");
        let executor = StubExecutor::returning(vec![record("a")]);
        let orchestrator = orchestrator_with(dir.path(), executor).await;
        orchestrator.register_webhook(
            // Nothing listens here; delivery can only fail.
            "http://127.0.0.1:9/hook".to_string(),
            vec!["scrape.completed".to_string()],
            None,
        );

        let job_id = orchestrator.submit(ScrapeRequest::default());
        let started = std::time::Instant::now();
        orchestrator.run(&job_id).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let job = orchestrator.get(&job_id).expect("job");
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn webhook_registry_round_trip() {
        let dir = tempdir().expect("tempdir");
        let orchestrator = orchestrator_with(dir.path(), StubExecutor::returning(vec![])).await;

        let registration = orchestrator.register_webhook(
            "https://hooks.example.com/jobs".to_string(),
            vec!["scrape.completed".to_string(), "scrape.failed".to_string()],
            Some("integration".to_string()),
        );
        assert!(registration.webhook_id.starts_with("webhook_"));

        let listed = orchestrator.list_webhooks();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].url, "https://hooks.example.com/jobs");

        assert!(orchestrator.unregister_webhook(&registration.webhook_id));
        assert!(!orchestrator.unregister_webhook(&registration.webhook_id));
        assert!(orchestrator.list_webhooks().is_empty());
    }

    #[test]
    fn request_overrides_win_over_config_defaults() {
        let config = AppConfig::default();
        let request = ScrapeRequest {
            headless: Some(false),
            max_pages: Some(2),
            ..Default::default()
        };
        let effective = config.scrape_config(&request);
        assert!(!effective.headless);
        assert_eq!(effective.max_pages, 2);

        let effective = config.scrape_config(&ScrapeRequest::default());
        assert_eq!(effective.headless, config.scraper.headless);
        assert_eq!(effective.max_pages, config.scraper.max_pages);
    }

    #[test]
    fn config_yaml_round_trip_with_partial_sections() {
        let yaml = r#"
scraper:
  max_pages: 3
deduplication:
  retention_days: 7
  key_field: job_id
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.scraper.max_pages, 3);
        assert_eq!(config.deduplication.retention_days, 7);
        assert_eq!(config.deduplication.key_field, KeyField::JobId);
        // Untouched sections keep their defaults.
        assert_eq!(config.api.bind, "0.0.0.0:8000");
    }
}
