use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jobyard::lease::{is_due_for_promotion, is_eligible, is_stuck, lease_order};
use jobyard::*;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    queues: BTreeMap<String, QueueConfig>,
    dependencies: HashMap<JobId, Vec<JobId>>,
    logs: Vec<JobLogEntry>,
    workers: BTreeMap<String, WorkerRecord>,
    recurring: HashMap<RecurringJobId, RecurringJob>,
}

impl State {
    fn dependencies_met(&self, job_id: JobId) -> bool {
        self.dependencies.get(&job_id).map_or(true, |deps| {
            deps.iter().all(|dep| {
                self.jobs
                    .get(dep)
                    .is_some_and(|job| job.status == JobStatus::Completed)
            })
        })
    }

    /// True when `from` already depends, directly or not, on `target`.
    fn reaches(&self, from: JobId, target: JobId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if seen.insert(id) {
                if let Some(deps) = self.dependencies.get(&id) {
                    stack.extend(deps.iter().copied());
                }
            }
        }
        false
    }

    /// Ancestors of every job that survives a cleanup of `candidates`.
    /// Deleting one of them would let its dependent lease without the
    /// dependency ever completing.
    fn protected_dependencies(
        &self,
        candidates: &HashSet<JobId>,
    ) -> HashSet<JobId> {
        let mut protected = HashSet::new();
        let mut stack: Vec<JobId> = self
            .dependencies
            .iter()
            .filter(|(job_id, _)| !candidates.contains(job_id))
            .flat_map(|(_, deps)| deps.iter().copied())
            .collect();
        while let Some(id) = stack.pop() {
            if protected.insert(id) {
                if let Some(deps) = self.dependencies.get(&id) {
                    stack.extend(deps.iter().copied());
                }
            }
        }
        protected
    }

    fn queue(&self, name: &str) -> QueueConfig {
        self.queues
            .get(name)
            .cloned()
            .unwrap_or_else(|| QueueConfig::new(name))
    }
}

/// In-memory backend implementing every storage trait.
///
/// One mutex guards all state, so each operation is atomic the same way a
/// database transaction would be. Lifecycle rules come from the shared
/// helpers in `jobyard`, so this store and the PostgreSQL one agree.
#[derive(Clone, Debug)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent call fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// All jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> =
            self.state.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Overwrite a stored job, for arranging states the API cannot reach
    /// directly.
    pub fn put_job(&self, job: Job) {
        self.state.lock().jobs.insert(job.id, job);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(JobError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId> {
        self.check()?;
        let now = self.now();
        let mut state = self.state.lock();
        let depends_on = new_job.options.depends_on.clone();
        let queue = state.queue(&new_job.queue_name);
        let job = new_job.into_job(&queue, now)?;

        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = state.jobs.values().find(|j| {
                j.tenant_id == job.tenant_id
                    && j.idempotency_key.as_deref() == Some(key.as_str())
            }) {
                return Ok(existing.id);
            }
        }
        if let Some(missing) =
            depends_on.iter().find(|dep| !state.jobs.contains_key(dep))
        {
            return Err(JobError::JobNotFound(*missing));
        }

        let id = job.id;
        if !depends_on.is_empty() {
            state.dependencies.insert(id, depends_on);
        }
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Job> {
        self.check()?;
        self.state
            .lock()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(JobError::JobNotFound(job_id))
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        self.check()?;
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn lease_next(
        &self,
        request: &LeaseRequest,
    ) -> Result<Option<JobLease>> {
        self.check()?;
        let now = self.now();
        let mut state = self.state.lock();
        let queue = state.queue(&request.queue_name);
        if queue.is_paused {
            return Ok(None);
        }
        if queue.concurrency_limit > 0 {
            let processing = state
                .jobs
                .values()
                .filter(|job| {
                    job.queue_name == request.queue_name
                        && job.status == JobStatus::Processing
                })
                .count();
            if queue.is_saturated(processing) {
                return Ok(None);
            }
        }

        let candidate = state
            .jobs
            .values()
            .filter(|job| {
                job.queue_name == request.queue_name
                    && is_eligible(job, now)
                    && state.dependencies_met(job.id)
            })
            .min_by(|a, b| lease_order(a, b))
            .map(|job| job.id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(JobError::JobNotFound(job_id))?;
        job.mark_leased(&request.worker_id, now);
        Ok(JobLease::from_job(job.clone()))
    }

    async fn update_status(
        &self,
        job_id: JobId,
        update: StatusUpdate,
    ) -> Result<Job> {
        self.check()?;
        let now = self.now();
        let mut state = self.state.lock();
        let queue_name = state
            .jobs
            .get(&job_id)
            .map(|job| job.queue_name.clone())
            .ok_or(JobError::JobNotFound(job_id))?;
        let policy = RetryPolicy::for_queue(&state.queue(&queue_name));

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(JobError::JobNotFound(job_id))?;
        let mut next = job.clone();
        next.apply_update(&update, &policy, now)?;
        *job = next.clone();
        Ok(next)
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        worker_id: &str,
        progress: u8,
        data: Option<Value>,
    ) -> Result<()> {
        self.check()?;
        let now = self.now();
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(JobError::JobNotFound(job_id))?;
        if job.status != JobStatus::Processing
            || job.locked_by.as_deref() != Some(worker_id)
        {
            return Err(JobError::LeaseNotHeld {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        job.progress = progress.min(100);
        if data.is_some() {
            job.progress_data = data;
        }
        job.updated_at = now;
        Ok(())
    }

    async fn append_log(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: &str,
        details: Option<Value>,
    ) -> Result<()> {
        self.check()?;
        let now = self.now();
        let mut state = self.state.lock();
        if !state.jobs.contains_key(&job_id) {
            return Err(JobError::JobNotFound(job_id));
        }
        state.logs.push(JobLogEntry {
            id: Uuid::now_v7(),
            job_id,
            level,
            message: message.to_string(),
            details,
            created_at: now,
        });
        Ok(())
    }

    async fn logs(&self, job_id: JobId) -> Result<Vec<JobLogEntry>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .logs
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn add_dependency(
        &self,
        job_id: JobId,
        depends_on: JobId,
    ) -> Result<()> {
        self.check()?;
        if job_id == depends_on {
            return Err(JobError::validation("a job cannot depend on itself"));
        }
        let mut state = self.state.lock();
        for id in [job_id, depends_on] {
            if !state.jobs.contains_key(&id) {
                return Err(JobError::JobNotFound(id));
            }
        }
        if state.reaches(depends_on, job_id) {
            return Err(JobError::validation(format!(
                "dependency {job_id} -> {depends_on} would create a cycle"
            )));
        }
        let deps = state.dependencies.entry(job_id).or_default();
        if !deps.contains(&depends_on) {
            deps.push(depends_on);
        }
        Ok(())
    }

    async fn dependencies(&self, job_id: JobId) -> Result<Vec<JobId>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .dependencies
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn promote_delayed(&self) -> Result<u64> {
        self.check()?;
        let now = self.now();
        let mut state = self.state.lock();
        let mut promoted = 0;
        for job in state.jobs.values_mut() {
            if is_due_for_promotion(job, now) {
                job.status = JobStatus::Queued;
                job.updated_at = now;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn reclaim_stuck(&self, stuck_after: Duration) -> Result<Vec<JobId>> {
        self.check()?;
        let now = self.now();
        let mut state = self.state.lock();
        let mut reclaimed = Vec::new();
        for job in state.jobs.values_mut() {
            if is_stuck(job, now, stuck_after) {
                job.reclaim(now);
                reclaimed.push(job.id);
            }
        }
        reclaimed.sort();
        Ok(reclaimed)
    }

    async fn upsert_queue(&self, config: QueueConfig) -> Result<QueueConfig> {
        self.check()?;
        config.validate()?;
        self.state
            .lock()
            .queues
            .insert(config.name.clone(), config.clone());
        Ok(config)
    }

    async fn queue_config(&self, name: &str) -> Result<QueueConfig> {
        self.check()?;
        Ok(self.state.lock().queue(name))
    }

    async fn list_queues(&self) -> Result<Vec<QueueConfig>> {
        self.check()?;
        Ok(self.state.lock().queues.values().cloned().collect())
    }

    async fn queue_stats(&self, name: &str) -> Result<QueueStats> {
        self.check()?;
        let state = self.state.lock();
        let mut stats = QueueStats::new(name);
        for job in state.jobs.values().filter(|job| job.queue_name == name) {
            stats.observe(job);
        }
        Ok(stats)
    }

    async fn all_queue_stats(&self) -> Result<Vec<QueueStats>> {
        self.check()?;
        let state = self.state.lock();
        let mut stats = collect_queue_stats(state.jobs.values());
        for name in state.queues.keys() {
            stats
                .entry(name.clone())
                .or_insert_with(|| QueueStats::new(name));
        }
        Ok(stats.into_values().collect())
    }

    async fn queue_metrics(
        &self,
        name: &str,
        bucket: BucketSize,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricsBucket>> {
        self.check()?;
        let state = self.state.lock();
        Ok(bucket_metrics(state.jobs.values(), name, bucket, since))
    }

    async fn cleanup(&self, retention: Duration) -> Result<CleanupReport> {
        self.check()?;
        let Some(cutoff) = self.now().checked_sub_signed(retention) else {
            return Ok(CleanupReport::default());
        };
        let mut state = self.state.lock();

        let candidates: HashSet<JobId> = state
            .jobs
            .values()
            .filter(|job| {
                job.is_terminal()
                    && job
                        .completed_at
                        .or(job.failed_at)
                        .unwrap_or(job.updated_at)
                        < cutoff
            })
            .map(|job| job.id)
            .collect();
        let protected = state.protected_dependencies(&candidates);
        let doomed: HashSet<JobId> =
            candidates.difference(&protected).copied().collect();

        let logs_before = state.logs.len();
        state.logs.retain(|entry| !doomed.contains(&entry.job_id));
        let logs_deleted = logs_before - state.logs.len();

        state.jobs.retain(|id, _| !doomed.contains(id));
        state.dependencies.retain(|id, _| !doomed.contains(id));
        for deps in state.dependencies.values_mut() {
            deps.retain(|dep| !doomed.contains(dep));
        }

        Ok(CleanupReport {
            jobs_deleted: doomed.len() as u64,
            logs_deleted: logs_deleted as u64,
        })
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryJobStore {
    async fn register_worker(
        &self,
        registration: WorkerRegistration,
    ) -> Result<WorkerRecord> {
        self.check()?;
        let record = WorkerRecord::register(registration, self.now());
        self.state
            .lock()
            .workers
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        current_job_id: Option<JobId>,
    ) -> Result<()> {
        self.check()?;
        let now = self.now();
        self.state
            .lock()
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| JobError::WorkerNotFound(worker_id.to_string()))?
            .heartbeat(current_job_id, now);
        Ok(())
    }

    async fn stop_worker(&self, worker_id: &str) -> Result<()> {
        self.check()?;
        let now = self.now();
        self.state
            .lock()
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| JobError::WorkerNotFound(worker_id.to_string()))?
            .stop(now);
        Ok(())
    }

    async fn stop_silent_workers(
        &self,
        silence: Duration,
    ) -> Result<Vec<String>> {
        self.check()?;
        let now = self.now();
        let Some(cutoff) = now.checked_sub_signed(silence) else {
            return Ok(Vec::new());
        };
        let mut stopped = Vec::new();
        for worker in self.state.lock().workers.values_mut() {
            if worker.is_silent_since(cutoff) {
                worker.stop(now);
                stopped.push(worker.id.clone());
            }
        }
        Ok(stopped)
    }

    async fn list_workers(
        &self,
        status: Option<WorkerStatus>,
    ) -> Result<Vec<WorkerRecord>> {
        self.check()?;
        let mut workers: Vec<WorkerRecord> = self
            .state
            .lock()
            .workers
            .values()
            .filter(|w| status.map_or(true, |s| w.status == s))
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(workers)
    }
}

#[async_trait]
impl RecurringJobStore for InMemoryJobStore {
    async fn create_recurring(
        &self,
        definition: NewRecurringJob,
    ) -> Result<RecurringJob> {
        self.check()?;
        let recurring = definition.into_recurring(self.now())?;
        let mut state = self.state.lock();
        if state.recurring.values().any(|r| r.name == recurring.name) {
            return Err(JobError::Conflict(format!(
                "recurring job {} already exists",
                recurring.name
            )));
        }
        state.recurring.insert(recurring.id, recurring.clone());
        Ok(recurring)
    }

    async fn get_recurring(&self, id: RecurringJobId) -> Result<RecurringJob> {
        self.check()?;
        self.state
            .lock()
            .recurring
            .get(&id)
            .cloned()
            .ok_or(JobError::RecurringJobNotFound(id))
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringJob>> {
        self.check()?;
        let mut all: Vec<RecurringJob> =
            self.state.lock().recurring.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn delete_recurring(&self, id: RecurringJobId) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        state
            .recurring
            .remove(&id)
            .ok_or(JobError::RecurringJobNotFound(id))?;
        for job in state.jobs.values_mut() {
            if job.recurring_job_id == Some(id) {
                job.recurring_job_id = None;
            }
        }
        Ok(())
    }

    async fn claim_recurring_run(
        &self,
        id: RecurringJobId,
        expected: Option<DateTime<Utc>>,
        run_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock();
        let recurring = state
            .recurring
            .get_mut(&id)
            .ok_or(JobError::RecurringJobNotFound(id))?;
        if recurring.last_run_at != expected {
            return Ok(false);
        }
        recurring.last_run_at = Some(run_at);
        Ok(true)
    }
}
