use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::scheduler::clock::Clock;

/// Callback invoked on every tick boundary of a registered job.
#[async_trait]
pub trait TickHandler: Send + Sync + 'static {
    async fn on_tick(&self, job_id: &str, fired_at: Instant);
}

struct ScheduledJob {
    interval: Duration,
    next_fire: Instant,
    handler: Arc<dyn TickHandler>,
    in_flight: Arc<AtomicBool>,
}

impl ScheduledJob {
    /// Move `next_fire` past `now`, collapsing any missed boundaries into one.
    /// Returns how many boundaries were dropped.
    fn advance_past(&mut self, now: Instant) -> u64 {
        if self.next_fire > now {
            return 0;
        }
        let behind = now.duration_since(self.next_fire).as_nanos();
        let step = self.interval.as_nanos().max(1);
        let missed = behind / step;
        let jumps = u32::try_from(missed + 1).unwrap_or(u32::MAX);
        self.next_fire += self.interval.saturating_mul(jumps);
        u64::try_from(missed).unwrap_or(u64::MAX)
    }
}

/// Registered jobs plus the in-flight flag of every job id whose callback may
/// still be running. A flag outlives its registration so that deregistering
/// and registering again cannot start a second concurrent callback.
#[derive(Default)]
struct JobTable {
    scheduled: HashMap<String, ScheduledJob>,
    flags: HashMap<String, Arc<AtomicBool>>,
}

impl JobTable {
    fn flag(&mut self, job_id: &str) -> Arc<AtomicBool> {
        self.flags
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Forget flags of unregistered jobs whose last callback has finished.
    fn prune_flags(&mut self) {
        let scheduled = &self.scheduled;
        self.flags
            .retain(|job_id, flag| scheduled.contains_key(job_id) || flag.load(Ordering::Acquire));
    }
}

/// Clears a job's in-flight flag and returns its pool permit when the
/// callback ends, including by panic.
struct InFlightGuard {
    flag: Arc<AtomicBool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub fired: usize,
    /// Due, but the previous invocation is still running.
    pub skipped_in_flight: usize,
    /// Due, but the worker pool was saturated.
    pub rejected: usize,
}

#[derive(Debug, Default)]
struct Counters {
    fired: AtomicU64,
    skipped_in_flight: AtomicU64,
    rejected: AtomicU64,
    coalesced: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub fired: u64,
    pub skipped_in_flight: u64,
    pub rejected: u64,
    pub coalesced: u64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub pool_size: usize,
    pub resolution: Duration,
    pub max_start_jitter: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: crate::config::TASK_THREAD_POOL_SIZE,
            resolution: Duration::from_millis(100),
            max_start_jitter: Duration::ZERO,
        }
    }
}

/// Fires per-job ticks on a fixed interval.
///
/// A job never has two callbacks running at once. Callbacks run on a bounded
/// pool; a due tick that finds the pool full is dropped for that boundary.
pub struct SchedulerEngine {
    jobs: Mutex<JobTable>,
    pool: Arc<Semaphore>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    counters: Counters,
}

impl SchedulerEngine {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let pool_size = config.pool_size.max(1);
        Self {
            jobs: Mutex::new(JobTable::default()),
            pool: Arc::new(Semaphore::new(pool_size)),
            config: SchedulerConfig {
                pool_size,
                ..config
            },
            clock,
            shutdown: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    fn start_delay(&self) -> Duration {
        let max = self.config.max_start_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Register (or replace) a job. The first tick is due immediately, plus
    /// the configured start jitter, unless a callback for the same job id is
    /// still running.
    pub async fn register(&self, job_id: &str, interval: Duration, handler: Arc<dyn TickHandler>) {
        let next_fire = self.clock.now() + self.start_delay();
        let mut jobs = self.jobs.lock().await;
        let in_flight = jobs.flag(job_id);
        jobs.scheduled.insert(
            job_id.to_string(),
            ScheduledJob {
                interval,
                next_fire,
                handler,
                in_flight,
            },
        );
        tracing::debug!(job_id = %job_id, interval_ms = interval.as_millis() as u64, "Job scheduled");
    }

    /// Remove a job. A callback already running is left to finish.
    pub async fn deregister(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        let removed = jobs.scheduled.remove(job_id).is_some();
        jobs.prune_flags();
        if removed {
            tracing::debug!(job_id = %job_id, "Job unscheduled");
        }
        removed
    }

    /// Change a job's interval. The next tick is one new interval from now.
    pub async fn reschedule(&self, job_id: &str, interval: Duration) -> bool {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().await;
        match jobs.scheduled.get_mut(job_id) {
            Some(job) => {
                job.interval = interval;
                job.next_fire = now + interval;
                tracing::debug!(job_id = %job_id, interval_ms = interval.as_millis() as u64, "Job rescheduled");
                true
            }
            None => false,
        }
    }

    pub async fn is_registered(&self, job_id: &str) -> bool {
        self.jobs.lock().await.scheduled.contains_key(job_id)
    }

    /// Evaluate every job once and spawn the callbacks that are due.
    pub async fn poll(&self) -> PollSummary {
        let mut summary = PollSummary::default();
        if self.shutdown.is_cancelled() {
            return summary;
        }
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().await;
        jobs.prune_flags();

        for (job_id, job) in jobs.scheduled.iter_mut() {
            if job.next_fire > now {
                continue;
            }
            let coalesced = job.advance_past(now);
            self.counters.coalesced.fetch_add(coalesced, Ordering::Relaxed);

            if job.in_flight.load(Ordering::Acquire) {
                summary.skipped_in_flight += 1;
                tracing::debug!(job_id = %job_id, "Tick skipped, previous run still in flight");
                continue;
            }

            let permit = match self.pool.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    summary.rejected += 1;
                    tracing::warn!(job_id = %job_id, "Tick dropped, worker pool saturated");
                    continue;
                }
            };

            job.in_flight.store(true, Ordering::Release);
            summary.fired += 1;

            let handler = job.handler.clone();
            let guard = InFlightGuard {
                flag: job.in_flight.clone(),
                _permit: permit,
            };
            let job_id = job_id.clone();
            tokio::spawn(async move {
                let _guard = guard;
                handler.on_tick(&job_id, now).await;
            });
        }

        self.counters
            .fired
            .fetch_add(summary.fired as u64, Ordering::Relaxed);
        self.counters
            .skipped_in_flight
            .fetch_add(summary.skipped_in_flight as u64, Ordering::Relaxed);
        self.counters
            .rejected
            .fetch_add(summary.rejected as u64, Ordering::Relaxed);
        summary
    }

    /// Poll at the configured resolution until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.resolution);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            pool_size = self.config.pool_size,
            resolution_ms = self.config.resolution.as_millis() as u64,
            "Scheduler engine started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll().await;
                }
            }
        }
        tracing::info!("Scheduler engine stopped");
    }

    /// Wait until no callback is running.
    pub async fn wait_idle(&self) {
        let all = u32::try_from(self.config.pool_size).unwrap_or(u32::MAX);
        if let Ok(permits) = self.pool.acquire_many(all).await {
            drop(permits);
        }
    }

    /// Halt future ticks. Running callbacks are not interrupted.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            fired: self.counters.fired.load(Ordering::Relaxed),
            skipped_in_flight: self.counters.skipped_in_flight.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
        }
    }
}
