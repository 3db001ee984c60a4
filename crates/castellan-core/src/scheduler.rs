//! Cron-driven background task scheduler. Two jobs run against it in this
//! workspace: `castellan_core::tasks::CrlRegenTask` (CRL regeneration
//! debounce, spec §4.7 `Revoke`) and `castellan_acme::nonce::NonceSweepTask`
//! (ACME nonce TTL sweeping, spec §4.5) — both `Task<App>` implementations
//! registered by `server::main` after `AppBuilder::build()`, the same shape
//! the teacher uses for its certificate-renewal cron task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use std::collections::HashMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use castellan_types::prelude::*;

/// Parsed 5-field cron expression (minute hour day-of-month month weekday),
/// kept alongside its source string so admin tooling can display it back.
#[derive(Debug, Clone)]
pub struct CronSchedule {
	expr: Box<str>,
	cron: Cron,
}

impl CronSchedule {
	pub fn parse(expr: &str) -> ClResult<Self> {
		let cron = Cron::from_str(expr)
			.map_err(|e| Error::Internal(format!("invalid cron expression {expr:?}: {e}")))?;
		Ok(Self { expr: expr.into(), cron })
	}

	pub fn next_execution(&self, after: Timestamp) -> ClResult<Timestamp> {
		let dt = DateTime::<Utc>::from_timestamp(after.0, 0).unwrap_or_else(Utc::now);
		self.cron
			.find_next_occurrence(&dt, false)
			.map(|next| Timestamp(next.timestamp()))
			.map_err(|e| Error::Internal(format!("cron {} has no next occurrence: {e}", self.expr)))
	}

	pub fn as_str(&self) -> &str {
		&self.expr
	}
}

/// A background job runnable against shared application state `S`. Errors
/// are logged by the scheduler loop and do not stop future runs — a failed
/// CRL regen retries on the next tick rather than wedging the process.
#[async_trait]
pub trait Task<S>: Send + Sync + Debug {
	fn name(&self) -> &'static str;
	async fn run(&self, state: &S) -> ClResult<()>;
}

#[derive(Debug)]
struct RegisteredTask<S> {
	task: Arc<dyn Task<S>>,
	schedule: CronSchedule,
	next_at: Timestamp,
}

/// Holds every registered cron job and drives them from a single background
/// loop started by `Scheduler::start`. One scheduler per `App`, matching
/// the teacher's one-scheduler-per-`App` wiring.
#[derive(Debug)]
pub struct Scheduler<S> {
	tasks: RwLock<HashMap<&'static str, RegisteredTask<S>>>,
	tick: Duration,
}

impl<S: Clone + Send + Sync + 'static> Scheduler<S> {
	pub fn new() -> Arc<Self> {
		Arc::new(Self { tasks: RwLock::new(HashMap::new()), tick: Duration::from_secs(1) })
	}

	#[cfg(test)]
	fn with_tick(tick: Duration) -> Arc<Self> {
		Arc::new(Self { tasks: RwLock::new(HashMap::new()), tick })
	}

	/// Registers `task` to run on `cron_expr`. Re-registering the same
	/// `Task::name()` replaces the prior schedule — used by tests that swap
	/// a task's cadence without rebuilding the whole scheduler.
	pub async fn register(&self, task: Arc<dyn Task<S>>, cron_expr: &str) -> ClResult<()> {
		let schedule = CronSchedule::parse(cron_expr)?;
		let next_at = schedule.next_execution(Timestamp::now())?;
		self.tasks.write().await.insert(task.name(), RegisteredTask { task, schedule, next_at });
		Ok(())
	}

	/// Runs every due task once, independent of the cron loop. Used by
	/// `/admin` debug tooling and tests to avoid waiting on a cron tick.
	pub async fn run_due(&self, state: &S) {
		let now = Timestamp::now();
		let mut tasks = self.tasks.write().await;
		for registered in tasks.values_mut() {
			if registered.next_at > now {
				continue;
			}
			if let Err(err) = registered.task.run(state).await {
				warn!(task = registered.task.name(), error = %err, "scheduled task failed");
			}
			match registered.schedule.next_execution(now) {
				Ok(next) => registered.next_at = next,
				Err(err) => {
					warn!(task = registered.task.name(), error = %err, "could not compute next run");
				}
			}
		}
	}

	/// Spawns the polling loop on the current tokio runtime. Fire-and-forget
	/// by design: the scheduler outlives no handle, it is dropped with the
	/// `App` it was built for.
	pub fn start(self: &Arc<Self>, state: S) {
		let scheduler = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				scheduler.run_due(&state).await;
				sleep(scheduler.tick).await;
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[derive(Debug)]
	struct CountingTask {
		name: &'static str,
		count: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl Task<()> for CountingTask {
		fn name(&self) -> &'static str {
			self.name
		}

		async fn run(&self, _state: &()) -> ClResult<()> {
			self.count.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	#[test]
	fn cron_schedule_rejects_malformed_expressions() {
		assert!(CronSchedule::parse("not a cron").is_err());
		assert!(CronSchedule::parse("*/5 * * * *").is_ok());
	}

	#[tokio::test]
	async fn run_due_skips_tasks_not_yet_scheduled() {
		let scheduler = Scheduler::<()>::with_tick(Duration::from_millis(10));
		let count = Arc::new(AtomicUsize::new(0));
		let task = Arc::new(CountingTask { name: "nonce-sweep", count: Arc::clone(&count) });

		// "0 0 1 1 *" next fires next Jan 1st — far enough out that run_due
		// should not execute it on this tick.
		scheduler.register(task, "0 0 1 1 *").await.unwrap();
		scheduler.run_due(&()).await;
		assert_eq!(count.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn run_due_executes_a_task_scheduled_in_the_past() {
		let scheduler = Scheduler::<()>::with_tick(Duration::from_millis(10));
		let count = Arc::new(AtomicUsize::new(0));
		let task: Arc<dyn Task<()>> =
			Arc::new(CountingTask { name: "crl-regen", count: Arc::clone(&count) });

		scheduler.register(task, "* * * * *").await.unwrap();
		{
			let mut tasks = scheduler.tasks.write().await;
			tasks.get_mut("crl-regen").unwrap().next_at = Timestamp(0);
		}
		scheduler.run_due(&()).await;
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}
}

// vim: ts=4
