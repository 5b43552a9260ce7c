//! Timed queue and periodic-starter framework, plus the composition root
//! that wires the four starters to one [`Scheduler`] and [`HistoryStore`].

pub mod defrag;
pub mod move_starter;
pub mod recover;
pub mod ttl_cleanup;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::collaborators::{ClusterView, DistributedLock, Inventory, JobFinder, JobProcessor};
use crate::config::SchedulerConfig;
use crate::error::{CollaboratorError, StarterError};
use crate::history::HistoryStore;
use crate::scheduler::Scheduler;
use crate::snapshot::ClusterSnapshot;

type BoxedTask = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Entry {
	fire_at: Instant,
	task: Arc<BoxedTask>,
}

/// Named deferred closures keyed by string name; entries with the same name
/// replace one another. A single background executor drains due entries in
/// monotonic time order.
#[derive(Default)]
pub struct TimedQueue {
	entries: Mutex<BTreeMap<String, Entry>>,
}

impl TimedQueue {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Schedules `task` to fire after `delay`, replacing any entry already
	/// registered under `name`.
	pub async fn add_task_in(&self, name: &str, delay: Duration, task: BoxedTask) {
		self.entries.lock().await.insert(
			name.to_string(),
			Entry {
				fire_at: Instant::now() + delay,
				task: Arc::new(task),
			},
		);
	}

	/// Drains whatever entries are currently due, in monotonic firing order.
	/// Intended to be called from a single background loop.
	pub async fn drain_due(&self) -> Vec<(String, Arc<BoxedTask>)> {
		let now = Instant::now();
		let mut entries = self.entries.lock().await;
		let mut due: Vec<(String, Instant, Arc<BoxedTask>)> = entries
			.iter()
			.filter(|(_, e)| e.fire_at <= now)
			.map(|(name, e)| (name.clone(), e.fire_at, e.task.clone()))
			.collect();
		due.sort_by_key(|(_, fire_at, _)| *fire_at);
		for (name, _, _) in &due {
			entries.remove(name);
		}
		due.into_iter().map(|(name, _, task)| (name, task)).collect()
	}

	/// Runs the executor loop forever, polling for due entries. Meant to be
	/// spawned once per process.
	pub async fn run(self: Arc<Self>, poll_interval: Duration) {
		loop {
			let due = self.drain_due().await;
			for (name, task) in due {
				tracing::debug!(%name, "running due timed-queue entry");
				(task)().await;
			}
			tokio::time::sleep(poll_interval).await;
		}
	}
}

/// One entry in the starter registry: what's configured to run, under which
/// lock, regardless of whether it's currently enabled.
#[derive(Debug, Clone)]
pub struct StarterInfo {
	pub name: &'static str,
	pub lock_name: String,
	pub period: Duration,
	pub enabled: bool,
}

/// Registers a periodic task: config-gated, config-overridable period,
/// non-blocking distributed lock acquisition, catch-all error handling
/// that always re-schedules. Always records a [`StarterInfo`] entry in
/// `registry`, even when disabled, so the composition root can report what
/// it was configured to run.
#[allow(clippy::too_many_arguments)]
pub async fn register_periodic<F, Fut>(
	queue: Arc<TimedQueue>,
	lock: Arc<dyn DistributedLock>,
	registry: &RwLock<Vec<StarterInfo>>,
	name: &'static str,
	lock_name: String,
	enabled: bool,
	period: Duration,
	run: F,
) where
	F: Fn() -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<(), StarterError>> + Send + 'static,
{
	registry.write().await.push(StarterInfo {
		name,
		lock_name: lock_name.clone(),
		period,
		enabled,
	});

	if !enabled {
		tracing::info!(%name, "starter disabled, not scheduling");
		return;
	}

	let run = Arc::new(run);
	schedule_next(queue, lock, name, lock_name, period, run).await;
}

fn schedule_next<F, Fut>(
	queue: Arc<TimedQueue>,
	lock: Arc<dyn DistributedLock>,
	name: &'static str,
	lock_name: String,
	period: Duration,
	run: Arc<F>,
) -> Pin<Box<dyn Future<Output = ()> + Send>>
where
	F: Fn() -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<(), StarterError>> + Send + 'static,
{
	Box::pin(async move {
		let queue_inner = queue.clone();
		let lock_inner = lock.clone();
		let lock_name_inner = lock_name.clone();
		let run_inner = run.clone();

		let task: BoxedTask = Box::new(move || {
			let queue = queue_inner.clone();
			let lock = lock_inner.clone();
			let lock_name = lock_name_inner.clone();
			let run = run_inner.clone();
			Box::pin(async move {
				match lock.try_acquire(&lock_name).await {
					Ok(Some(guard)) => {
						if let Err(err) = (run)().await {
							tracing::warn!(starter = %name, ?err, "starter run failed");
						}
						guard.release().await;
					}
					Ok(None) => {
						tracing::info!(starter = %name, "lock held elsewhere, skipping this period");
					}
					Err(err) => {
						tracing::warn!(starter = %name, ?err, "failed to acquire distributed lock");
					}
				}
				schedule_next(queue, lock, name, lock_name, period, run).await;
			})
		});

		queue.add_task_in(name, period, task).await;
	})
}

/// Composition root: wires the scheduler, the historic-state store, and the
/// starter registry together.
pub struct SchedulerCore {
	pub scheduler: Arc<Scheduler>,
	pub history: Arc<dyn HistoryStore>,
	pub inventory: Arc<dyn Inventory>,
	pub cluster: Arc<dyn ClusterView>,
	/// The YT/YQL analytics cluster, out of scope to implement against a
	/// real cluster here. `None` disables the analytics-derived candidate
	/// stream and the aggregate-table-replace task; the idleness-derived
	/// stream still runs.
	pub analytics: Option<Arc<dyn crate::analytics::AnalyticsClient>>,
	pub config: SchedulerConfig,
	pub queue: Arc<TimedQueue>,
	pub lock: Arc<dyn DistributedLock>,
	pub starters: RwLock<Vec<StarterInfo>>,
}

impl SchedulerCore {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		finder: Arc<dyn JobFinder>,
		processor: Arc<dyn JobProcessor>,
		history: Arc<dyn HistoryStore>,
		inventory: Arc<dyn Inventory>,
		cluster: Arc<dyn ClusterView>,
		analytics: Option<Arc<dyn crate::analytics::AnalyticsClient>>,
		lock: Arc<dyn DistributedLock>,
		config: SchedulerConfig,
	) -> Self {
		Self {
			scheduler: Arc::new(Scheduler::new(finder, processor, &config)),
			history,
			inventory,
			cluster,
			analytics,
			config,
			queue: TimedQueue::new(),
			lock,
			starters: RwLock::new(Vec::new()),
		}
	}

	/// Takes a fresh, immutable view of global storage state.
	pub async fn snapshot(&self) -> Result<ClusterSnapshot, CollaboratorError> {
		self.cluster.snapshot().await
	}

	pub fn now(&self) -> i64 {
		chrono::Utc::now().timestamp()
	}

	/// What's registered to run, as of the last call to [`Self::start`].
	pub async fn starters_snapshot(&self) -> Vec<StarterInfo> {
		self.starters.read().await.clone()
	}

	/// Registers all four starters per their `scheduler.<name>.enabled` flags
	/// and starts the background executor. Returns a handle the caller can
	/// `.await` to keep the process alive.
	pub async fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		recover::register(&self).await;
		defrag::register(&self).await;
		move_starter::register(&self).await;
		ttl_cleanup::register(&self).await;

		let queue = self.queue.clone();
		tokio::spawn(queue.run(Duration::from_millis(500)))
	}
}
