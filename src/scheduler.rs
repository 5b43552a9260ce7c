//! Admission, resource accounting, and preemption.
//!
//! The scheduler owns one authoritative piece of mutable state, `res`, which
//! is rebuilt from the job store at the start of every [`Scheduler::create_jobs`]
//! call and treated as advisory in between. It is stored in a
//! [`papaya::HashMap`] so that concurrently-running starters never block each
//! other on a single lock while they update it.

use std::collections::BTreeSet;
use std::sync::Arc;

use papaya::HashMap as ConcurrentMap;

use crate::collaborators::{JobFilter, JobFinder, JobProcessor};
use crate::config::SchedulerConfig;
use crate::error::ScheduleError;
use crate::model::{GroupId, Job, JobId, JobParams, JobResources, JobType, ACTIVE_STATUSES};
use crate::resource::{charge_for_limit, Percent, ResourceDemand, ResourceKey, ResourceType, CAPACITY};

/// Per-starter knobs the scheduler needs for one admission call.
#[derive(Debug, Clone, Copy)]
pub struct SchedParams {
	pub max_executing_jobs: u32,
	pub autoapprove: bool,
	pub force: bool,
}

/// A row in `res`: one job's charge against a resource key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResourceHolder {
	job_id: JobId,
	percent: Percent,
}

pub struct Scheduler {
	finder: Arc<dyn JobFinder>,
	processor: Arc<dyn JobProcessor>,
	res: ConcurrentMap<ResourceKey, Vec<ResourceHolder>>,
	job_count: ConcurrentMap<JobType, u32>,
	res_limits: std::collections::BTreeMap<(JobType, ResourceType), u32>,
}

impl Scheduler {
	pub fn new(finder: Arc<dyn JobFinder>, processor: Arc<dyn JobProcessor>, config: &SchedulerConfig) -> Self {
		Self {
			finder,
			processor,
			res: ConcurrentMap::new(),
			job_count: ConcurrentMap::new(),
			res_limits: config.resource_limits(),
		}
	}

	fn limit(&self, job_type: JobType, resource_type: ResourceType) -> u32 {
		self.res_limits.get(&(job_type, resource_type)).copied().unwrap_or(1)
	}

	/// Rebuilds `res` and `job_count` from every active job in the store.
	#[tracing::instrument(skip_all)]
	pub async fn update_resource_stat(&self) -> Result<(), ScheduleError> {
		let jobs = self
			.finder
			.jobs(JobFilter::by_statuses(ACTIVE_STATUSES.to_vec()))
			.await?;

		let res = self.res.pin();
		res.clear();
		let job_count = self.job_count.pin();
		job_count.clear();

		for job in &jobs {
			let count = job_count.get(&job.job_type).copied().unwrap_or(0);
			job_count.insert(job.job_type, count + 1);

			for (key, percent) in self.demand_rows(job.job_type, &job.resources, &job.involved_groups) {
				let mut row = res.get(&key).cloned().unwrap_or_default();
				row.push(ResourceHolder { job_id: job.id, percent });
				res.insert(key, row);
			}
		}
		Ok(())
	}

	/// Computes `(key, percent)` rows a job's declared resources and involved
	/// groups translate to, charging `GROUP`/`FS` at 100 and host resources at
	/// `100/max(limit,1)`.
	fn demand_rows(
		&self,
		job_type: JobType,
		resources: &JobResources,
		involved_groups: &BTreeSet<GroupId>,
	) -> Vec<(ResourceKey, Percent)> {
		let mut rows = Vec::new();
		for gid in involved_groups {
			rows.push((ResourceKey::Group(*gid), CAPACITY));
		}
		for fs in &resources.fs {
			rows.push((ResourceKey::Fs(fs.clone()), CAPACITY));
		}
		for host in &resources.host_in {
			rows.push((
				ResourceKey::HostIn(host.clone()),
				charge_for_limit(self.limit(job_type, ResourceType::HostIn)),
			));
		}
		for host in &resources.host_out {
			rows.push((
				ResourceKey::HostOut(host.clone()),
				charge_for_limit(self.limit(job_type, ResourceType::HostOut)),
			));
		}
		for host in &resources.cpu {
			rows.push((
				ResourceKey::Cpu(host.clone()),
				charge_for_limit(self.limit(job_type, ResourceType::Cpu)),
			));
		}
		rows
	}

	/// Exported standalone so starters can compute demand *before* creating
	/// jobs.
	pub fn convert_resource_representation(
		&self,
		job_type: JobType,
		resources: &JobResources,
		involved_groups: &BTreeSet<GroupId>,
	) -> ResourceDemand {
		self.demand_rows(job_type, resources, involved_groups).into_iter().collect()
	}

	/// All hosts that would exceed 100% on any resource type carried in
	/// `demand` if it were admitted. `demand` maps resource *type* (not a
	/// specific key) to the percent a new job of that type would consume on
	/// any host it touches.
	pub fn get_busy_hosts(
		&self,
		demand: &std::collections::BTreeMap<ResourceType, Percent>,
	) -> Vec<crate::model::HostAddr> {
		let res = self.res.pin();
		let mut busy = BTreeSet::new();
		for (key, rows) in res.iter() {
			let Some(host) = key.host() else { continue };
			if busy.contains(host) {
				continue;
			}
			let Some(&want) = demand.get(&key.resource_type()) else { continue };
			let used: u32 = rows.iter().map(|h| h.percent as u32).sum();
			if used + want as u32 > CAPACITY as u32 {
				busy.insert(host.clone());
			}
		}
		busy.into_iter().collect()
	}

	/// All group ids currently present in `res`.
	pub fn get_busy_group_ids(&self) -> Vec<GroupId> {
		let res = self.res.pin();
		res.keys()
			.filter_map(|key| match key {
				ResourceKey::Group(gid) => Some(*gid),
				_ => None,
			})
			.collect()
	}

	/// Attempts to free up `demand` by cancelling lower-priority crossing
	/// jobs. Returns `true` if the candidate can now be admitted.
	#[tracing::instrument(skip(self, demand))]
	pub async fn cancel_crossing_jobs(
		&self,
		job_type: JobType,
		sched_params: SchedParams,
		demand: &ResourceDemand,
	) -> Result<bool, ScheduleError> {
		let crossing_ids: BTreeSet<JobId> = {
			let res = self.res.pin();
			let mut ids = BTreeSet::new();
			for key in demand.keys() {
				if let Some(rows) = res.get(key) {
					ids.extend(rows.iter().map(|h| h.job_id));
				}
			}
			ids
		};
		if crossing_ids.is_empty() {
			return Ok(true);
		}

		let jobs = self
			.finder
			.jobs(JobFilter::by_ids(crossing_ids.into_iter().collect::<Vec<_>>()))
			.await?;

		let candidate_priority = self.processor.job_priority(job_type);
		let mut terminal: Vec<JobId> = Vec::new();
		let mut cancellable: Vec<Job> = Vec::new();
		let mut non_cancellable_ids: BTreeSet<JobId> = BTreeSet::new();

		for job in jobs {
			if job.status.is_terminal() {
				terminal.push(job.id);
			} else if self.processor.job_priority(job.job_type) >= candidate_priority && !sched_params.force {
				non_cancellable_ids.insert(job.id);
			} else if job.job_type.is_stop_allowed() {
				cancellable.push(job);
			} else {
				non_cancellable_ids.insert(job.id);
			}
		}

		let res = self.res.pin_owned();
		for job_id in &terminal {
			for key in demand.keys() {
				if let Some(rows) = res.get(key) {
					let filtered: Vec<ResourceHolder> = rows.iter().copied().filter(|h| h.job_id != *job_id).collect();
					res.insert(key.clone(), filtered);
				}
			}
		}

		for (key, &want) in demand {
			let consumption_if_cancel: u32 = res
				.get(key)
				.map(|rows| {
					rows.iter()
						.filter(|h| non_cancellable_ids.contains(&h.job_id))
						.map(|h| h.percent as u32)
						.sum()
				})
				.unwrap_or(0);
			if want as u32 + consumption_if_cancel > CAPACITY as u32 {
				return Ok(false);
			}
		}
		drop(res);

		if cancellable.is_empty() {
			return Ok(true);
		}

		match self.processor.stop_jobs(&cancellable).await {
			Ok(()) => Ok(true),
			Err(err) => {
				tracing::warn!(?err, "failed to stop crossing jobs");
				Ok(false)
			}
		}
	}

	/// Admits candidates in the order supplied, up to `max_executing_jobs`.
	#[tracing::instrument(skip(self, param_list))]
	pub async fn create_jobs(
		&self,
		job_type: JobType,
		param_list: Vec<JobParams>,
		sched_params: SchedParams,
	) -> Result<Vec<Job>, ScheduleError> {
		self.update_resource_stat().await?;

		let current = self.job_count.pin().get(&job_type).copied().unwrap_or(0);
		let mut max_jobs = sched_params.max_executing_jobs.saturating_sub(current);
		if max_jobs == 0 {
			return Ok(Vec::new());
		}

		let mut created = Vec::new();
		for mut params in param_list {
			if max_jobs == 0 {
				break;
			}

			let Some(reported) = self.processor.report_resources(job_type, &params) else {
				tracing::warn!(?job_type, "no registered resource reporter, skipping candidate");
				continue;
			};
			let involved_groups: BTreeSet<GroupId> = reported.groups.iter().copied().collect();
			let demand = self.convert_resource_representation(job_type, &reported.resources, &involved_groups);

			match self.cancel_crossing_jobs(job_type, sched_params, &demand).await {
				Ok(true) => {}
				Ok(false) => continue,
				Err(err) => {
					tracing::warn!(?err, "cancel_crossing_jobs failed, skipping candidate");
					continue;
				}
			}

			params.insert("need_approving".to_string(), serde_json::json!(!sched_params.autoapprove));

			match self.processor.create_job(job_type, params, false).await {
				Ok(job) => {
					max_jobs -= 1;
					let res = self.res.pin();
					for (key, percent) in &demand {
						let mut row = res.get(key).cloned().unwrap_or_default();
						row.push(ResourceHolder { job_id: job.id, percent: *percent });
						res.insert(key.clone(), row);
					}
					created.push(job);
				}
				Err(crate::error::JobCreateError::LockAlreadyAcquired { holder, .. }) => {
					tracing::info!(?holder, "job creation conflicted with an existing lock holder");
					self.update_resource_stat().await?;
				}
				Err(err) => {
					tracing::warn!(?err, "job creation failed, skipping candidate");
				}
			}
		}

		Ok(created)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU64, Ordering};
	use std::sync::Mutex as StdMutex;

	use async_trait::async_trait;

	use super::*;
	use crate::collaborators::ReportedResources;
	use crate::error::{CollaboratorError, JobCreateError};
	use crate::model::JobStatus;

	struct FakeFinder {
		jobs: StdMutex<Vec<Job>>,
	}

	#[async_trait]
	impl JobFinder for FakeFinder {
		async fn jobs(&self, filter: JobFilter) -> Result<Vec<Job>, CollaboratorError> {
			let jobs = self.jobs.lock().unwrap();
			Ok(jobs
				.iter()
				.filter(|j| filter.statuses.as_ref().map(|s| s.contains(&j.status)).unwrap_or(true))
				.filter(|j| filter.ids.as_ref().map(|ids| ids.contains(&j.id)).unwrap_or(true))
				.cloned()
				.collect())
		}

		async fn jobs_count(&self, types: &[JobType], statuses: &[JobStatus]) -> Result<usize, CollaboratorError> {
			let jobs = self.jobs.lock().unwrap();
			Ok(jobs
				.iter()
				.filter(|j| types.contains(&j.job_type) && statuses.contains(&j.status))
				.count())
		}
	}

	struct FakeProcessor {
		priorities: std::collections::BTreeMap<JobType, i32>,
		next_id: AtomicU64,
		created: StdMutex<Vec<Job>>,
		stopped: StdMutex<Vec<JobId>>,
		reporter: fn(JobType, &JobParams) -> ReportedResources,
	}

	#[async_trait]
	impl JobProcessor for FakeProcessor {
		fn job_priority(&self, job_type: JobType) -> i32 {
			*self.priorities.get(&job_type).unwrap_or(&0)
		}

		fn report_resources(&self, job_type: JobType, params: &JobParams) -> Option<ReportedResources> {
			Some((self.reporter)(job_type, params))
		}

		async fn create_job(&self, job_type: JobType, params: JobParams, _force: bool) -> Result<Job, JobCreateError> {
			let id = self.next_id.fetch_add(1, Ordering::SeqCst);
			let group = params.get("group").and_then(|v| v.as_u64());
			let job = Job {
				id,
				job_type,
				status: JobStatus::New,
				involved_groups: group.into_iter().collect(),
				resources: JobResources::default(),
				priority: self.job_priority(job_type),
				couple: None,
			};
			self.created.lock().unwrap().push(job.clone());
			Ok(job)
		}

		async fn stop_jobs(&self, jobs: &[Job]) -> Result<(), CollaboratorError> {
			self.stopped.lock().unwrap().extend(jobs.iter().map(|j| j.id));
			Ok(())
		}
	}

	fn no_resources(_job_type: JobType, _params: &JobParams) -> ReportedResources {
		ReportedResources::default()
	}

	fn group_resources(_job_type: JobType, params: &JobParams) -> ReportedResources {
		ReportedResources {
			groups: params
				.get("group")
				.and_then(|v| v.as_u64())
				.into_iter()
				.collect(),
			resources: JobResources::default(),
		}
	}

	fn bare_params(group: Option<u64>) -> JobParams {
		let mut m = serde_json::Map::new();
		if let Some(g) = group {
			m.insert("group".to_string(), serde_json::json!(g));
		}
		m
	}

	fn sched_params(max: u32) -> SchedParams {
		SchedParams {
			max_executing_jobs: max,
			autoapprove: true,
			force: false,
		}
	}

	#[tokio::test]
	async fn create_jobs_caps_at_max_executing() {
		let finder = Arc::new(FakeFinder { jobs: StdMutex::new(Vec::new()) });
		let processor = Arc::new(FakeProcessor {
			priorities: Default::default(),
			next_id: AtomicU64::new(1),
			created: StdMutex::new(Vec::new()),
			stopped: StdMutex::new(Vec::new()),
			reporter: no_resources,
		});
		let scheduler = Scheduler::new(finder, processor, &crate::config::SchedulerConfig::default());

		let params = vec![bare_params(None), bare_params(None), bare_params(None)];
		let created = scheduler
			.create_jobs(JobType::RecoverDc, params, sched_params(2))
			.await
			.unwrap();

		assert_eq!(created.len(), 2);
	}

	// Higher-priority candidate preempts a stop-allowed holder.
	#[tokio::test]
	async fn create_jobs_preempts_lower_priority_holder() {
		let holder = Job {
			id: 1,
			job_type: JobType::RecoverDc,
			status: JobStatus::Pending,
			involved_groups: [42].into_iter().collect(),
			resources: JobResources::default(),
			priority: 1,
			couple: None,
		};
		let finder = Arc::new(FakeFinder { jobs: StdMutex::new(vec![holder]) });
		let mut priorities = std::collections::BTreeMap::new();
		priorities.insert(JobType::RecoverDc, 1);
		priorities.insert(JobType::Move, 5);
		let processor = Arc::new(FakeProcessor {
			priorities,
			next_id: AtomicU64::new(2),
			created: StdMutex::new(Vec::new()),
			stopped: StdMutex::new(Vec::new()),
			reporter: group_resources,
		});
		let scheduler = Scheduler::new(finder, processor.clone(), &crate::config::SchedulerConfig::default());

		let created = scheduler
			.create_jobs(JobType::Move, vec![bare_params(Some(42))], sched_params(10))
			.await
			.unwrap();

		assert_eq!(created.len(), 1);
		assert_eq!(*processor.stopped.lock().unwrap(), vec![1]);
	}

	// Equal-or-higher priority holder is never preempted: the `>=` comparison
	// means equal priority never preempts.
	#[tokio::test]
	async fn create_jobs_does_not_preempt_equal_or_higher_priority() {
		let holder = Job {
			id: 1,
			job_type: JobType::Move,
			status: JobStatus::Pending,
			involved_groups: [42].into_iter().collect(),
			resources: JobResources::default(),
			priority: 5,
			couple: None,
		};
		let finder = Arc::new(FakeFinder { jobs: StdMutex::new(vec![holder]) });
		let mut priorities = std::collections::BTreeMap::new();
		priorities.insert(JobType::RecoverDc, 1);
		priorities.insert(JobType::Move, 5);
		let processor = Arc::new(FakeProcessor {
			priorities,
			next_id: AtomicU64::new(2),
			created: StdMutex::new(Vec::new()),
			stopped: StdMutex::new(Vec::new()),
			reporter: group_resources,
		});
		let scheduler = Scheduler::new(finder, processor.clone(), &crate::config::SchedulerConfig::default());

		let created = scheduler
			.create_jobs(JobType::RecoverDc, vec![bare_params(Some(42))], sched_params(10))
			.await
			.unwrap();

		assert!(created.is_empty());
		assert!(processor.stopped.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn zero_max_executing_jobs_returns_empty_without_touching_processor() {
		let finder = Arc::new(FakeFinder { jobs: StdMutex::new(Vec::new()) });
		let processor = Arc::new(FakeProcessor {
			priorities: Default::default(),
			next_id: AtomicU64::new(1),
			created: StdMutex::new(Vec::new()),
			stopped: StdMutex::new(Vec::new()),
			reporter: no_resources,
		});
		let scheduler = Scheduler::new(finder, processor.clone(), &crate::config::SchedulerConfig::default());

		let created = scheduler
			.create_jobs(JobType::RecoverDc, vec![bare_params(None)], sched_params(0))
			.await
			.unwrap();

		assert!(created.is_empty());
		assert!(processor.created.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn fs_and_group_keys_never_hold_more_than_one_holder_after_create() {
		let finder = Arc::new(FakeFinder { jobs: StdMutex::new(Vec::new()) });
		let processor = Arc::new(FakeProcessor {
			priorities: Default::default(),
			next_id: AtomicU64::new(1),
			created: StdMutex::new(Vec::new()),
			stopped: StdMutex::new(Vec::new()),
			reporter: group_resources,
		});
		let scheduler = Scheduler::new(finder, processor, &crate::config::SchedulerConfig::default());

		scheduler
			.create_jobs(JobType::RecoverDc, vec![bare_params(Some(7))], sched_params(10))
			.await
			.unwrap();

		let busy = scheduler.get_busy_group_ids();
		assert_eq!(busy, vec![7]);
	}
}
