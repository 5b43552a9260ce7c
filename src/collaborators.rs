//! Traits for the systems this core deliberately does not implement: the job
//! execution engine, the elliptics/MongoDB clients, the inventory tree, the
//! YT/YQL analytics client, and the distributed lock service. The core only
//! depends on these narrow contracts.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CollaboratorError, JobCreateError};
use crate::model::{Job, JobId, JobParams, JobResources, JobStatus, JobType, GroupId};

/// Filter accepted by [`JobFinder::jobs`]; all fields are conjunctive and
/// optional.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
	pub statuses: Option<Vec<JobStatus>>,
	pub types: Option<Vec<JobType>>,
	pub groups: Option<Vec<GroupId>>,
	pub ids: Option<Vec<JobId>>,
}

impl JobFilter {
	pub fn by_statuses(statuses: impl Into<Vec<JobStatus>>) -> Self {
		Self {
			statuses: Some(statuses.into()),
			..Default::default()
		}
	}

	pub fn by_ids(ids: impl Into<Vec<JobId>>) -> Self {
		Self {
			ids: Some(ids.into()),
			..Default::default()
		}
	}
}

/// Read-only view over the job store.
#[async_trait]
pub trait JobFinder: Send + Sync {
	async fn jobs(&self, filter: JobFilter) -> Result<Vec<Job>, CollaboratorError>;

	async fn jobs_count(&self, types: &[JobType], statuses: &[JobStatus]) -> Result<usize, CollaboratorError>;
}

/// The resources a job of a given type would hold, computed statically from
/// its parameters without instantiating or locking anything.
#[derive(Debug, Clone, Default)]
pub struct ReportedResources {
	pub groups: Vec<GroupId>,
	pub resources: JobResources,
}

/// A registry of per-job-type resource reporters: an explicit table of
/// function values instead of a string-keyed dynamic dispatch.
pub type ResourceReporter = Arc<dyn Fn(&JobParams) -> ReportedResources + Send + Sync>;

/// Mutating operations on the job store: create, cancel, and priority lookup.
/// This is consumed, never defined, by the scheduler.
#[async_trait]
pub trait JobProcessor: Send + Sync {
	fn job_priority(&self, job_type: JobType) -> i32;

	/// `report_resources(params)` for `job_type`. Returns `None` if the job
	/// type has no registered reporter.
	fn report_resources(&self, job_type: JobType, params: &JobParams) -> Option<ReportedResources>;

	async fn create_job(
		&self,
		job_type: JobType,
		params: JobParams,
		force: bool,
	) -> Result<Job, JobCreateError>;

	async fn stop_jobs(&self, jobs: &[Job]) -> Result<(), CollaboratorError>;
}

/// A non-blocking, named, cluster-wide mutual-exclusion lock. Acquisition
/// failure is benign: it means another host currently owns the starter's
/// slot.
#[async_trait]
pub trait DistributedLock: Send + Sync {
	/// Attempts to acquire `name` without blocking. Returns `None` if the
	/// lock is already held elsewhere.
	async fn try_acquire(&self, name: &str) -> Result<Option<Box<dyn LockGuard>>, CollaboratorError>;
}

/// Held while a starter run is in flight; dropping it releases the lock.
#[async_trait]
pub trait LockGuard: Send {
	async fn release(self: Box<Self>);
}

/// Datacenter resolution for hosts. Returning `None` models an upstream
/// cache miss — callers must silently skip the host rather than error.
pub trait Inventory: Send + Sync {
	fn datacenter(&self, host: &crate::model::HostAddr) -> Option<String>;
}

/// Source of global storage state, backed by the elliptics/MongoDB clients;
/// starters only ever see the immutable arena this produces, never a
/// mutable global.
#[async_trait]
pub trait ClusterView: Send + Sync {
	async fn snapshot(&self) -> Result<crate::snapshot::ClusterSnapshot, CollaboratorError>;
}
