use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{CoupleId, FsKey, GroupId, HostAddr};

pub type JobId = u64;

/// One parameter dictionary emitted by a starter. Kept as an opaque JSON
/// object since each job type defines its own shape; the scheduler never
/// inspects it beyond passing it to [`crate::collaborators::JobProcessor`].
pub type JobParams = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
	RecoverDc,
	CoupleDefrag,
	Move,
	TtlCleanup,
}

impl JobType {
	/// The job families a higher-priority candidate is allowed to preempt.
	pub fn is_stop_allowed(self) -> bool {
		matches!(
			self,
			JobType::RecoverDc | JobType::CoupleDefrag | JobType::TtlCleanup
		)
	}

	pub const ALL: [JobType; 4] = [
		JobType::RecoverDc,
		JobType::CoupleDefrag,
		JobType::Move,
		JobType::TtlCleanup,
	];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
	NotApproved,
	New,
	Executing,
	Pending,
	Broken,
	Completed,
	Cancelled,
}

impl JobStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, JobStatus::Completed | JobStatus::Cancelled)
	}
}

/// Statuses considered "live" for resource accounting purposes.
pub const ACTIVE_STATUSES: [JobStatus; 5] = [
	JobStatus::NotApproved,
	JobStatus::New,
	JobStatus::Executing,
	JobStatus::Pending,
	JobStatus::Broken,
];

/// The job's declared resources, grouped by resource type. `host_in`/
/// `host_out`/`cpu` carry host addresses; `fs` carries `(host, fsid)` pairs.
#[derive(Debug, Clone, Default)]
pub struct JobResources {
	pub host_in: Vec<HostAddr>,
	pub host_out: Vec<HostAddr>,
	pub cpu: Vec<HostAddr>,
	pub fs: Vec<FsKey>,
}

/// The unit admitted by the scheduler.
#[derive(Debug, Clone)]
pub struct Job {
	pub id: JobId,
	pub job_type: JobType,
	pub status: JobStatus,
	pub involved_groups: BTreeSet<GroupId>,
	pub resources: JobResources,
	pub priority: i32,
	/// The couple this job concerns, if any — used only for logging/history
	/// bookkeeping by starters, never by the scheduler itself.
	pub couple: Option<CoupleId>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case(JobType::RecoverDc, true)]
	#[case(JobType::CoupleDefrag, true)]
	#[case(JobType::TtlCleanup, true)]
	#[case(JobType::Move, false)]
	fn stop_allowed_matches_every_job_type(#[case] job_type: JobType, #[case] expected: bool) {
		assert_eq!(job_type.is_stop_allowed(), expected);
	}

	#[rstest]
	#[case(JobStatus::Completed, true)]
	#[case(JobStatus::Cancelled, true)]
	#[case(JobStatus::Executing, false)]
	#[case(JobStatus::New, false)]
	#[case(JobStatus::Pending, false)]
	#[case(JobStatus::Broken, false)]
	#[case(JobStatus::NotApproved, false)]
	fn terminal_matches_every_status(#[case] status: JobStatus, #[case] expected: bool) {
		assert_eq!(status.is_terminal(), expected);
	}
}
