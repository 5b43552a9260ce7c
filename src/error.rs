//! Error taxonomy for the scheduling core.
//!
//! Four buckets: transient (retry next period), contract violation (abort the
//! current task, the periodic loop re-schedules), precondition (skip the
//! candidate, keep going), and cross-job conflict (log the holder, refresh
//! resource state, keep going). Starters never let any of these escape the
//! periodic loop — see [`crate::starter::TimedQueue`].

use crate::model::JobId;

/// Failure talking to an external collaborator (job finder/processor,
/// inventory, distributed lock, analytics cluster, historic-state store).
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
	#[error("job processor rejected the request: {0}")]
	JobProcessor(String),
	#[error("job finder query failed: {0}")]
	JobFinder(String),
	#[error("analytics query failed: {0}")]
	Analytics(String),
	#[error("historic-state store failed: {0}")]
	History(#[from] HistoryError),
	#[error("distributed lock backend failed: {0}")]
	Lock(String),
}

/// Raised by [`crate::collaborators::JobProcessor::create_job`] on a
/// per-group/per-fs lock conflict with an already-executing job.
#[derive(Debug, thiserror::Error)]
pub enum JobCreateError {
	#[error("job {candidate_type:?} creation conflicts with job {holder:?}")]
	LockAlreadyAcquired {
		candidate_type: crate::model::JobType,
		holder: Option<JobId>,
	},
	#[error(transparent)]
	Other(#[from] CollaboratorError),
}

/// Contract violations from the historic-state store.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
	#[error("bulk insert reported {reported} inserted, expected {expected}")]
	BulkInsertCountMismatch { expected: usize, reported: usize },
	#[error("bulk remove reported {reported} removed, expected {expected}")]
	BulkRemoveCountMismatch { expected: usize, reported: usize },
	#[error("upsert of couple {couple} returned ok={ok}, expected 1")]
	UpsertNotAcknowledged { couple: String, ok: i64 },
	#[error("backing store transport error: {0}")]
	Transport(String),
}

/// Errors the scheduler itself can surface. All of these are precondition or
/// contract-violation failures; transient failures are swallowed by the
/// caller (a starter) and logged instead of propagated.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
	#[error(transparent)]
	Collaborator(#[from] CollaboratorError),
	#[error("job type {0:?} has no registered resource reporter")]
	MissingResourceReporter(crate::model::JobType),
}

/// Errors a starter run can raise before the enclosing periodic loop catches
/// and logs them; every periodic entry-point is wrapped in a catch-all that
/// logs and re-schedules rather than propagating.
#[derive(Debug, thiserror::Error)]
pub enum StarterError {
	#[error(transparent)]
	Schedule(#[from] ScheduleError),
	#[error(transparent)]
	Collaborator(#[from] CollaboratorError),
	#[error(transparent)]
	History(#[from] HistoryError),
	#[error("configuration error: {0}")]
	Config(String),
}

/// Configuration loading/validation failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to build configuration: {0}")]
	Build(#[from] config::ConfigError),
}
