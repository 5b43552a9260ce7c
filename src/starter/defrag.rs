//! Defragment starter: triggers a groupset-wide compaction when removed-file
//! size is recoverable.

use std::sync::Arc;
use std::time::Duration;

use crate::error::StarterError;
use crate::model::{Groupset, JobType};
use crate::scheduler::SchedParams;

use super::SchedulerCore;

const LOCK_NAME: &str = "scheduler/couple_defrag";
const TASK_NAME: &str = "couple_defrag";

pub async fn register(core: &Arc<SchedulerCore>) {
	let cfg = core.config.scheduler.couple_defrag.base.clone();
	let core = core.clone();
	let run_core = core.clone();
	super::register_periodic(
		core.queue.clone(),
		core.lock.clone(),
		&core.starters,
		TASK_NAME,
		LOCK_NAME.to_string(),
		cfg.enabled,
		Duration::from_secs(cfg.period_secs.unwrap_or(60 * 15)),
		move || {
			let core = run_core.clone();
			async move { run(&core).await }
		},
	)
	.await;
}

fn is_candidate(groupset: &Groupset, groups: &std::collections::BTreeMap<crate::model::GroupId, crate::model::Group>) -> bool {
	if !groupset.status.is_good() {
		return false;
	}
	if groupset.stats.files_removed_size == 0 {
		return false;
	}

	let mut any_want_defrag = false;
	for gid in &groupset.groups {
		let Some(group) = groups.get(gid) else { continue };
		if group.want_defrag {
			any_want_defrag = true;
		}
		if let Some(backend) = &group.node_backend {
			if let Some(stat) = &backend.stat {
				if stat.vfs_free_space < 2 * stat.max_blob_base_size {
					return false;
				}
			}
		}
	}
	any_want_defrag
}

#[tracing::instrument(skip_all)]
async fn run(core: &SchedulerCore) -> Result<(), StarterError> {
	let cfg = &core.config.scheduler.couple_defrag.base;
	let snapshot = core.snapshot().await?;

	let mut candidates: Vec<&Groupset> = snapshot
		.groupsets
		.values()
		.filter(|gs| is_candidate(gs, &snapshot.groups))
		.collect();
	// Ascending by files_removed_size so the list is popped from the tail
	// when submitting.
	candidates.sort_by_key(|gs| gs.stats.files_removed_size);

	let params: Vec<crate::model::JobParams> = candidates
		.into_iter()
		.rev()
		.map(|gs| {
			let mut map = serde_json::Map::new();
			map.insert("couple".to_string(), serde_json::json!(gs.id.clone()));
			map
		})
		.collect();

	let sched_params = SchedParams {
		max_executing_jobs: core.config.max_executing_jobs(JobType::CoupleDefrag),
		autoapprove: cfg.autoapprove,
		force: cfg.force,
	};

	let created = core
		.scheduler
		.create_jobs(JobType::CoupleDefrag, params, sched_params)
		.await?;
	tracing::info!(count = created.len(), "created couple defrag jobs");
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;
	use crate::model::{
		Group, GroupId, GroupType, GroupsetStats, GroupsetStatus, NodeBackend, NodeBackendStats,
	};

	fn backend(vfs_free_space: u64, max_blob_base_size: u64) -> NodeBackend {
		NodeBackend {
			host: "host-1".into(),
			port: 1025,
			family: 10,
			backend_id: 1,
			base_path: "/srv/1".to_string(),
			fsid: 1,
			stat: Some(NodeBackendStats {
				total_space: 0,
				used_space: 0,
				vfs_free_space,
				max_blob_base_size,
				files: 0,
				files_removed: 0,
				files_removed_size: 0,
			}),
		}
	}

	fn group(id: GroupId, want_defrag: bool, node_backend: Option<NodeBackend>) -> Group {
		Group {
			id,
			group_type: GroupType::Data,
			node_backend,
			groupset: None,
			want_defrag,
			keys_count: 0,
		}
	}

	fn groupset(status: GroupsetStatus, files_removed_size: u64, groups: Vec<GroupId>) -> Groupset {
		Groupset {
			id: "1:2".to_string(),
			status,
			namespace: "default".to_string(),
			groups,
			stats: GroupsetStats { files_removed_size },
		}
	}

	#[test]
	fn rejects_bad_status() {
		let groups = BTreeMap::new();
		let gs = groupset(GroupsetStatus::Bad, 1000, vec![]);
		assert!(!is_candidate(&gs, &groups));
	}

	#[test]
	fn rejects_nothing_to_reclaim() {
		let groups = BTreeMap::new();
		let gs = groupset(GroupsetStatus::Ok, 0, vec![]);
		assert!(!is_candidate(&gs, &groups));
	}

	#[test]
	fn rejects_when_no_group_wants_defrag() {
		let groups: BTreeMap<GroupId, Group> = [(1, group(1, false, Some(backend(1_000_000, 1_000))))]
			.into_iter()
			.collect();
		let gs = groupset(GroupsetStatus::Ok, 1000, vec![1]);
		assert!(!is_candidate(&gs, &groups));
	}

	#[test]
	fn rejects_when_free_space_too_low() {
		let groups: BTreeMap<GroupId, Group> = [(1, group(1, true, Some(backend(500, 1_000))))].into_iter().collect();
		let gs = groupset(GroupsetStatus::Ok, 1000, vec![1]);
		assert!(!is_candidate(&gs, &groups));
	}

	#[test]
	fn accepts_good_candidate() {
		let groups: BTreeMap<GroupId, Group> = [(1, group(1, true, Some(backend(10_000, 1_000))))].into_iter().collect();
		let gs = groupset(GroupsetStatus::Full, 1000, vec![1]);
		assert!(is_candidate(&gs, &groups));
	}
}
