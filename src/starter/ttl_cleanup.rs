//! TTL-cleanup starter: unions an idleness-derived candidate stream with an
//! analytics-derived one, plus a longer-period task that rewrites the
//! analytics aggregate table under the same lock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::analytics::{ensure_yesterday_partition, AnalyticsClient};
use crate::error::StarterError;
use crate::model::{GroupId, JobType};
use crate::scheduler::SchedParams;

use super::SchedulerCore;

const LOCK_NAME: &str = "scheduler/ttl_cleanup";
const TASK_NAME: &str = "ttl_cleanup";
const REPLACE_TASK_NAME: &str = "ttl_cleanup_aggregate_replace";

const SECONDS_PER_DAY: i64 = 60 * 60 * 24;

pub async fn register(core: &Arc<SchedulerCore>) {
	let cfg = core.config.scheduler.ttl_cleanup.clone();
	{
		let core = core.clone();
		super::register_periodic(
			core.queue.clone(),
			core.lock.clone(),
			&core.starters,
			TASK_NAME,
			LOCK_NAME.to_string(),
			cfg.base.enabled,
			Duration::from_secs(cfg.base.period_secs.unwrap_or(60 * 15)),
			move || {
				let core = core.clone();
				async move { run(&core, None).await }
			},
		)
		.await;
	}

	// Shares the ttl_cleanup lock so it never races the candidate run.
	if cfg.base.enabled {
		let core = core.clone();
		super::register_periodic(
			core.queue.clone(),
			core.lock.clone(),
			&core.starters,
			REPLACE_TASK_NAME,
			LOCK_NAME.to_string(),
			true,
			Duration::from_secs(cfg.replace_period_secs),
			move || {
				let core = core.clone();
				async move { replace_aggregate_table(&core).await }
			},
		)
		.await;
	}
}

#[tracing::instrument(skip_all)]
async fn run(core: &SchedulerCore, analytics_override: Option<Arc<dyn AnalyticsClient>>) -> Result<(), StarterError> {
	let cfg = &core.config.scheduler.ttl_cleanup;
	let now = core.now();

	let snapshot = core.snapshot().await?;
	let live_couples = snapshot.groupsets.keys().cloned().collect();
	let history = core.history.get_history(&live_couples, now).await?;

	let max_idle_days = core.config.jobs.ttl_cleanup_job.max_idle_days as i64;
	let idleness_threshold = now - max_idle_days * SECONDS_PER_DAY;

	let mut idle_groups: BTreeSet<GroupId> = BTreeSet::new();
	for (couple_id, record) in &history {
		if record.ttl_cleanup_ts > idleness_threshold {
			continue;
		}
		if let Some(first) = couple_id.split(':').next().and_then(|s| s.parse::<GroupId>().ok()) {
			idle_groups.insert(first);
		}
	}

	let analytics = analytics_override.or_else(|| core.analytics.clone());
	let mut analytics_groups: BTreeSet<GroupId> = BTreeSet::new();
	if let Some(client) = &analytics {
		let yesterday = chrono::Utc::now()
			.checked_sub_signed(chrono::Duration::days(1))
			.unwrap_or_else(chrono::Utc::now)
			.format("%Y-%m-%d")
			.to_string();
		if let Err(err) =
			ensure_yesterday_partition(client.as_ref(), &cfg.tskv_log_table, &cfg.aggregation_table, &yesterday).await
		{
			tracing::warn!(?err, "failed to ensure yesterday's aggregate partition");
		}
		match client.expired_couples(&cfg.aggregation_table, cfg.ttl_threshold).await {
			Ok(couples) => {
				for couple_id in couples {
					if let Some(first) = couple_id.split(':').next().and_then(|s| s.parse::<GroupId>().ok()) {
						analytics_groups.insert(first);
					}
				}
			}
			Err(err) => tracing::warn!(?err, "analytics expired-couple query failed"),
		}
	}

	let candidate_groups = union_candidates(&idle_groups, &analytics_groups);
	let params = build_params(&candidate_groups, &snapshot);

	let sched_params = SchedParams {
		max_executing_jobs: core.config.max_executing_jobs(JobType::TtlCleanup),
		autoapprove: cfg.base.autoapprove,
		force: cfg.base.force,
	};
	let created = core
		.scheduler
		.create_jobs(JobType::TtlCleanup, params, sched_params)
		.await?;
	tracing::info!(count = created.len(), "created ttl cleanup jobs");
	Ok(())
}

/// Merges the idleness-derived and analytics-derived candidate streams,
/// deduplicating groups that appear in both.
fn union_candidates(idle_groups: &BTreeSet<GroupId>, analytics_groups: &BTreeSet<GroupId>) -> BTreeSet<GroupId> {
	idle_groups.union(analytics_groups).copied().collect()
}

/// Resolves each candidate group to its groupset and emits one job-parameter
/// dictionary per resolvable group, skipping groups missing from the
/// snapshot or without a groupset.
fn build_params(candidate_groups: &BTreeSet<GroupId>, snapshot: &crate::snapshot::ClusterSnapshot) -> Vec<crate::model::JobParams> {
	let mut params = Vec::new();
	for &iter_group in candidate_groups {
		let Some(group) = snapshot.groups.get(&iter_group) else {
			tracing::warn!(group = iter_group, "ttl-cleanup candidate group not found in snapshot");
			continue;
		};
		let Some(couple_id) = &group.groupset else {
			tracing::warn!(group = iter_group, "ttl-cleanup candidate group has no groupset");
			continue;
		};
		let Some(couple) = snapshot.groupsets.get(couple_id) else { continue };

		let mut entry = serde_json::Map::new();
		entry.insert("iter_group".to_string(), serde_json::json!(iter_group));
		entry.insert("couple".to_string(), serde_json::json!(couple.id));
		entry.insert("namespace".to_string(), serde_json::json!(couple.namespace));
		entry.insert("batch_size".to_string(), serde_json::Value::Null);
		entry.insert("attempts".to_string(), serde_json::Value::Null);
		entry.insert("nproc".to_string(), serde_json::Value::Null);
		entry.insert("wait_timeout".to_string(), serde_json::Value::Null);
		entry.insert("dry_run".to_string(), serde_json::json!(false));
		params.push(entry);
	}
	params
}

#[tracing::instrument(skip_all)]
async fn replace_aggregate_table(core: &SchedulerCore) -> Result<(), StarterError> {
	let Some(client) = core.analytics.clone() else {
		return Ok(());
	};
	let cfg = &core.config.scheduler.ttl_cleanup;
	let now = core.now();
	let live_couples = core.snapshot().await?.groupsets.keys().cloned().collect();
	let history = core.history.get_history(&live_couples, now).await?;

	let cutoffs = history.into_iter().map(|(couple, record)| (couple, record.ttl_cleanup_ts)).collect();
	client
		.replace_aggregate_table(&cfg.aggregation_table, &cutoffs)
		.await
		.map_err(|err| StarterError::Config(err.to_string()))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{Group, GroupType, Groupset, GroupsetStats, GroupsetStatus};
	use crate::snapshot::ClusterSnapshot;

	fn group(id: GroupId, couple: &str) -> Group {
		Group {
			id,
			group_type: GroupType::Data,
			node_backend: None,
			groupset: Some(couple.to_string()),
			want_defrag: false,
			keys_count: 0,
		}
	}

	fn couple(id: &str, groups: Vec<GroupId>) -> Groupset {
		Groupset {
			id: id.to_string(),
			status: GroupsetStatus::Ok,
			namespace: "default".to_string(),
			groups,
			stats: GroupsetStats { files_removed_size: 0 },
		}
	}

	#[test]
	fn union_dedups_groups_present_in_both_streams() {
		let idle: BTreeSet<GroupId> = [101, 202].into_iter().collect();
		let analytics: BTreeSet<GroupId> = [101].into_iter().collect();

		let merged = union_candidates(&idle, &analytics);
		assert_eq!(merged, [101, 202].into_iter().collect());
	}

	#[test]
	fn build_params_emits_one_entry_per_resolvable_group() {
		let mut snapshot = ClusterSnapshot::new();
		snapshot.groups.extend([(101, group(101, "101:102")), (202, group(202, "202:203"))]);
		snapshot
			.groupsets
			.insert("101:102".to_string(), couple("101:102", vec![101, 102]));
		snapshot
			.groupsets
			.insert("202:203".to_string(), couple("202:203", vec![202, 203]));

		let candidates: BTreeSet<GroupId> = [101, 202].into_iter().collect();
		let params = build_params(&candidates, &snapshot);

		assert_eq!(params.len(), 2);
		let groups: BTreeSet<u64> = params
			.iter()
			.map(|p| p["iter_group"].as_u64().unwrap())
			.collect();
		assert_eq!(groups, [101, 202].into_iter().collect());
	}

	#[test]
	fn build_params_skips_groups_missing_from_snapshot() {
		let snapshot = ClusterSnapshot::new();
		let candidates: BTreeSet<GroupId> = [999].into_iter().collect();
		assert!(build_params(&candidates, &snapshot).is_empty());
	}
}
