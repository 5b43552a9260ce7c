//! Recover starter: recovery-urgency weighting over healthy groupsets,
//! submitting the top-weighted candidates as recover-dc jobs.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;

use crate::config::RecoverDcConfig;
use crate::error::StarterError;
use crate::history::HistoricRecord;
use crate::model::{CoupleId, Group, GroupId, Groupset, JobType};
use crate::scheduler::SchedParams;

use super::SchedulerCore;

const LOCK_NAME: &str = "scheduler/recover_dc";
const TASK_NAME: &str = "recover_dc";

pub async fn register(core: &Arc<SchedulerCore>) {
	let cfg = core.config.scheduler.recover_dc.clone();
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
			async move { run(&core).await }
		},
	)
	.await;
}

#[tracing::instrument(skip_all)]
async fn run(core: &SchedulerCore) -> Result<(), StarterError> {
	let cfg = &core.config.scheduler.recover_dc;
	let snapshot = core.snapshot().await?;

	let live_couples = snapshot.groupsets.keys().cloned().collect();
	let now = core.now();
	let history = core.history.get_history(&live_couples, now).await?;

	let weighted = weigh_and_sort(snapshot.good_groupsets(), &snapshot.groups, &history, cfg, now);

	let max_jobs = core.config.max_executing_jobs(JobType::RecoverDc) as usize;
	let params: Vec<crate::model::JobParams> = weighted
		.into_iter()
		.take(max_jobs)
		.map(|(_, couple)| {
			let mut map = serde_json::Map::new();
			map.insert("couple".to_string(), serde_json::json!(couple));
			map
		})
		.collect();

	let sched_params = SchedParams {
		max_executing_jobs: core.config.max_executing_jobs(JobType::RecoverDc),
		autoapprove: cfg.base.autoapprove,
		force: cfg.base.force,
	};

	let created = core
		.scheduler
		.create_jobs(JobType::RecoverDc, params, sched_params)
		.await?;
	tracing::info!(count = created.len(), "created recover dc jobs");
	Ok(())
}

/// Weighs every healthy groupset by `keys_diff * keys_cf + age * timestamp_cf`
/// and returns `(weight, couple id)` pairs sorted by descending weight.
/// Groupsets below `min_key_loss` or with no history entry yet are dropped.
fn weigh_and_sort<'a>(
	good_groupsets: impl Iterator<Item = &'a Groupset>,
	groups: &BTreeMap<GroupId, Group>,
	history: &BTreeMap<CoupleId, HistoricRecord>,
	cfg: &RecoverDcConfig,
	now: i64,
) -> Vec<(u64, String)> {
	good_groupsets
		.filter_map(|groupset| {
			let keys_diff = groupset.keys_diff(groups);
			if keys_diff < cfg.min_key_loss {
				return None;
			}
			let record = history.get(&groupset.id)?;
			let age = (now - record.recover_ts).max(0) as u64;
			let weight = keys_diff * cfg.keys_cf + age * cfg.timestamp_cf;
			Some((weight, groupset.id.clone()))
		})
		.sorted_by_key(|(weight, _)| Reverse(*weight))
		.collect()
}
