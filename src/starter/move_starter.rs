//! Move starter: the largest policy. Equalises the percentage of uncoupled
//! space across datacenters by moving a full group from an over-uncoupled
//! datacenter to an under-uncoupled one, consuming an uncoupled group at
//! the destination.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StarterError;
use crate::model::{FsKey, Group, GroupId, GroupType, GroupsetStatus, HostAddr, JobType, CACHE_NAMESPACE};
use crate::resource::ResourceType;
use crate::scheduler::SchedParams;
use crate::snapshot::ClusterSnapshot;

use super::SchedulerCore;

const LOCK_NAME: &str = "scheduler/move";
const TASK_NAME: &str = "move";

pub async fn register(core: &Arc<SchedulerCore>) {
	let cfg = core.config.scheduler.r#move.clone();
	let core = core.clone();
	let run_core = core.clone();
	super::register_periodic(
		core.queue.clone(),
		core.lock.clone(),
		&core.starters,
		TASK_NAME,
		LOCK_NAME.to_string(),
		cfg.base.enabled,
		Duration::from_secs(cfg.move_period),
		move || {
			let core = run_core.clone();
			async move { run(&core).await }
		},
	)
	.await;
}

#[derive(Debug, Clone, Default)]
struct DcStat {
	total_space: u64,
	uncoupled_space: u64,
	valid_as_source: bool,
	unc_percentage: f64,
	full_groups: Vec<GroupId>,
	uncoupled_groups: Vec<GroupId>,
	uncoupled_space_per_fs: BTreeMap<FsKey, u64>,
}

fn is_good_uncoupled(group: &Group, busy_group_ids: &[GroupId]) -> bool {
	group.group_type == GroupType::Uncoupled
		&& group.node_backend.is_some()
		&& !busy_group_ids.contains(&group.id)
}

fn prepare_dc_stats(
	snapshot: &ClusterSnapshot,
	busy_group_ids: &[GroupId],
	uncoupled_space_max_bytes: u64,
) -> BTreeMap<String, DcStat> {
	let mut dcs: BTreeMap<String, DcStat> = BTreeMap::new();
	let mut total_space = 0u64;
	let mut uncoupled_space = 0u64;

	for group in snapshot.groups.values() {
		let Some(backend) = &group.node_backend else { continue };
		let Some(stat) = &backend.stat else { continue };
		let Some(dc) = snapshot.datacenter_of(&backend.host) else { continue };
		let dc = dc.to_string();
		let entry = dcs.entry(dc.clone()).or_default();

		entry.total_space += stat.total_space;
		total_space += stat.total_space;

		match group.group_type {
			GroupType::Uncoupled => {
				if !is_good_uncoupled(group, busy_group_ids) {
					continue;
				}
				entry.uncoupled_space += stat.total_space;
				uncoupled_space += stat.total_space;
				*entry.uncoupled_space_per_fs.entry(backend.fs_key()).or_insert(0) += stat.total_space;
				entry.uncoupled_groups.push(group.id);
			}
			GroupType::Data => {
				let Some(couple_id) = &group.groupset else { continue };
				let Some(couple) = snapshot.groupsets.get(couple_id) else { continue };
				if couple.status != GroupsetStatus::Full {
					continue;
				}
				if couple.namespace == CACHE_NAMESPACE {
					continue;
				}
				let single_backend_per_group = couple
					.groups
					.iter()
					.all(|gid| snapshot.groups.get(gid).map(|g| g.node_backend.is_some()).unwrap_or(false));
				if !single_backend_per_group {
					continue;
				}
				entry.full_groups.push(group.id);
			}
			_ => {}
		}
	}

	if total_space == 0 {
		return dcs;
	}
	let avg_unc_percentage = uncoupled_space as f64 / total_space as f64;

	for stat in dcs.values_mut() {
		if stat.total_space == 0 {
			continue;
		}
		stat.unc_percentage = stat.uncoupled_space as f64 / stat.total_space as f64;

		if stat.unc_percentage > avg_unc_percentage {
			continue;
		}
		if uncoupled_space_max_bytes != 0 && stat.uncoupled_space > uncoupled_space_max_bytes {
			continue;
		}
		stat.valid_as_source = true;
	}

	dcs
}

/// Finds the leftmost destination candidate (sorted descending by `avail`)
/// with `avail >= src_space` — the lowest available space that still fits.
fn find_fitting_destination(candidates: &[(u64, GroupId)], src_space: u64) -> Option<usize> {
	// Binary search over a descending-sorted slice: find the first index
	// whose avail drops below src_space, then step back one.
	let mut lo = 0usize;
	let mut hi = candidates.len();
	while lo < hi {
		let mid = (lo + hi) / 2;
		if candidates[mid].0 > src_space {
			lo = mid + 1;
		} else {
			hi = mid;
		}
	}
	if lo < candidates.len() && candidates[lo].0 == src_space {
		return Some(lo);
	}
	if lo == 0 {
		None
	} else {
		Some(lo - 1)
	}
}

#[tracing::instrument(skip_all)]
async fn run(core: &SchedulerCore) -> Result<(), StarterError> {
	let cfg = &core.config.scheduler.r#move;
	let snapshot = core.snapshot().await?;

	let limits = core.config.resource_limits();
	let host_out_limit = limits.get(&(JobType::Move, ResourceType::HostOut)).copied().unwrap_or(1);
	let host_in_limit = limits.get(&(JobType::Move, ResourceType::HostIn)).copied().unwrap_or(1);

	let host_out_demand = [(ResourceType::HostOut, crate::resource::charge_for_limit(host_out_limit))]
		.into_iter()
		.collect();
	let host_out_notcandidates: Vec<HostAddr> = core.scheduler.get_busy_hosts(&host_out_demand);

	let host_in_demand = [(ResourceType::HostIn, crate::resource::charge_for_limit(host_in_limit))]
		.into_iter()
		.collect();
	let host_in_notcandidates: Vec<HostAddr> = core.scheduler.get_busy_hosts(&host_in_demand);

	let busy_group_ids = core.scheduler.get_busy_group_ids();

	let mut dcs = prepare_dc_stats(&snapshot, &busy_group_ids, cfg.uncoupled_space_max_bytes);

	let mut params: Vec<crate::model::JobParams> = Vec::new();

	let mut src_dc_names: Vec<String> = dcs
		.iter()
		.filter(|(_, stat)| stat.valid_as_source)
		.map(|(name, _)| name.clone())
		.collect();
	src_dc_names.sort_by(|a, b| dcs[a].unc_percentage.total_cmp(&dcs[b].unc_percentage));

	for src_dc in src_dc_names {
		let mut src_groups: Vec<GroupId> = {
			let stat = &dcs[&src_dc];
			stat.full_groups
				.iter()
				.copied()
				.filter(|gid| {
					let Some(group) = snapshot.groups.get(gid) else { return false };
					let Some(backend) = &group.node_backend else { return false };
					!host_out_notcandidates.contains(&backend.host) && !busy_group_ids.contains(gid)
				})
				.collect()
		};
		if src_groups.is_empty() {
			continue;
		}
		// Greedy largest-first for better matching.
		src_groups.sort_by_key(|gid| std::cmp::Reverse(group_total_space(&snapshot, *gid)));

		let src_unc_percentage = dcs[&src_dc].unc_percentage;

		let mut dst_dc_names: Vec<String> = dcs.keys().cloned().collect();
		dst_dc_names.sort_by(|a, b| dcs[b].uncoupled_space.cmp(&dcs[a].uncoupled_space));

		for dst_dc in dst_dc_names {
			if dst_dc == src_dc {
				continue;
			}

			{
				let dst_stat = &dcs[&dst_dc];
				if (dst_stat.unc_percentage) < src_unc_percentage + cfg.uncoupled_diff_sensitive_percent as f64 / 100.0 {
					continue;
				}
				if cfg.uncoupled_space_min_bytes != 0 && dst_stat.uncoupled_space <= cfg.uncoupled_space_min_bytes {
					continue;
				}
			}

			let mut dst_candidates: Vec<(u64, GroupId)> = dcs[&dst_dc]
				.uncoupled_groups
				.iter()
				.filter_map(|gid| {
					let group = snapshot.groups.get(gid)?;
					let backend = group.node_backend.as_ref()?;
					if host_in_notcandidates.contains(&backend.host) {
						return None;
					}
					let avail = *dcs[&dst_dc].uncoupled_space_per_fs.get(&backend.fs_key())?;
					Some((avail, *gid))
				})
				.collect();
			dst_candidates.sort_by(|a, b| b.0.cmp(&a.0));
			if dst_candidates.is_empty() {
				continue;
			}

			let mut i = 0;
			while i < src_groups.len() {
				let gid = src_groups[i];
				let Some(group) = snapshot.groups.get(&gid) else {
					i += 1;
					continue;
				};

				let already_in_dst = group
					.groupset
					.as_ref()
					.and_then(|c| snapshot.groupsets.get(c))
					.map(|couple| couple.groups.iter().any(|g| dcs[&dst_dc].full_groups.contains(g)))
					.unwrap_or(false);
				if already_in_dst {
					i += 1;
					continue;
				}

				let src_space = group_total_space(&snapshot, gid);
				let Some(idx) = find_fitting_destination(&dst_candidates, src_space) else {
					i += 1;
					continue;
				};
				let (dst_avail, dst_gid) = dst_candidates[idx];

				debug_assert!(src_dc != dst_dc);
				debug_assert!(dst_avail >= src_space);
				debug_assert!(!busy_group_ids.contains(&dst_gid) && !busy_group_ids.contains(&gid));

				let Some(src_backend) = group.node_backend.as_ref() else {
					i += 1;
					continue;
				};
				let Some(dst_group) = snapshot.groups.get(&dst_gid) else {
					i += 1;
					continue;
				};
				let Some(dst_backend) = dst_group.node_backend.as_ref() else {
					i += 1;
					continue;
				};

				let mut entry = serde_json::Map::new();
				entry.insert("group".to_string(), serde_json::json!(gid));
				entry.insert("uncoupled_group".to_string(), serde_json::json!(dst_gid));
				entry.insert("merged_groups".to_string(), serde_json::json!([] as [u64; 0]));
				entry.insert("src_host".to_string(), serde_json::json!(src_backend.host.0));
				entry.insert("src_port".to_string(), serde_json::json!(src_backend.port));
				entry.insert("src_family".to_string(), serde_json::json!(src_backend.family));
				entry.insert("src_backend_id".to_string(), serde_json::json!(src_backend.backend_id));
				entry.insert("src_base_path".to_string(), serde_json::json!(src_backend.base_path));
				entry.insert("dst_host".to_string(), serde_json::json!(dst_backend.host.0));
				entry.insert("dst_port".to_string(), serde_json::json!(dst_backend.port));
				entry.insert("dst_family".to_string(), serde_json::json!(dst_backend.family));
				entry.insert("dst_backend_id".to_string(), serde_json::json!(dst_backend.backend_id));
				entry.insert("dst_base_path".to_string(), serde_json::json!(dst_backend.base_path));
				params.push(entry);

				src_groups.remove(i);
				dst_candidates.remove(idx);
				let fs_key = dst_backend.fs_key();
				if let Some(dst_stat) = dcs.get_mut(&dst_dc) {
					dst_stat.uncoupled_groups.retain(|g| *g != dst_gid);
					dst_stat.uncoupled_space = dst_stat.uncoupled_space.saturating_sub(src_space);
					if let Some(per_fs) = dst_stat.uncoupled_space_per_fs.get_mut(&fs_key) {
						*per_fs = per_fs.saturating_sub(src_space);
					}
					if dst_stat.total_space != 0 {
						dst_stat.unc_percentage = dst_stat.uncoupled_space as f64 / dst_stat.total_space as f64;
					}
				}
				if let Some(src_stat) = dcs.get_mut(&src_dc) {
					src_stat.full_groups.retain(|g| *g != gid);
				}
				tracing::info!(src_group = gid, dst_group = dst_gid, %src_dc, %dst_dc, "matched move pair");
				// Don't advance `i`: the element at this index has shifted.
			}
		}
	}

	if params.is_empty() {
		tracing::info!("no move candidates found");
		return Ok(());
	}

	let sched_params = SchedParams {
		max_executing_jobs: core.config.max_executing_jobs(JobType::Move),
		autoapprove: cfg.base.autoapprove,
		force: cfg.base.force,
	};
	let attempted = params.len();
	let created = core.scheduler.create_jobs(JobType::Move, params, sched_params).await?;
	tracing::info!(created = created.len(), attempted, "created move jobs");
	Ok(())
}

fn group_total_space(snapshot: &ClusterSnapshot, gid: GroupId) -> u64 {
	snapshot
		.groups
		.get(&gid)
		.and_then(|g| g.node_backend.as_ref())
		.and_then(|b| b.stat.as_ref())
		.map(|s| s.total_space)
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{Groupset, GroupsetStats, Host, NodeBackend, NodeBackendStats};

	fn host(addr: &str, dc: &str) -> (HostAddr, Host) {
		let addr: HostAddr = addr.into();
		(
			addr.clone(),
			Host {
				addr,
				datacenter: Some(dc.to_string()),
			},
		)
	}

	fn backend(host: &str, total_space: u64) -> NodeBackend {
		NodeBackend {
			host: host.into(),
			port: 1025,
			family: 10,
			backend_id: 1,
			base_path: "/srv/1".to_string(),
			fsid: 1,
			stat: Some(NodeBackendStats {
				total_space,
				used_space: 0,
				vfs_free_space: total_space,
				max_blob_base_size: 0,
				files: 0,
				files_removed: 0,
				files_removed_size: 0,
			}),
		}
	}

	fn data_group(id: GroupId, host: &str, total_space: u64, couple: &str) -> Group {
		Group {
			id,
			group_type: GroupType::Data,
			node_backend: Some(backend(host, total_space)),
			groupset: Some(couple.to_string()),
			want_defrag: false,
			keys_count: 0,
		}
	}

	fn uncoupled_group(id: GroupId, host: &str, total_space: u64) -> Group {
		Group {
			id,
			group_type: GroupType::Uncoupled,
			node_backend: Some(backend(host, total_space)),
			groupset: None,
			want_defrag: false,
			keys_count: 0,
		}
	}

	fn full_couple(id: &str, groups: Vec<GroupId>) -> Groupset {
		Groupset {
			id: id.to_string(),
			status: GroupsetStatus::Full,
			namespace: "default".to_string(),
			groups,
			stats: GroupsetStats { files_removed_size: 0 },
		}
	}

	/// dc1: 1000 total, 100 uncoupled (10%); dc2: 1000 total, 300 uncoupled
	/// (30%). The cluster average is 20%, so dc1 qualifies as a source and
	/// dc2 does not.
	fn two_dc_snapshot() -> ClusterSnapshot {
		let mut snapshot = ClusterSnapshot::new();
		snapshot.hosts.extend([host("dc1-host", "dc1"), host("dc2-host", "dc2")]);
		snapshot.groups.extend([
			(1, data_group(1, "dc1-host", 900, "1:0")),
			(2, uncoupled_group(2, "dc1-host", 100)),
			(3, uncoupled_group(3, "dc2-host", 300)),
			(4, data_group(4, "dc2-host", 700, "4:0")),
		]);
		snapshot
			.groupsets
			.insert("1:0".to_string(), full_couple("1:0", vec![1]));
		snapshot
			.groupsets
			.insert("4:0".to_string(), full_couple("4:0", vec![4]));
		snapshot
	}

	#[test]
	fn prepare_dc_stats_flags_only_the_under_uncoupled_dc_as_source() {
		let snapshot = two_dc_snapshot();
		let dcs = prepare_dc_stats(&snapshot, &[], 0);

		assert!(dcs["dc1"].valid_as_source);
		assert!(!dcs["dc2"].valid_as_source);
		assert_eq!(dcs["dc1"].full_groups, vec![1]);
		assert_eq!(dcs["dc2"].uncoupled_groups, vec![3]);
	}

	#[test]
	fn find_fitting_destination_picks_lowest_avail_that_still_fits() {
		// Descending by avail: 500, 300, 100.
		let candidates = vec![(500, 10), (300, 20), (100, 30)];

		assert_eq!(find_fitting_destination(&candidates, 250), Some(1));
		assert_eq!(find_fitting_destination(&candidates, 300), Some(1));
		assert_eq!(find_fitting_destination(&candidates, 50), Some(2));
		assert_eq!(find_fitting_destination(&candidates, 501), None);
	}
}
