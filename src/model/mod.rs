//! Cluster data model: groups, node-backends, filesystems, hosts, and the
//! groupsets ("couples") they form.
//!
//! Cross-references between groups, node-backends, filesystems and hosts are
//! modeled as stable ids resolved through a [`crate::snapshot::ClusterSnapshot`]
//! arena rather than as an in-memory object graph with back-references.

mod job;

pub use job::{Job, JobId, JobParams, JobResources, JobStatus, JobType, ACTIVE_STATUSES};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type GroupId = u64;
pub type FsId = u64;
pub type CoupleId = String;

/// A host address, e.g. `"storage-12.example.net"`. Kept as a thin newtype so
/// resource keys and candidate lists can't accidentally mix it up with a
/// couple id or namespace string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostAddr(pub String);

impl std::fmt::Display for HostAddr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for HostAddr {
	fn from(s: &str) -> Self {
		HostAddr(s.to_string())
	}
}

impl From<String> for HostAddr {
	fn from(s: String) -> Self {
		HostAddr(s)
	}
}

/// A filesystem shared by potentially multiple node-backends on one host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FsKey {
	pub host: HostAddr,
	pub fsid: FsId,
}

impl FsKey {
	pub fn new(host: HostAddr, fsid: FsId) -> Self {
		Self { host, fsid }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupType {
	Data,
	Uncoupled,
	Reserved,
	Cache,
}

/// The abstract per-resource capacity every host carries.
pub const HOST_CAPACITY: u8 = 100;

#[derive(Debug, Clone)]
pub struct Host {
	pub addr: HostAddr,
	/// `None` means the inventory cache missed resolving this host's
	/// datacenter; callers must silently skip it.
	pub datacenter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NodeBackendStats {
	pub total_space: u64,
	pub used_space: u64,
	pub vfs_free_space: u64,
	pub max_blob_base_size: u64,
	pub files: u64,
	pub files_removed: u64,
	pub files_removed_size: u64,
}

#[derive(Debug, Clone)]
pub struct NodeBackend {
	pub host: HostAddr,
	pub port: u16,
	pub family: u8,
	pub backend_id: u32,
	pub base_path: String,
	pub fsid: FsId,
	pub stat: Option<NodeBackendStats>,
}

impl NodeBackend {
	pub fn fs_key(&self) -> FsKey {
		FsKey::new(self.host.clone(), self.fsid)
	}
}

#[derive(Debug, Clone)]
pub struct Group {
	pub id: GroupId,
	pub group_type: GroupType,
	pub node_backend: Option<NodeBackend>,
	pub groupset: Option<CoupleId>,
	/// `want_defrag` flag surfaced by the group's backend.
	pub want_defrag: bool,
	pub keys_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupsetStatus {
	Init,
	Ok,
	Full,
	Bad,
	Broken,
	Frozen,
	Migrating,
}

impl GroupsetStatus {
	/// The subset of statuses a groupset must be in to be eligible for most
	/// maintenance operations.
	pub fn is_good(self) -> bool {
		matches!(self, GroupsetStatus::Ok | GroupsetStatus::Full)
	}
}

#[derive(Debug, Clone)]
pub struct GroupsetStats {
	pub files_removed_size: u64,
}

#[derive(Debug, Clone)]
pub struct Groupset {
	pub id: CoupleId,
	pub status: GroupsetStatus,
	pub namespace: String,
	pub groups: Vec<GroupId>,
	pub stats: GroupsetStats,
}

impl Groupset {
	/// `keys_diff` = max − min key count across member groups.
	pub fn keys_diff(&self, groups: &BTreeMap<GroupId, Group>) -> u64 {
		let mut min = u64::MAX;
		let mut max = 0u64;
		for gid in &self.groups {
			if let Some(g) = groups.get(gid) {
				min = min.min(g.keys_count);
				max = max.max(g.keys_count);
			}
		}
		if max < min {
			0
		} else {
			max - min
		}
	}
}

pub const CACHE_NAMESPACE: &str = "cache";
