//! Resource accounting vocabulary: the resource types jobs compete over and
//! the percent-based charge a job's admission places against them.

use serde::{Deserialize, Serialize};

use crate::model::{FsKey, GroupId, HostAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
	Group,
	HostIn,
	HostOut,
	Cpu,
	Fs,
}

/// A single accountable resource: a group, an `(host, fsid)` filesystem, or a
/// fractional per-host budget.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKey {
	Group(GroupId),
	HostIn(HostAddr),
	HostOut(HostAddr),
	Cpu(HostAddr),
	Fs(FsKey),
}

impl ResourceKey {
	pub fn resource_type(&self) -> ResourceType {
		match self {
			ResourceKey::Group(_) => ResourceType::Group,
			ResourceKey::HostIn(_) => ResourceType::HostIn,
			ResourceKey::HostOut(_) => ResourceType::HostOut,
			ResourceKey::Cpu(_) => ResourceType::Cpu,
			ResourceKey::Fs(_) => ResourceType::Fs,
		}
	}

	/// The host this key is charged against, if any (`Group` keys have none).
	pub fn host(&self) -> Option<&HostAddr> {
		match self {
			ResourceKey::HostIn(h) | ResourceKey::HostOut(h) | ResourceKey::Cpu(h) => Some(h),
			ResourceKey::Fs(fs) => Some(&fs.host),
			ResourceKey::Group(_) => None,
		}
	}

	/// `true` for resource types that are always fully exclusive: a group or
	/// filesystem held by one job can't also be held by another.
	pub fn is_exclusive(&self) -> bool {
		matches!(self, ResourceKey::Group(_) | ResourceKey::Fs(_))
	}
}

/// Percent-in-`[1,100]` charge for one resource key.
pub type Percent = u8;

pub const CAPACITY: Percent = 100;

/// `resource-key → percent` — a job's computed demand, the output of
/// [`crate::scheduler::Scheduler::convert_resource_representation`].
pub type ResourceDemand = std::collections::BTreeMap<ResourceKey, Percent>;

/// Converts a per-(job-type, resource-type) concurrency limit `k` into the
/// percent one admitted job charges: `floor(100/max(k,1))`.
pub fn charge_for_limit(limit: u32) -> Percent {
	(CAPACITY as u32 / limit.max(1)).min(CAPACITY as u32) as Percent
}
