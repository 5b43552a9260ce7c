//! An immutable, point-in-time view of global storage state. A fresh
//! snapshot is taken at the start of every starter run; starters never
//! mutate it, only local working copies derived from it (e.g. the move
//! starter's per-DC candidate lists).

use std::collections::BTreeMap;

use crate::model::{CoupleId, Group, GroupId, Groupset, Host, HostAddr};

#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
	pub groups: BTreeMap<GroupId, Group>,
	pub hosts: BTreeMap<HostAddr, Host>,
	pub groupsets: BTreeMap<CoupleId, Groupset>,
}

impl ClusterSnapshot {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn good_groupsets(&self) -> impl Iterator<Item = &Groupset> {
		self.groupsets.values().filter(|c| c.status.is_good())
	}

	/// Resolves a host's datacenter, returning `None` on an inventory cache
	/// miss so callers can silently skip the host.
	pub fn datacenter_of(&self, addr: &HostAddr) -> Option<&str> {
		self.hosts.get(addr)?.datacenter.as_deref()
	}
}
