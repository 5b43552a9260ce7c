//! Configuration surface, loaded via the `config` crate from whatever
//! layered sources the deployment wires up (file + env), the way the
//! teacher's `rivet-config` package composes `config::Config` builders.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::JobType;
use crate::resource::ResourceType;

/// Per-starter knobs shared by all four candidate-selection starters: enable
/// flag, period override, and the autoapprove/force flags forwarded into
/// [`crate::scheduler::SchedParams`]. Each starter's own section flattens
/// this in and adds whatever else it needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StarterConfig {
	#[serde(default)]
	pub enabled: bool,
	pub period_secs: Option<u64>,
	#[serde(default)]
	pub autoapprove: bool,
	#[serde(default)]
	pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverDcConfig {
	#[serde(flatten)]
	pub base: StarterConfig,
	#[serde(default = "default_keys_cf")]
	pub keys_cf: u64,
	#[serde(default = "default_timestamp_cf")]
	pub timestamp_cf: u64,
	#[serde(default = "default_min_key_loss")]
	pub min_key_loss: u64,
}

fn default_keys_cf() -> u64 {
	86_400
}
fn default_timestamp_cf() -> u64 {
	1
}
fn default_min_key_loss() -> u64 {
	1
}

impl Default for RecoverDcConfig {
	fn default() -> Self {
		Self {
			base: StarterConfig::default(),
			keys_cf: default_keys_cf(),
			timestamp_cf: default_timestamp_cf(),
			min_key_loss: default_min_key_loss(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoupleDefragConfig {
	#[serde(flatten)]
	pub base: StarterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveConfig {
	#[serde(flatten)]
	pub base: StarterConfig,
	#[serde(default)]
	pub uncoupled_space_max_bytes: u64,
	#[serde(default)]
	pub uncoupled_space_min_bytes: u64,
	#[serde(default = "default_uncoupled_diff_sensitive_percent")]
	pub uncoupled_diff_sensitive_percent: u64,
	#[serde(default = "default_move_period")]
	pub move_period: u64,
}

fn default_uncoupled_diff_sensitive_percent() -> u64 {
	1
}
fn default_move_period() -> u64 {
	1800
}

impl Default for MoveConfig {
	fn default() -> Self {
		Self {
			base: StarterConfig::default(),
			uncoupled_space_max_bytes: 0,
			uncoupled_space_min_bytes: 0,
			uncoupled_diff_sensitive_percent: default_uncoupled_diff_sensitive_percent(),
			move_period: default_move_period(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlCleanupConfig {
	#[serde(flatten)]
	pub base: StarterConfig,
	#[serde(default)]
	pub yt_cluster: String,
	#[serde(default)]
	pub yt_token: String,
	#[serde(default = "default_yt_attempts")]
	pub yt_attempts: u32,
	#[serde(default = "default_yt_delay")]
	pub yt_delay: u64,
	#[serde(default)]
	pub aggregation_table: String,
	#[serde(default)]
	pub tskv_log_table: String,
	#[serde(default = "default_ttl_threshold")]
	pub ttl_threshold: f64,
	#[serde(default = "default_replace_period")]
	pub replace_period_secs: u64,
}

fn default_yt_attempts() -> u32 {
	3
}
fn default_yt_delay() -> u64 {
	10
}
fn default_ttl_threshold() -> f64 {
	10.0 * 1024f64.powi(3)
}
fn default_replace_period() -> u64 {
	60 * 60 * 24 * 10
}

impl Default for TtlCleanupConfig {
	fn default() -> Self {
		Self {
			base: StarterConfig::default(),
			yt_cluster: String::new(),
			yt_token: String::new(),
			yt_attempts: default_yt_attempts(),
			yt_delay: default_yt_delay(),
			aggregation_table: String::new(),
			tskv_log_table: String::new(),
			ttl_threshold: default_ttl_threshold(),
			replace_period_secs: default_replace_period(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerSection {
	#[serde(default)]
	pub recover_dc: RecoverDcConfig,
	#[serde(default)]
	pub couple_defrag: CoupleDefragConfig,
	#[serde(default)]
	pub r#move: MoveConfig,
	#[serde(default)]
	pub ttl_cleanup: TtlCleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesLimits {
	#[serde(default = "default_limit")]
	pub host_in: u32,
	#[serde(default = "default_limit")]
	pub host_out: u32,
	#[serde(default = "default_limit")]
	pub cpu: u32,
	#[serde(default = "default_limit")]
	pub fs: u32,
}

fn default_limit() -> u32 {
	1
}

impl Default for ResourcesLimits {
	fn default() -> Self {
		Self {
			host_in: default_limit(),
			host_out: default_limit(),
			cpu: default_limit(),
			fs: default_limit(),
		}
	}
}

impl ResourcesLimits {
	pub fn get(&self, resource_type: ResourceType) -> u32 {
		match resource_type {
			ResourceType::HostIn => self.host_in,
			ResourceType::HostOut => self.host_out,
			ResourceType::Cpu => self.cpu,
			ResourceType::Fs | ResourceType::Group => default_limit(),
		}
	}
}

fn default_max_executing_jobs() -> u32 {
	3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
	#[serde(default = "default_max_executing_jobs")]
	pub max_executing_jobs: u32,
	#[serde(default)]
	pub resources_limits: ResourcesLimits,
}

impl Default for JobConfig {
	fn default() -> Self {
		Self {
			max_executing_jobs: default_max_executing_jobs(),
			resources_limits: ResourcesLimits::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlCleanupJobConfig {
	#[serde(default = "default_max_idle_days")]
	pub max_idle_days: u32,
}

fn default_max_idle_days() -> u32 {
	270
}

impl Default for TtlCleanupJobConfig {
	fn default() -> Self {
		Self {
			max_idle_days: default_max_idle_days(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobsSection {
	#[serde(default)]
	pub recover_dc: JobConfig,
	#[serde(default)]
	pub couple_defrag: JobConfig,
	#[serde(default)]
	pub r#move: JobConfig,
	#[serde(default)]
	pub ttl_cleanup: JobConfig,
	#[serde(default)]
	pub ttl_cleanup_job: TtlCleanupJobConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetadataSchedulerSection {
	pub db: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetadataSection {
	#[serde(default)]
	pub scheduler: MetadataSchedulerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
	#[serde(default)]
	pub scheduler: SchedulerSection,
	#[serde(default)]
	pub jobs: JobsSection,
	#[serde(default)]
	pub metadata: MetadataSection,
}

impl SchedulerConfig {
	/// Builds the `(job type, resource type) -> percent cap` table the
	/// scheduler pre-computes once at startup.
	pub fn resource_limits(&self) -> BTreeMap<(JobType, ResourceType), u32> {
		let mut limits = BTreeMap::new();
		let job_configs: [(JobType, &JobConfig); 4] = [
			(JobType::RecoverDc, &self.jobs.recover_dc),
			(JobType::CoupleDefrag, &self.jobs.couple_defrag),
			(JobType::Move, &self.jobs.r#move),
			(JobType::TtlCleanup, &self.jobs.ttl_cleanup),
		];
		for (job_type, job_config) in job_configs {
			for resource_type in [
				ResourceType::Group,
				ResourceType::HostIn,
				ResourceType::HostOut,
				ResourceType::Cpu,
				ResourceType::Fs,
			] {
				limits.insert((job_type, resource_type), job_config.resources_limits.get(resource_type));
			}
		}
		limits
	}

	pub fn max_executing_jobs(&self, job_type: JobType) -> u32 {
		match job_type {
			JobType::RecoverDc => self.jobs.recover_dc.max_executing_jobs,
			JobType::CoupleDefrag => self.jobs.couple_defrag.max_executing_jobs,
			JobType::Move => self.jobs.r#move.max_executing_jobs,
			JobType::TtlCleanup => self.jobs.ttl_cleanup.max_executing_jobs,
		}
	}

	/// Loads configuration from layered sources (file, then environment
	/// overrides).
	pub fn load(sources: Vec<config::File<config::FileSourceString, config::FileFormat>>) -> Result<Self, ConfigError> {
		let mut builder = config::Config::builder();
		for source in sources {
			builder = builder.add_source(source);
		}
		let built = builder.build()?;
		Ok(built.try_deserialize()?)
	}
}
