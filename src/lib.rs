//! Cluster-wide storage-balancer scheduling core: periodic starters,
//! admission/resource accounting, and candidate-selection policies for
//! groupset maintenance jobs.

pub mod analytics;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod history;
pub mod model;
pub mod resource;
pub mod scheduler;
pub mod snapshot;
pub mod starter;

pub use config::SchedulerConfig;
pub use scheduler::Scheduler;
pub use snapshot::ClusterSnapshot;
pub use starter::SchedulerCore;
