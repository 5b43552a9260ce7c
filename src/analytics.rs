//! Analytics (YQL) query client. Consumed by the TTL-cleanup starter as a
//! data source for one candidate stream; out of scope to implement against
//! a real cluster here, so this module only defines the contract and the
//! query templates a real adapter would issue.

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::model::CoupleId;

/// One query round-trip against the analytics cluster.
#[async_trait]
pub trait AnalyticsClient: Send + Sync {
	/// `SELECT COUNT(*) FROM {table} WHERE source_table = {date_iso}`.
	async fn count_partition(&self, table: &str, date_iso: &str) -> Result<u64, CollaboratorError>;

	/// Groups yesterday's upload rows positively and delete rows negatively
	/// by rounded-up expiration date, inserting into the aggregate table.
	async fn pre_aggregate_yesterday(&self, base_table: &str, aggregate_table: &str) -> Result<(), CollaboratorError>;

	/// `SELECT couple_id FROM (SUM expired_size GROUP BY couple_id …) WHERE
	/// sum >= threshold`.
	async fn expired_couples(&self, aggregate_table: &str, threshold_bytes: f64) -> Result<Vec<CoupleId>, CollaboratorError>;

	/// Table-rewrite under one transaction: copies rows with
	/// `expiration_date > ttl_cleanup_ts` for each couple into a temp table,
	/// then atomically swaps it in for the aggregate table.
	async fn replace_aggregate_table(
		&self,
		aggregate_table: &str,
		cutoffs: &std::collections::BTreeMap<CoupleId, i64>,
	) -> Result<(), CollaboratorError>;
}

/// Ensures yesterday's partition exists in `aggregate_table`, pre-aggregating
/// it from `base_table` if the validation query finds it missing or empty.
#[tracing::instrument(skip(client))]
pub async fn ensure_yesterday_partition(
	client: &dyn AnalyticsClient,
	base_table: &str,
	aggregate_table: &str,
	yesterday_iso: &str,
) -> Result<(), CollaboratorError> {
	let count = client.count_partition(aggregate_table, yesterday_iso).await.unwrap_or(0);
	if count == 0 {
		client.pre_aggregate_yesterday(base_table, aggregate_table).await?;
	}
	Ok(())
}
