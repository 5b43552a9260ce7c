//! Historic-state store: a durable `couple → {recover_ts, ttl_cleanup_ts}`
//! mapping backed by a document database, collection "scheduler".
//! [`MongoHistoryStore`] is the real adapter; [`InMemoryHistoryStore`] is
//! the fake used by starter unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::options::UpdateModifications;
use mongodb::Collection;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::HistoryError;
use crate::model::CoupleId;

/// `{couple_id → {recover_ts, ttl_cleanup_ts}}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoricRecord {
	pub recover_ts: i64,
	pub ttl_cleanup_ts: i64,
}

const BATCH_SIZE: usize = 200;

/// Durable mapping from groupset identity to its recovery/cleanup timestamps.
#[async_trait]
pub trait HistoryStore: Send + Sync {
	/// Returns the cached map, synchronizing against `live_couples` first if
	/// the cache size has drifted.
	async fn get_history(
		&self,
		live_couples: &BTreeSet<CoupleId>,
		now: i64,
	) -> Result<BTreeMap<CoupleId, HistoricRecord>, HistoryError>;

	/// Reconciles the store against `live_couples`, inserting new couples
	/// (stamped with `now`) and removing vanished ones, in batches of 200
	/// unordered bulk operations.
	async fn sync(&self, live_couples: &BTreeSet<CoupleId>, now: i64) -> Result<(), HistoryError>;

	/// Upserts only the provided fields.
	async fn update_historic_ts(
		&self,
		couple: &CoupleId,
		recover_ts: Option<i64>,
		cleanup_ts: Option<i64>,
	) -> Result<(), HistoryError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryDoc {
	couple: String,
	recover_ts: i64,
	ttl_cleanup_ts: i64,
}

pub struct MongoHistoryStore {
	collection: Collection<HistoryDoc>,
	cache: RwLock<BTreeMap<CoupleId, HistoricRecord>>,
}

impl MongoHistoryStore {
	/// `db` is the database named by `metadata.scheduler.db`; the
	/// collection is always "scheduler".
	pub fn new(db: mongodb::Database) -> Self {
		Self {
			collection: db.collection("scheduler"),
			cache: RwLock::new(BTreeMap::new()),
		}
	}
}

#[async_trait]
impl HistoryStore for MongoHistoryStore {
	async fn get_history(
		&self,
		live_couples: &BTreeSet<CoupleId>,
		now: i64,
	) -> Result<BTreeMap<CoupleId, HistoricRecord>, HistoryError> {
		if self.cache.read().await.len() != live_couples.len() {
			self.sync(live_couples, now).await?;
		}
		Ok(self.cache.read().await.clone())
	}

	async fn sync(&self, live_couples: &BTreeSet<CoupleId>, now: i64) -> Result<(), HistoryError> {
		use futures::stream::TryStreamExt;

		let mut cursor = self
			.collection
			.find(doc! {})
			.await
			.map_err(|e| HistoryError::Transport(e.to_string()))?;

		let mut stored = BTreeMap::new();
		while let Some(record) = cursor
			.try_next()
			.await
			.map_err(|e| HistoryError::Transport(e.to_string()))?
		{
			stored.insert(
				record.couple.clone(),
				HistoricRecord {
					recover_ts: record.recover_ts,
					ttl_cleanup_ts: record.ttl_cleanup_ts,
				},
			);
		}

		let stored_keys: BTreeSet<CoupleId> = stored.keys().cloned().collect();
		let add: Vec<CoupleId> = live_couples.difference(&stored_keys).cloned().collect();
		let remove: Vec<CoupleId> = stored_keys.difference(live_couples).cloned().collect();

		tracing::info!(add = add.len(), remove = remove.len(), "syncing historic-state store");

		for batch in add.chunks(BATCH_SIZE) {
			let docs: Vec<HistoryDoc> = batch
				.iter()
				.map(|couple| HistoryDoc {
					couple: couple.clone(),
					recover_ts: now,
					ttl_cleanup_ts: now,
				})
				.collect();
			let result = self
				.collection
				.insert_many(docs)
				.await
				.map_err(|e| HistoryError::Transport(e.to_string()))?;
			if result.inserted_ids.len() != batch.len() {
				return Err(HistoryError::BulkInsertCountMismatch {
					expected: batch.len(),
					reported: result.inserted_ids.len(),
				});
			}
			for couple in batch {
				stored.insert(
					couple.clone(),
					HistoricRecord {
						recover_ts: now,
						ttl_cleanup_ts: now,
					},
				);
			}
		}

		for batch in remove.chunks(BATCH_SIZE) {
			let result = self
				.collection
				.delete_many(doc! { "couple": { "$in": batch.to_vec() } })
				.await
				.map_err(|e| HistoryError::Transport(e.to_string()))?;
			if result.deleted_count as usize != batch.len() {
				return Err(HistoryError::BulkRemoveCountMismatch {
					expected: batch.len(),
					reported: result.deleted_count as usize,
				});
			}
			for couple in batch {
				stored.remove(couple);
			}
		}

		*self.cache.write().await = stored;
		Ok(())
	}

	async fn update_historic_ts(
		&self,
		couple: &CoupleId,
		recover_ts: Option<i64>,
		cleanup_ts: Option<i64>,
	) -> Result<(), HistoryError> {
		let mut set = doc! {};
		if let Some(ts) = recover_ts {
			set.insert("recover_ts", ts);
		}
		if let Some(ts) = cleanup_ts {
			set.insert("ttl_cleanup_ts", ts);
		}
		if set.is_empty() {
			return Ok(());
		}

		let result = self
			.collection
			.update_one(
				doc! { "couple": couple.clone() },
				UpdateModifications::Document(doc! { "$set": set }),
			)
			.upsert(true)
			.await
			.map_err(|e| HistoryError::Transport(e.to_string()))?;

		if result.matched_count == 0 && result.upserted_id.is_none() {
			return Err(HistoryError::UpsertNotAcknowledged {
				couple: couple.clone(),
				ok: 0,
			});
		}

		let mut cache = self.cache.write().await;
		let entry = cache.entry(couple.clone()).or_default();
		if let Some(ts) = recover_ts {
			entry.recover_ts = ts;
		}
		if let Some(ts) = cleanup_ts {
			entry.ttl_cleanup_ts = ts;
		}
		Ok(())
	}
}

/// In-memory fake used by starter tests and by deployments that run without
/// a document database backing (e.g. single-node evaluation).
#[derive(Default)]
pub struct InMemoryHistoryStore {
	inner: RwLock<BTreeMap<CoupleId, HistoricRecord>>,
}

impl InMemoryHistoryStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn seed(records: impl IntoIterator<Item = (CoupleId, HistoricRecord)>) -> Arc<Self> {
		Arc::new(Self {
			inner: RwLock::new(records.into_iter().collect()),
		})
	}
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
	async fn get_history(
		&self,
		live_couples: &BTreeSet<CoupleId>,
		now: i64,
	) -> Result<BTreeMap<CoupleId, HistoricRecord>, HistoryError> {
		if self.inner.read().await.len() != live_couples.len() {
			self.sync(live_couples, now).await?;
		}
		Ok(self.inner.read().await.clone())
	}

	async fn sync(&self, live_couples: &BTreeSet<CoupleId>, now: i64) -> Result<(), HistoryError> {
		let mut inner = self.inner.write().await;
		let stored_keys: BTreeSet<CoupleId> = inner.keys().cloned().collect();
		for couple in live_couples.difference(&stored_keys) {
			inner.insert(
				couple.clone(),
				HistoricRecord {
					recover_ts: now,
					ttl_cleanup_ts: now,
				},
			);
		}
		for couple in stored_keys.difference(live_couples) {
			inner.remove(couple);
		}
		Ok(())
	}

	async fn update_historic_ts(
		&self,
		couple: &CoupleId,
		recover_ts: Option<i64>,
		cleanup_ts: Option<i64>,
	) -> Result<(), HistoryError> {
		if recover_ts.is_none() && cleanup_ts.is_none() {
			return Ok(());
		}
		let mut inner = self.inner.write().await;
		let entry = inner.entry(couple.clone()).or_default();
		if let Some(ts) = recover_ts {
			entry.recover_ts = ts;
		}
		if let Some(ts) = cleanup_ts {
			entry.ttl_cleanup_ts = ts;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn sync_is_idempotent() {
		let store = InMemoryHistoryStore::new();
		let live: BTreeSet<CoupleId> = ["1:2".to_string(), "3:4".to_string()].into_iter().collect();

		store.sync(&live, 1000).await.unwrap();
		let after_first = store.get_history(&live, 2000).await.unwrap();

		store.sync(&live, 3000).await.unwrap();
		let after_second = store.get_history(&live, 4000).await.unwrap();

		assert_eq!(after_first, after_second);
	}

	#[tokio::test]
	async fn update_historic_ts_is_idempotent() {
		let store = InMemoryHistoryStore::new();
		let couple = "1:2".to_string();

		store.update_historic_ts(&couple, Some(500), None).await.unwrap();
		let once = store
			.get_history(&BTreeSet::from([couple.clone()]), 500)
			.await
			.unwrap();

		store.update_historic_ts(&couple, Some(500), None).await.unwrap();
		let twice = store
			.get_history(&BTreeSet::from([couple.clone()]), 500)
			.await
			.unwrap();

		assert_eq!(once, twice);
	}

	#[tokio::test]
	async fn sync_adds_and_removes_couples() {
		let store = InMemoryHistoryStore::seed([(
			"old:couple".to_string(),
			HistoricRecord {
				recover_ts: 1,
				ttl_cleanup_ts: 1,
			},
		)]);
		let live: BTreeSet<CoupleId> = ["new:couple".to_string()].into_iter().collect();

		let history = store.get_history(&live, 42).await.unwrap();
		assert!(history.contains_key("new:couple"));
		assert!(!history.contains_key("old:couple"));
	}
}
