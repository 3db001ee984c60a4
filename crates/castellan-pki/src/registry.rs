//! Provisioner registry (spec §5): a copy-on-write snapshot of every
//! configured provisioner, published atomically so request handlers never
//! take a lock to read it. Mutation (admin add/update/delete) rebuilds the
//! whole snapshot and swaps it in one `ArcSwap::store`; readers always see a
//! complete, self-consistent map, never a partially-updated one.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

use castellan_types::db_adapter::{Bucket, DbAdapter};
use castellan_types::prelude::*;
use castellan_types::provisioner::ProvisionerRecord;
use castellan_types::storage::VersionedRecord;

use crate::provisioner::ProvisionerInstance;

#[derive(Debug, Default)]
struct Snapshot {
	by_id: HashMap<Box<str>, Arc<ProvisionerInstance>>,
}

#[derive(Debug)]
pub struct ProvisionerRegistry {
	snapshot: ArcSwap<Snapshot>,
}

impl Default for ProvisionerRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl ProvisionerRegistry {
	pub fn new() -> Self {
		Self { snapshot: ArcSwap::from_pointee(Snapshot::default()) }
	}

	/// Loads every provisioner currently in the store and publishes a fresh
	/// snapshot. Called once at startup and by the admin API after any
	/// mutation (spec §5 "reloaded in full, not patched in place").
	pub async fn reload(&self, db: &dyn DbAdapter) -> ClResult<()> {
		let rows = db.list(Bucket::Provisioners).await?;
		let mut by_id = HashMap::with_capacity(rows.len());
		for (_, bytes) in rows {
			let record: VersionedRecord<ProvisionerRecord> = VersionedRecord::decode(&bytes)?;
			let id = record.value.id.clone();
			by_id.insert(id, Arc::new(ProvisionerInstance::new(record.value)));
		}
		self.snapshot.store(Arc::new(Snapshot { by_id }));
		Ok(())
	}

	pub fn get(&self, id: &str) -> Option<Arc<ProvisionerInstance>> {
		self.snapshot.load().by_id.get(id).cloned()
	}

	pub fn list(&self) -> Vec<Arc<ProvisionerInstance>> {
		self.snapshot.load().by_id.values().cloned().collect()
	}

	/// Persists `record` and republishes the snapshot with it applied, so a
	/// concurrent reader either sees the old provisioner entirely or the new
	/// one entirely.
	pub async fn put(&self, db: &dyn DbAdapter, record: ProvisionerRecord) -> ClResult<()> {
		let bytes = VersionedRecord::new(record.clone()).encode()?;
		db.put(Bucket::Provisioners, &record.id, bytes).await?;

		let current = self.snapshot.load();
		let mut by_id = current.by_id.clone();
		by_id.insert(record.id.clone(), Arc::new(ProvisionerInstance::new(record)));
		self.snapshot.store(Arc::new(Snapshot { by_id }));
		Ok(())
	}

	pub async fn remove(&self, db: &dyn DbAdapter, id: &str) -> ClResult<()> {
		db.del(Bucket::Provisioners, id).await?;

		let current = self.snapshot.load();
		let mut by_id = current.by_id.clone();
		by_id.remove(id);
		self.snapshot.store(Arc::new(Snapshot { by_id }));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use castellan_types::db_adapter::test_double::MemoryDb;
	use castellan_types::provisioner::{
		AcmeProvisionerConfig, ProvisionerClaims, ProvisionerKind, ProvisionerOptions,
	};

	fn sample(id: &str) -> ProvisionerRecord {
		ProvisionerRecord {
			id: id.into(),
			name: id.into(),
			kind: ProvisionerKind::Acme(AcmeProvisionerConfig { device_attest_roots_pem: Default::default() }),
			claims: ProvisionerClaims::default(),
			options: ProvisionerOptions::default(),
			config_version: 1,
			created_at: Timestamp::now(),
		}
	}

	#[tokio::test]
	async fn put_then_get_returns_the_same_provisioner() {
		let db = MemoryDb::new();
		let registry = ProvisionerRegistry::new();
		registry.put(&db, sample("p1")).await.unwrap();

		let found = registry.get("p1").unwrap();
		assert_eq!(found.id(), "p1");
		assert!(registry.get("missing").is_none());
	}

	#[tokio::test]
	async fn reload_rebuilds_the_snapshot_from_storage() {
		let db = MemoryDb::new();
		let registry = ProvisionerRegistry::new();
		registry.put(&db, sample("p1")).await.unwrap();
		registry.put(&db, sample("p2")).await.unwrap();

		let fresh = ProvisionerRegistry::new();
		fresh.reload(&db).await.unwrap();
		assert_eq!(fresh.list().len(), 2);
	}

	#[tokio::test]
	async fn remove_drops_it_from_future_reads() {
		let db = MemoryDb::new();
		let registry = ProvisionerRegistry::new();
		registry.put(&db, sample("p1")).await.unwrap();
		registry.remove(&db, "p1").await.unwrap();
		assert!(registry.get("p1").is_none());
	}
}

// vim: ts=4
