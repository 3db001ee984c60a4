//! The transactional key-value store the authority, ACME state machine, and
//! SCEP enrollment are all written against. Adapter crates depend only on
//! `castellan-types`, so swapping the backend (sled, a cloud KV, a SQL table
//! emulating CAS via per-row versions) never touches domain logic.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::ClResult;

/// One bucket per resource family, plus the two secondary indexes the ACME
/// state machine needs for uniqueness lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
	Certs,
	RevokedCerts,
	Crl,
	Provisioners,
	Admins,
	AcmeAccounts,
	AcmeOrders,
	AcmeAuthzs,
	AcmeChallenges,
	AcmeNonces,
	AcmeEabKeys,
	SigningKeys,
	/// `(provisioner_id, jwk_thumbprint) -> account_id`
	AcmeAccountByKeyId,
	/// `(provisioner_id, reference) -> eab_key_id`
	AcmeEabKeyByReference,
	/// `(provisioner_id, transactionId) -> serial`, SCEP's replay-safety
	/// index (RFC 8894 §3.1: a transaction ID identifies one enrollment
	/// end-to-end across `PKCSReq`/`RenewalReq`/`GetCertInitial`).
	ScepTransactions,
}

impl Bucket {
	pub fn name(self) -> &'static str {
		match self {
			Self::Certs => "certs",
			Self::RevokedCerts => "revoked_certs",
			Self::Crl => "crl",
			Self::Provisioners => "provisioners",
			Self::Admins => "admins",
			Self::AcmeAccounts => "acme_accounts",
			Self::AcmeOrders => "acme_orders",
			Self::AcmeAuthzs => "acme_authzs",
			Self::AcmeChallenges => "acme_challenges",
			Self::AcmeNonces => "acme_nonces",
			Self::AcmeEabKeys => "acme_eab_keys",
			Self::SigningKeys => "signing_keys",
			Self::AcmeAccountByKeyId => "acme_account_by_key_id",
			Self::AcmeEabKeyByReference => "acme_eab_key_by_reference",
			Self::ScepTransactions => "scep_transactions",
		}
	}
}

/// The transactional map interface. Every method is phrased over raw bytes:
/// the caller owns serialization (see `crate::storage::VersionedRecord`),
/// the adapter owns durability and atomicity.
///
/// Errors: `Error::NotFound` for a missing key on `Get`/`Del`, `Error::Conflict`
/// for a `CmpAndSwap` whose `old` didn't match the stored value, `Error::Transient`
/// for a retryable backend hiccup (lock contention, I/O stall).
#[async_trait]
pub trait DbAdapter: Debug + Send + Sync {
	async fn get(&self, bucket: Bucket, key: &str) -> ClResult<Vec<u8>>;

	async fn put(&self, bucket: Bucket, key: &str, val: Vec<u8>) -> ClResult<()>;

	/// Atomically replaces the value at `key` with `new` iff the current
	/// value equals `old` (`None` meaning "key must not exist"). Returns
	/// `Error::Conflict` on mismatch — this is the one primitive every ACME
	/// status transition in this crate family is built on (spec §9 "CAS on
	/// status").
	async fn cmp_and_swap(
		&self,
		bucket: Bucket,
		key: &str,
		old: Option<Vec<u8>>,
		new: Option<Vec<u8>>,
	) -> ClResult<()>;

	async fn del(&self, bucket: Bucket, key: &str) -> ClResult<()>;

	async fn list(&self, bucket: Bucket) -> ClResult<Vec<(String, Vec<u8>)>>;

	/// Scan a secondary-index bucket for keys beginning with `prefix`,
	/// returning the index key and the value stored under it (typically the
	/// primary key it points to).
	async fn scan_prefix(&self, bucket: Bucket, prefix: &str) -> ClResult<Vec<(String, Vec<u8>)>>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_double {
	//! An in-memory `DbAdapter` used by every other crate's unit tests, so a
	//! test for the ACME state machine or the issuance pipeline never has to
	//! stand up a real `sled::Db`. Lives in this crate (not `db-adapter-sled`)
	//! precisely so that `castellan-acme`/`castellan-pki` dev-dependencies
	//! don't have to pull in the sled adapter crate at all.

	use super::*;
	use std::collections::HashMap;
	use std::sync::Mutex;

	use crate::error::Error;

	#[derive(Debug, Default)]
	pub struct MemoryDb {
		buckets: Mutex<HashMap<&'static str, HashMap<String, Vec<u8>>>>,
	}

	impl MemoryDb {
		pub fn new() -> Self {
			Self::default()
		}
	}

	#[async_trait]
	impl DbAdapter for MemoryDb {
		async fn get(&self, bucket: Bucket, key: &str) -> ClResult<Vec<u8>> {
			let buckets = self.buckets.lock().map_err(|_| Error::Internal("poisoned".into()))?;
			buckets
				.get(bucket.name())
				.and_then(|b| b.get(key))
				.cloned()
				.ok_or(Error::NotFound)
		}

		async fn put(&self, bucket: Bucket, key: &str, val: Vec<u8>) -> ClResult<()> {
			let mut buckets = self.buckets.lock().map_err(|_| Error::Internal("poisoned".into()))?;
			buckets.entry(bucket.name()).or_default().insert(key.to_string(), val);
			Ok(())
		}

		async fn cmp_and_swap(
			&self,
			bucket: Bucket,
			key: &str,
			old: Option<Vec<u8>>,
			new: Option<Vec<u8>>,
		) -> ClResult<()> {
			let mut buckets = self.buckets.lock().map_err(|_| Error::Internal("poisoned".into()))?;
			let tree = buckets.entry(bucket.name()).or_default();
			let current = tree.get(key).cloned();
			if current != old {
				return Err(Error::Conflict(format!("cas mismatch on {}", key)));
			}
			match new {
				Some(v) => tree.insert(key.to_string(), v),
				None => tree.remove(key),
			};
			Ok(())
		}

		async fn del(&self, bucket: Bucket, key: &str) -> ClResult<()> {
			let mut buckets = self.buckets.lock().map_err(|_| Error::Internal("poisoned".into()))?;
			buckets.entry(bucket.name()).or_default().remove(key);
			Ok(())
		}

		async fn list(&self, bucket: Bucket) -> ClResult<Vec<(String, Vec<u8>)>> {
			let buckets = self.buckets.lock().map_err(|_| Error::Internal("poisoned".into()))?;
			Ok(buckets
				.get(bucket.name())
				.map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
				.unwrap_or_default())
		}

		async fn scan_prefix(
			&self,
			bucket: Bucket,
			prefix: &str,
		) -> ClResult<Vec<(String, Vec<u8>)>> {
			let buckets = self.buckets.lock().map_err(|_| Error::Internal("poisoned".into()))?;
			Ok(buckets
				.get(bucket.name())
				.map(|b| {
					b.iter()
						.filter(|(k, _)| k.starts_with(prefix))
						.map(|(k, v)| (k.clone(), v.clone()))
						.collect()
				})
				.unwrap_or_default())
		}
	}

	#[tokio::test]
	async fn cas_rejects_stale_old_value() {
		let db = MemoryDb::new();
		db.put(Bucket::AcmeOrders, "o1", b"pending".to_vec()).await.unwrap();

		let ok = db
			.cmp_and_swap(Bucket::AcmeOrders, "o1", Some(b"pending".to_vec()), Some(b"ready".to_vec()))
			.await;
		assert!(ok.is_ok());

		let stale = db
			.cmp_and_swap(Bucket::AcmeOrders, "o1", Some(b"pending".to_vec()), Some(b"valid".to_vec()))
			.await;
		assert!(matches!(stale, Err(Error::Conflict(_))));
	}

	#[tokio::test]
	async fn scan_prefix_only_returns_matching_keys() {
		let db = MemoryDb::new();
		db.put(Bucket::AcmeAccountByKeyId, "p1/abc", b"acc-1".to_vec()).await.unwrap();
		db.put(Bucket::AcmeAccountByKeyId, "p1/def", b"acc-2".to_vec()).await.unwrap();
		db.put(Bucket::AcmeAccountByKeyId, "p2/abc", b"acc-3".to_vec()).await.unwrap();

		let hits = db.scan_prefix(Bucket::AcmeAccountByKeyId, "p1/").await.unwrap();
		assert_eq!(hits.len(), 2);
	}
}

// vim: ts=4
