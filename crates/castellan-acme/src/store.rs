//! Thin typed wrappers over `DbAdapter` for the five ACME resource kinds.
//! Every write goes through `VersionedRecord`; every status transition goes
//! through `cas_status`, the one CAS-on-status primitive spec §5 names.

use serde::{Deserialize, Serialize};

use castellan_types::db_adapter::{Bucket, DbAdapter};
use castellan_types::model::{AcmeAccount, AcmeAuthorization, AcmeChallenge, AcmeOrder, EabKey};
use castellan_types::prelude::*;
use castellan_types::storage::VersionedRecord;

pub async fn get<T: for<'de> Deserialize<'de>>(
	db: &dyn DbAdapter,
	bucket: Bucket,
	id: &str,
) -> ClResult<T> {
	let bytes = db.get(bucket, id).await?;
	Ok(VersionedRecord::decode(&bytes)?.value)
}

pub async fn put<T: Serialize>(db: &dyn DbAdapter, bucket: Bucket, id: &str, value: &T) -> ClResult<()> {
	let bytes = VersionedRecord::new(value).encode()?;
	db.put(bucket, id, bytes).await
}

pub async fn get_account(db: &dyn DbAdapter, id: &str) -> ClResult<AcmeAccount> {
	get(db, Bucket::AcmeAccounts, id).await.map_err(|err| match err {
		Error::NotFound => Error::acme(AcmeErrorKind::AccountDoesNotExist, "no account with this ID"),
		other => other,
	})
}

pub async fn put_account(db: &dyn DbAdapter, account: &AcmeAccount) -> ClResult<()> {
	put(db, Bucket::AcmeAccounts, &account.id, account).await
}

pub async fn get_account_by_key_id(
	db: &dyn DbAdapter,
	provisioner_id: &str,
	thumbprint: &str,
) -> ClResult<Option<AcmeAccount>> {
	let key = format!("{provisioner_id}/{thumbprint}");
	match db.get(Bucket::AcmeAccountByKeyId, &key).await {
		Ok(bytes) => {
			let id = String::from_utf8(bytes)
				.map_err(|_| Error::Internal("account index value is not UTF-8".into()))?;
			Ok(Some(get_account(db, &id).await?))
		}
		Err(Error::NotFound) => Ok(None),
		Err(other) => Err(other),
	}
}

pub async fn get_order(db: &dyn DbAdapter, id: &str) -> ClResult<AcmeOrder> {
	get(db, Bucket::AcmeOrders, id).await.map_err(|err| match err {
		Error::NotFound => Error::acme(AcmeErrorKind::Malformed, "no order with this ID"),
		other => other,
	})
}

pub async fn put_order(db: &dyn DbAdapter, order: &AcmeOrder) -> ClResult<()> {
	put(db, Bucket::AcmeOrders, &order.id, order).await
}

pub async fn get_authz(db: &dyn DbAdapter, id: &str) -> ClResult<AcmeAuthorization> {
	get(db, Bucket::AcmeAuthzs, id).await.map_err(|err| match err {
		Error::NotFound => Error::acme(AcmeErrorKind::Malformed, "no authorization with this ID"),
		other => other,
	})
}

pub async fn put_authz(db: &dyn DbAdapter, authz: &AcmeAuthorization) -> ClResult<()> {
	put(db, Bucket::AcmeAuthzs, &authz.id, authz).await
}

pub async fn get_challenge(db: &dyn DbAdapter, id: &str) -> ClResult<AcmeChallenge> {
	get(db, Bucket::AcmeChallenges, id).await.map_err(|err| match err {
		Error::NotFound => Error::acme(AcmeErrorKind::Malformed, "no challenge with this ID"),
		other => other,
	})
}

pub async fn put_challenge(db: &dyn DbAdapter, challenge: &AcmeChallenge) -> ClResult<()> {
	put(db, Bucket::AcmeChallenges, &challenge.id, challenge).await
}

pub async fn get_eab_key(db: &dyn DbAdapter, id: &str) -> ClResult<EabKey> {
	get(db, Bucket::AcmeEabKeys, id).await
}

pub async fn get_eab_key_by_reference(
	db: &dyn DbAdapter,
	provisioner_id: &str,
	reference: &str,
) -> ClResult<Option<EabKey>> {
	let key = format!("{provisioner_id}/{reference}");
	match db.get(Bucket::AcmeEabKeyByReference, &key).await {
		Ok(bytes) => {
			let id = String::from_utf8(bytes)
				.map_err(|_| Error::Internal("EAB index value is not UTF-8".into()))?;
			Ok(Some(get_eab_key(db, &id).await?))
		}
		Err(Error::NotFound) => Ok(None),
		Err(other) => Err(other),
	}
}

/// Swaps `resource`'s status field in-place by re-encoding the whole
/// record under a CAS guarded by the bytes previously read — the "CAS on
/// (resource-ID, prior-status)" primitive spec §5 describes, generalized
/// here over whatever serializes through `VersionedRecord` rather than
/// repeated per resource kind.
pub async fn cas_replace<T: Serialize>(
	db: &dyn DbAdapter,
	bucket: Bucket,
	id: &str,
	old: &T,
	new: &T,
) -> ClResult<()> {
	let old_bytes = VersionedRecord::new(old).encode()?;
	let new_bytes = VersionedRecord::new(new).encode()?;
	db.cmp_and_swap(bucket, id, Some(old_bytes), Some(new_bytes)).await
}

// vim: ts=4
