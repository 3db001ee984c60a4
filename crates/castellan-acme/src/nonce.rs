//! Anti-replay nonces (spec §4.5 "Nonces"): opaque >=128-bit tokens, 24-hour
//! TTL, single-use via CAS-delete. The in-memory `NonceCache` on `AppState`
//! absorbs the common case cheaply; the durable `AcmeNonces` bucket is the
//! actual source of truth so a nonce can't be replayed across processes or
//! after a cache eviction.

use async_trait::async_trait;

use castellan_core::App;
use castellan_core::scheduler::Task;
use castellan_types::db_adapter::Bucket;
use castellan_types::prelude::*;

const NONCE_TTL_SECS: i64 = 24 * 3600;

/// Mints a fresh nonce and records it as outstanding (spec: unknown nonces
/// are rejected, so the store must remember one was issued).
pub async fn issue(app: &App) -> ClResult<String> {
	let id = ResourceId::generate();
	let nonce = id.0.to_string();
	let expires_at = Timestamp::from_now(NONCE_TTL_SECS);
	app.db
		.cmp_and_swap(Bucket::AcmeNonces, &nonce, None, Some(expires_at.0.to_le_bytes().to_vec()))
		.await?;
	Ok(nonce)
}

/// Consumes a nonce exactly once. The CAS-delete is the real single-use
/// guarantee; `nonce_cache` just short-circuits an obvious replay before
/// touching the database (spec §5 "a small LRU fronts it").
pub async fn consume(app: &App, nonce: &str) -> ClResult<()> {
	if !app.nonce_cache.mark_seen(nonce) {
		return Err(Error::acme(AcmeErrorKind::BadNonce, "nonce has already been used"));
	}

	let bad_nonce = || Error::acme(AcmeErrorKind::BadNonce, "nonce is unknown or expired");
	let stored = match app.db.get(Bucket::AcmeNonces, nonce).await {
		Ok(bytes) => bytes,
		Err(Error::NotFound) => return Err(bad_nonce()),
		Err(other) => return Err(other),
	};

	let expires_at = i64::from_le_bytes(stored.clone().try_into().map_err(|_| bad_nonce())?);
	if Timestamp(expires_at).is_past() {
		let _ = app.db.del(Bucket::AcmeNonces, nonce).await;
		return Err(bad_nonce());
	}

	match app.db.cmp_and_swap(Bucket::AcmeNonces, nonce, Some(stored), None).await {
		Ok(()) => Ok(()),
		Err(Error::Conflict(_)) => Err(bad_nonce()),
		Err(other) => Err(other),
	}
}

/// Sweeps nonces whose TTL elapsed without ever being consumed — `consume`
/// already deletes an expired nonce the moment someone tries to use it, but
/// one nobody presents again would otherwise sit in `Bucket::AcmeNonces`
/// forever.
async fn sweep_expired(app: &App) -> ClResult<usize> {
	let mut swept = 0usize;
	for (nonce, stored) in app.db.list(Bucket::AcmeNonces).await? {
		let Ok(bytes) = <[u8; 8]>::try_from(stored.as_slice()) else { continue };
		if Timestamp(i64::from_le_bytes(bytes)).is_past() {
			app.db.del(Bucket::AcmeNonces, &nonce).await?;
			swept += 1;
		}
	}
	Ok(swept)
}

/// Registered on a daily cadence (spec §4.5 "Nonces": 24-hour TTL) alongside
/// `castellan_core::tasks::CrlRegenTask`.
#[derive(Debug, Default)]
pub struct NonceSweepTask;

#[async_trait]
impl Task<App> for NonceSweepTask {
	fn name(&self) -> &'static str {
		"acme-nonce-sweep"
	}

	async fn run(&self, app: &App) -> ClResult<()> {
		let swept = sweep_expired(app).await?;
		if swept > 0 {
			tracing::debug!(swept, "expired ACME nonces swept");
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use castellan_core::app::{AppBuilder, NonceCache};
	use castellan_core::config::{CaConfig, Config, DbConfig, KmsConfig};
	use castellan_types::db_adapter::test_double::MemoryDb;
	use castellan_types::kms_adapter::test_double::MemoryKms;
	use std::sync::Arc;

	async fn test_app() -> App {
		AppBuilder {
			config: Config {
				ca: CaConfig { subject_cn: "Test CA".into(), key_uri: "test://root".into() },
				db: DbConfig { path: "/tmp/castellan-test".into() },
				kms: KmsConfig::Softkey { path: "/tmp/castellan-test-keys".into(), passphrase_env: "X".into() },
				acme: Default::default(),
				scep: Default::default(),
				server: Default::default(),
				admin: Default::default(),
			},
			db: Arc::new(MemoryDb::new()),
			kms: Arc::new(MemoryKms::new()),
		}
		.build()
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn issued_nonce_is_consumed_exactly_once() {
		let app = test_app().await;
		let n = issue(&app).await.unwrap();
		consume(&app, &n).await.unwrap();
		let second = consume(&app, &n).await;
		assert!(matches!(second, Err(Error::Acme(AcmeErrorKind::BadNonce, _))));
	}

	#[tokio::test]
	async fn unknown_nonce_is_rejected() {
		let app = test_app().await;
		let err = consume(&app, "never-issued").await;
		assert!(matches!(err, Err(Error::Acme(AcmeErrorKind::BadNonce, _))));
	}

	#[test]
	fn nonce_cache_blocks_replay_before_db_round_trip() {
		let cache = NonceCache::new(8);
		assert!(cache.mark_seen("abc"));
		assert!(!cache.mark_seen("abc"));
	}

	#[tokio::test]
	async fn sweep_removes_only_expired_nonces() {
		let app = test_app().await;
		let fresh = issue(&app).await.unwrap();
		app.db
			.cmp_and_swap(Bucket::AcmeNonces, "stale", None, Some(Timestamp(0).0.to_le_bytes().to_vec()))
			.await
			.unwrap();

		let swept = sweep_expired(&app).await.unwrap();
		assert_eq!(swept, 1);
		assert!(app.db.get(Bucket::AcmeNonces, "stale").await.is_err());
		assert!(app.db.get(Bucket::AcmeNonces, &fresh).await.is_ok());
	}

	#[tokio::test]
	async fn nonce_sweep_task_runs_without_error() {
		let app = test_app().await;
		let task = NonceSweepTask;
		task.run(&app).await.unwrap();
	}
}

// vim: ts=4
