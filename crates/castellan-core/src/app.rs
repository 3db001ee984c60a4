//! Shared application state (spec §5): one `AppState` per process, held
//! behind `Arc` and cloned into every axum handler and scheduled task —
//! the teacher's exact `App = Arc<AppState>` pattern.

use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;

use castellan_pki::authority::Authority;
use castellan_pki::registry::ProvisionerRegistry;
use castellan_types::db_adapter::DbAdapter;
use castellan_types::kms_adapter::{KeyUri, KmsAdapter};
use castellan_types::prelude::*;

use crate::config::Config;
use crate::scheduler::Scheduler;

/// Small in-memory presence cache fronting the durable nonce/jti store
/// (spec §5 "a small LRU fronts it to absorb bursts"). Holds no secret
/// material, only opaque identifiers already written to the DB.
pub struct NonceCache {
	seen: Mutex<lru::LruCache<Box<str>, ()>>,
}

impl std::fmt::Debug for NonceCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NonceCache").finish()
	}
}

impl NonceCache {
	pub fn new(capacity: usize) -> Self {
		const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1024) {
			Some(v) => v,
			None => unreachable!(),
		};
		let capacity = NonZeroUsize::new(capacity).unwrap_or(DEFAULT_CAPACITY);
		Self { seen: Mutex::new(lru::LruCache::new(capacity)) }
	}

	/// Records a nonce as seen, returning `false` if it was already present
	/// (a likely-but-not-certain replay — the durable CAS in
	/// `castellan_pki::provisioner::consume_jti_once` is the actual source
	/// of truth; this cache only short-circuits the common case cheaply).
	pub fn mark_seen(&self, nonce: &str) -> bool {
		let mut seen = self.seen.lock();
		if seen.contains(nonce) {
			return false;
		}
		seen.put(nonce.into(), ());
		true
	}
}

#[derive(Debug)]
pub struct AppState {
	pub config: Config,
	pub db: Arc<dyn DbAdapter>,
	pub kms: Arc<dyn KmsAdapter>,
	pub registry: Arc<ProvisionerRegistry>,
	pub authority: Arc<Authority>,
	pub ca_cert_der: Vec<u8>,
	pub ca_key_uri: KeyUri,
	pub nonce_cache: NonceCache,
	pub scheduler: Arc<Scheduler<App>>,
}

/// The teacher's `App = Arc<AppState>` alias: every handler and scheduled
/// task is generic over this, never `AppState` directly, so cloning it is
/// always an `Arc` bump.
pub type App = Arc<AppState>;

pub struct AppBuilder {
	pub config: Config,
	pub db: Arc<dyn DbAdapter>,
	pub kms: Arc<dyn KmsAdapter>,
}

impl AppBuilder {
	/// Builds the `App`, loads the provisioner registry from storage, and
	/// starts the background scheduler. Does not register the cron tasks
	/// themselves — `server::main` does that after constructing the app,
	/// since `castellan_acme::nonce::NonceSweepTask` lives in a crate this
	/// one doesn't depend on.
	pub async fn build(self) -> ClResult<App> {
		let registry = Arc::new(ProvisionerRegistry::new());
		registry.reload(self.db.as_ref()).await?;

		let ca_key_uri = KeyUri(self.config.ca.key_uri.clone());
		let ca_serial = Serial::random();
		let authority = Arc::new(Authority::new(
			Arc::clone(&self.db),
			Arc::clone(&self.kms),
			Arc::clone(&registry),
			&self.config.ca.subject_cn,
			ca_key_uri.clone(),
			ca_serial,
		)?);

		let ca_cert_der = pem::parse(self.config.ca.cert_pem.as_ref())
			.map_err(|e| Error::Internal(format!("CA certificate is not valid PEM: {e}")))?
			.contents()
			.to_vec();

		let scheduler = Scheduler::<App>::new();

		Ok(Arc::new(AppState {
			config: self.config,
			db: self.db,
			kms: self.kms,
			registry,
			authority,
			ca_cert_der,
			ca_key_uri,
			nonce_cache: NonceCache::new(4096),
			scheduler,
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn nonce_cache_reports_replay_on_second_mark() {
		let cache = NonceCache::new(8);
		assert!(cache.mark_seen("abc"));
		assert!(!cache.mark_seen("abc"));
		assert!(cache.mark_seen("def"));
	}
}

// vim: ts=4
