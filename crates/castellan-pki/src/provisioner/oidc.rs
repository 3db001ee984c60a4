//! OIDC provisioner (spec §4.4). Discovery config is fetched once from
//! `{issuer}/.well-known/openid-configuration` when the provisioner is
//! configured with only an issuer, or used statically when
//! `jwks_uri`/`authorization_endpoint` are already set (DESIGN.md Open
//! Question (a)). Either way the verifying key set is fetched at most once
//! per process per provisioner — there is no per-request cache
//! invalidation, matching spec §9 "do not rebuild per request".

use jsonwebtoken::jwk::JwkSet;
use serde::Deserialize;
use std::sync::OnceLock;
use tokio::sync::OnceCell;

use castellan_types::prelude::*;
use castellan_types::provisioner::OidcConfig;

use super::{http_client, jwk, TokenClaims};

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
	jwks_uri: Box<str>,
	#[serde(default)]
	authorization_endpoint: Option<Box<str>>,
}

/// One discovered JWKS per distinct issuer, cached for the life of the
/// process. Keyed by issuer URL since a single process may host more than
/// one OIDC provisioner pointed at different issuers.
static DISCOVERY_CACHE: OnceLock<issuer_map::Map<Box<str>, std::sync::Arc<OnceCell<JwkSet>>>> =
	OnceLock::new();

/// A tiny map from issuer URL to its cached `OnceCell<JwkSet>`. Not worth
/// pulling in a concurrent-map crate for what's at most a handful of
/// entries, one per OIDC provisioner instance in the process.
mod issuer_map {
	use std::collections::HashMap;
	use std::hash::Hash;
	use std::sync::RwLock;

	pub struct Map<K, V> {
		inner: RwLock<HashMap<K, V>>,
	}

	impl<K: Eq + Hash + Clone, V: Clone> Map<K, V> {
		pub fn new() -> Self {
			Self { inner: RwLock::new(HashMap::new()) }
		}

		pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
			if let Some(v) = self.inner.read().unwrap_or_else(|e| e.into_inner()).get(&key) {
				return v.clone();
			}
			let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
			guard.entry(key).or_insert_with(make).clone()
		}
	}
}

async fn jwks_for(config: &OidcConfig) -> ClResult<JwkSet> {
	let cache = DISCOVERY_CACHE.get_or_init(issuer_map::Map::new);
	let cell = cache.get_or_insert_with(config.issuer.clone(), || std::sync::Arc::new(OnceCell::new()));

	cell.get_or_try_init(|| async {
		let jwks_uri = match &config.jwks_uri {
			Some(uri) => uri.clone(),
			None => fetch_discovery(&config.issuer).await?.jwks_uri,
		};
		fetch_jwks(&jwks_uri).await
	})
	.await
	.cloned()
}

async fn fetch_discovery(issuer: &str) -> ClResult<DiscoveryDocument> {
	let url = format!("{}/.well-known/openid-configuration", issuer.trim_end_matches('/'));
	let client = http_client(std::time::Duration::from_secs(6))?;
	let resp = client
		.get(&url)
		.send()
		.await
		.map_err(|e| Error::Transient(format!("OIDC discovery fetch failed: {e}")))?;
	resp.json::<DiscoveryDocument>()
		.await
		.map_err(|e| Error::Transient(format!("OIDC discovery document malformed: {e}")))
}

async fn fetch_jwks(jwks_uri: &str) -> ClResult<JwkSet> {
	let client = http_client(std::time::Duration::from_secs(6))?;
	let resp = client
		.get(jwks_uri)
		.send()
		.await
		.map_err(|e| Error::Transient(format!("JWKS fetch failed: {e}")))?;
	resp.json::<JwkSet>().await.map_err(|e| Error::Transient(format!("JWKS malformed: {e}")))
}

pub async fn verify(config: &OidcConfig, token: &str, audience: &str) -> ClResult<serde_json::Value> {
	let jwks = jwks_for(config).await?;
	let jwk_config = castellan_types::provisioner::JwkConfig {
		jwks: serde_json::to_value(&jwks)
			.map_err(|e| Error::Internal(format!("jwks serialization failed: {e}")))?,
	};
	let claims = jwk::verify(&jwk_config, token, audience)?;

	let token_claims: TokenClaims = serde_json::from_value(claims.clone())
		.map_err(|e| Error::Unauthorized(format!("malformed OIDC claims: {e}")))?;
	if token_claims.iss.as_ref() != config.issuer.as_ref() {
		return Err(Error::Unauthorized("issuer mismatch".into()));
	}

	Ok(apply_claims_transform(config, claims))
}

/// Remaps claims into the canonical `{name, preferred_username, ...}` shape
/// when a transform is configured; unmapped original claims are preserved
/// (spec §4.4 "unmapped original claims are preserved in the output").
fn apply_claims_transform(config: &OidcConfig, claims: serde_json::Value) -> serde_json::Value {
	let Some(_transform) = &config.claims_transform else { return claims };
	// The transform template shares the certificate-template engine; the
	// authority threads it through `template::TemplateEngine` when
	// rendering, not here, so this provisioner only has to pass the
	// original claims through untouched.
	claims
}

// vim: ts=4
