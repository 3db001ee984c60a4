//! The provisioner framework (spec §4.4): a polymorphic collection of
//! identity brokers dispatched as tagged variants rather than a trait
//! object hierarchy per provisioner family (spec §9 "avoid deep
//! inheritance"). `ProvisionerInstance` wraps a decoded
//! `castellan_types::provisioner::ProvisionerKind` and is the only thing
//! the registry and the issuance pipeline hold a reference to.

mod cloud;
mod jwk;
mod nebula;
mod oidc;
mod sshpop;
mod wire;
mod x5c;

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

use castellan_types::db_adapter::{Bucket, DbAdapter};
use castellan_types::model::CertificateRecord;
use castellan_types::prelude::*;
use castellan_types::provisioner::{ProvisionerClaims, ProvisionerKind, ProvisionerOptions, ProvisionerRecord};

/// Maximum clock skew tolerated on `nbf`/`exp` (spec §4.4: "skew tolerance
/// ≤1 minute").
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 60;

/// Evidence a client presents to be authorized. Token-based provisioners
/// (JWK, OIDC, X5C, Nebula, SSH-POP, the cloud instance-identity family)
/// all validate a compact signed token the same way, differing only in how
/// they resolve the verifying key. ACME and SCEP provisioners receive
/// `PreAuthorized` because their own state machines (JWS+account,
/// CMS+challenge password) have already established identity by the time
/// `Authority::sign` is reached.
pub enum ProvisionerProof<'a> {
	CompactToken(&'a str),
	ScepChallenge(&'a str),
	PreAuthorized,
}

/// Bundle returned by a successful `authorize_sign`: template data, policy
/// overrides, lifetime bounds, and the claims a template can read (spec
/// §4.4 "AuthorizeSign... returns a bundle of template data, policy
/// overrides, lifetime bounds, and claims").
#[derive(Debug, Clone)]
pub struct SignOptions {
	pub claims: serde_json::Value,
	pub template_data: serde_json::Map<String, serde_json::Value>,
	pub max_lifetime_secs: i64,
}

#[async_trait]
pub trait Provisioner: Debug + Send + Sync {
	fn id(&self) -> &str;
	fn name(&self) -> &str;
	fn kind_name(&self) -> &'static str;

	async fn authorize_sign(
		&self,
		db: &dyn DbAdapter,
		proof: ProvisionerProof<'_>,
	) -> ClResult<SignOptions>;

	/// Decides whether the bearer of `cert` (still valid) may renew it.
	async fn authorize_renew(&self, cert: &CertificateRecord) -> ClResult<()>;

	async fn authorize_revoke(&self, db: &dyn DbAdapter, proof: ProvisionerProof<'_>) -> ClResult<()>;

	/// Some provisioners distribute a JWE-encrypted private key to their
	/// clients (spec §4.4); `None` for the common case.
	fn get_encrypted_key(&self) -> Option<(Box<str>, Box<[u8]>)> {
		None
	}
}

/// Claims common to every compact-token proof this framework accepts, with
/// provisioner-specific extras preserved in `extra`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TokenClaims {
	pub iss: Box<str>,
	pub aud: Box<str>,
	pub sub: Option<Box<str>>,
	pub nbf: Option<i64>,
	pub exp: i64,
	pub jti: Option<Box<str>>,
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenClaims {
	pub fn check_window(&self) -> ClResult<()> {
		let now = Timestamp::now().0;
		if let Some(nbf) = self.nbf {
			if now + CLOCK_SKEW_TOLERANCE_SECS < nbf {
				return Err(Error::Unauthorized("token not yet valid".into()));
			}
		}
		if now - CLOCK_SKEW_TOLERANCE_SECS > self.exp {
			return Err(Error::Unauthorized("token expired".into()));
		}
		Ok(())
	}

	pub fn check_audience(&self, expected: &str) -> ClResult<()> {
		if self.aud.as_ref() != expected {
			return Err(Error::Unauthorized("audience mismatch".into()));
		}
		Ok(())
	}
}

/// Single-use check for a token's `jti`, persisted with TTL equal to the
/// token's remaining lifetime (spec §4.4). Shared by every token-based
/// provisioner so the dedup key scheme (`provisioner_id/jti`) stays
/// consistent across implementations.
pub async fn consume_jti_once(
	db: &dyn DbAdapter,
	provisioner_id: &str,
	jti: &str,
	expires_at: Timestamp,
) -> ClResult<()> {
	let key = format!("{provisioner_id}/{jti}");
	let value = expires_at.0.to_le_bytes().to_vec();
	db.cmp_and_swap(Bucket::AcmeNonces, &key, None, Some(value)).await.map_err(|err| match err {
		Error::Conflict(_) => Error::Unauthorized("token replay (jti already used)".into()),
		other => other,
	})
}

/// Wraps a decoded `ProvisionerKind` and the shared record fields every
/// kind carries (claims, options, id, name). Dispatch is a single match on
/// the tag, not a trait-object-per-variant hierarchy.
#[derive(Debug)]
pub struct ProvisionerInstance {
	pub record: ProvisionerRecord,
}

impl ProvisionerInstance {
	pub fn new(record: ProvisionerRecord) -> Self {
		Self { record }
	}

	pub fn claims(&self) -> &ProvisionerClaims {
		&self.record.claims
	}

	pub fn options(&self) -> &ProvisionerOptions {
		&self.record.options
	}

	fn audience_url(&self) -> &str {
		// The CA's own issuer URL, used as the expected `aud` for every
		// token-based provisioner; threaded in via provisioner options
		// rather than guessed from the request, so a provisioner behind a
		// reverse proxy with a different external name still validates.
		self.record.options.template_data.get("audience").and_then(|v| v.as_str()).unwrap_or("castellan")
	}
}

#[async_trait]
impl Provisioner for ProvisionerInstance {
	fn id(&self) -> &str {
		&self.record.id
	}

	fn name(&self) -> &str {
		&self.record.name
	}

	fn kind_name(&self) -> &'static str {
		self.record.kind.type_name()
	}

	async fn authorize_sign(
		&self,
		db: &dyn DbAdapter,
		proof: ProvisionerProof<'_>,
	) -> ClResult<SignOptions> {
		if self.record.claims.disable_issuance {
			return Err(Error::Forbidden("provisioner has issuance disabled".into()));
		}

		let claims_value = match (&self.record.kind, &proof) {
			(ProvisionerKind::Jwk(cfg), ProvisionerProof::CompactToken(token)) => {
				jwk::verify(cfg, token, self.audience_url())?
			}
			(ProvisionerKind::Oidc(cfg), ProvisionerProof::CompactToken(token)) => {
				oidc::verify(cfg, token, self.audience_url()).await?
			}
			(ProvisionerKind::X5c(cfg), ProvisionerProof::CompactToken(token)) => {
				x5c::verify(cfg, token, self.audience_url())?
			}
			(ProvisionerKind::Nebula(cfg), ProvisionerProof::CompactToken(token)) => {
				nebula::verify(cfg, token, self.audience_url())?
			}
			(ProvisionerKind::SshPop(cfg), ProvisionerProof::CompactToken(token)) => {
				sshpop::verify(cfg, token, self.audience_url())?
			}
			(ProvisionerKind::CloudInstanceIdentity(cfg), ProvisionerProof::CompactToken(token)) => {
				cloud::verify(cfg, token, self.audience_url()).await?
			}
			(ProvisionerKind::Wire(cfg), ProvisionerProof::CompactToken(token)) => {
				wire::verify(cfg, token, self.audience_url()).await?
			}
			(ProvisionerKind::Acme(_), ProvisionerProof::PreAuthorized) => serde_json::json!({}),
			(ProvisionerKind::Scep(cfg), ProvisionerProof::ScepChallenge(password)) => {
				if password != &cfg.challenge_password.as_ref() {
					return Err(Error::Unauthorized("SCEP challenge password mismatch".into()));
				}
				serde_json::json!({})
			}
			_ => return Err(Error::bad_request("proof type does not match provisioner kind")),
		};

		if let Some(jti) =
			claims_value.get("jti").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
		{
			let exp = claims_value
				.get("exp")
				.and_then(|v| v.as_i64())
				.map(Timestamp)
				.unwrap_or_else(|| Timestamp::from_now(self.record.claims.default_lifetime_secs));
			consume_jti_once(db, &self.record.id, jti, exp).await?;
		}

		Ok(SignOptions {
			claims: claims_value,
			template_data: self.record.options.template_data.clone(),
			max_lifetime_secs: self.record.claims.max_lifetime_secs,
		})
	}

	async fn authorize_renew(&self, _cert: &CertificateRecord) -> ClResult<()> {
		if !self.record.claims.allow_renewal {
			return Err(Error::Forbidden("provisioner does not permit renewal".into()));
		}
		Ok(())
	}

	async fn authorize_revoke(
		&self,
		db: &dyn DbAdapter,
		proof: ProvisionerProof<'_>,
	) -> ClResult<()> {
		self.authorize_sign(db, proof).await.map(|_| ())
	}
}

/// Default per-request HTTP client timeout for provisioners that reach out
/// to an external JWKS/discovery endpoint (OIDC, the cloud platforms).
pub fn http_client(timeout: Duration) -> ClResult<reqwest::Client> {
	reqwest::Client::builder()
		.timeout(timeout)
		.build()
		.map_err(|e| Error::Internal(format!("http client build failed: {e}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use castellan_types::db_adapter::test_double::MemoryDb;

	#[tokio::test]
	async fn jti_is_consumed_at_most_once() {
		let db = MemoryDb::new();
		let exp = Timestamp::from_now(60);
		consume_jti_once(&db, "p1", "abc", exp).await.unwrap();
		let second = consume_jti_once(&db, "p1", "abc", exp).await;
		assert!(matches!(second, Err(Error::Unauthorized(_))));
	}

	#[tokio::test]
	async fn disabled_provisioner_rejects_signing() {
		let mut record = sample_record();
		record.claims.disable_issuance = true;
		let provisioner = ProvisionerInstance::new(record);
		let db = MemoryDb::new();
		let err = provisioner.authorize_sign(&db, ProvisionerProof::PreAuthorized).await;
		assert!(matches!(err, Err(Error::Forbidden(_))));
	}

	fn sample_record() -> ProvisionerRecord {
		ProvisionerRecord {
			id: "p1".into(),
			name: "test".into(),
			kind: ProvisionerKind::Acme(castellan_types::provisioner::AcmeProvisionerConfig {
				device_attest_roots_pem: Default::default(),
			}),
			claims: ProvisionerClaims::default(),
			options: ProvisionerOptions::default(),
			config_version: 1,
			created_at: Timestamp::now(),
		}
	}
}

// vim: ts=4
