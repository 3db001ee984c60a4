//! Provisioner configuration data model (spec §3, §4.4). This module holds
//! only the *shape* of a provisioner's configuration and claims; the trait
//! that dispatches authorization against that configuration, and the nine
//! concrete implementations, live in `castellan-pki::provisioner` — this
//! crate only needs to be able to deserialize, store, and version a
//! provisioner's config, not run one.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::kms_adapter::KeyAlgorithm;
use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CloudPlatform {
	Aws,
	Gcp,
	Azure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireAuthMode {
	Oidc,
	Dpop,
}

/// Per-provisioner claims: lifetime bounds, renewal policy, and the key
/// types a CSR under this provisioner is allowed to present (spec §3
/// Provisioner, §4.7 step 4).
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerClaims {
	pub default_lifetime_secs: i64,
	pub max_lifetime_secs: i64,
	pub allow_renewal: bool,
	pub disable_issuance: bool,
	pub allowed_key_algorithms: Vec<KeyAlgorithm>,
}

impl Default for ProvisionerClaims {
	fn default() -> Self {
		Self {
			default_lifetime_secs: 24 * 3600,
			max_lifetime_secs: 90 * 24 * 3600,
			allow_renewal: true,
			disable_issuance: false,
			allowed_key_algorithms: vec![
				KeyAlgorithm::Ed25519,
				KeyAlgorithm::EcdsaP256,
				KeyAlgorithm::EcdsaP384,
			],
		}
	}
}

/// Allow/deny list pairing evaluated per identifier kind (spec §4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRule {
	pub allow: Vec<Box<str>>,
	pub deny: Vec<Box<str>>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
	pub dns: PolicyRule,
	pub ip: PolicyRule,
	pub email: PolicyRule,
	pub uri: PolicyRule,
	pub principal: PolicyRule,
}

/// Provisioner options: template selection, template data, and the policy
/// under which its issuance is evaluated (spec §3 Provisioner "options").
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionerOptions {
	pub template_name: Option<Box<str>>,
	pub template_data: serde_json::Map<String, serde_json::Value>,
	pub policy: PolicyConfig,
	pub require_eab: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkConfig {
	/// JWK Set, as raw JSON (RFC 7517) — parsed lazily by the implementation.
	pub jwks: serde_json::Value,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
	pub issuer: Box<str>,
	/// When set, these are used verbatim instead of discovery. Populated
	/// automatically after a successful discovery fetch so the lazy
	/// verifier never refetches (see DESIGN.md Open Question (a)).
	pub authorization_endpoint: Option<Box<str>>,
	pub jwks_uri: Option<Box<str>>,
	pub audience: Box<str>,
	/// Optional claim-remapping template, evaluated with the same
	/// templating engine as certificate templates (spec §4.4 "transform").
	pub claims_transform: Option<Box<str>>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X5cConfig {
	pub roots_pem: Box<str>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInstanceIdentityConfig {
	pub platform: CloudPlatform,
	pub account_allowlist: Vec<Box<str>>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScepConfig {
	pub challenge_password: Box<str>,
	pub extra_ca_pem: Option<Box<str>>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NebulaConfig {
	pub ca_pool_pem: Box<str>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshPopConfig {
	pub ca_public_keys: Vec<Box<str>>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireConfig {
	pub auth_mode: WireAuthMode,
	pub oidc: OidcConfig,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeProvisionerConfig {
	/// Device-attestation vendor trust anchors (spec §9 Open Question (b)),
	/// PEM-encoded roots keyed by vendor name ("apple", "google", "yubico").
	pub device_attest_roots_pem: std::collections::BTreeMap<Box<str>, Box<str>>,
}

/// The nine provisioner kinds from spec §4.4, collapsed per SPEC_FULL §7
/// into tagged variants rather than one struct per cloud platform or Wire
/// auth mode (spec §9: "tagged variants... avoid deep inheritance").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProvisionerKind {
	Jwk(JwkConfig),
	Oidc(OidcConfig),
	Acme(AcmeProvisionerConfig),
	Scep(ScepConfig),
	X5c(X5cConfig),
	CloudInstanceIdentity(CloudInstanceIdentityConfig),
	Nebula(NebulaConfig),
	SshPop(SshPopConfig),
	Wire(WireConfig),
}

impl ProvisionerKind {
	pub fn type_name(&self) -> &'static str {
		match self {
			Self::Jwk(_) => "jwk",
			Self::Oidc(_) => "oidc",
			Self::Acme(_) => "acme",
			Self::Scep(_) => "scep",
			Self::X5c(_) => "x5c",
			Self::CloudInstanceIdentity(_) => "cloudInstanceIdentity",
			Self::Nebula(_) => "nebula",
			Self::SshPop(_) => "sshpop",
			Self::Wire(_) => "wire",
		}
	}
}

/// Full provisioner record as stored in the `provisioners` bucket (spec §3).
/// `config_version` is bumped on every admin mutation so the registry can
/// tell a stale cached snapshot from a current one without comparing the
/// whole struct.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerRecord {
	pub id: Box<str>,
	pub name: Box<str>,
	pub kind: ProvisionerKind,
	pub claims: ProvisionerClaims,
	pub options: ProvisionerOptions,
	pub config_version: u64,
	pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn provisioner_kind_round_trips_json_with_tag() {
		let kind = ProvisionerKind::Wire(WireConfig {
			auth_mode: WireAuthMode::Dpop,
			oidc: OidcConfig {
				issuer: "https://wire.example".into(),
				authorization_endpoint: None,
				jwks_uri: None,
				audience: "castellan".into(),
				claims_transform: None,
			},
		});
		let json = serde_json::to_string(&kind).unwrap();
		assert!(json.contains("\"type\":\"wire\""));
		let back: ProvisionerKind = serde_json::from_str(&json).unwrap();
		assert_eq!(back.type_name(), "wire");
	}

	#[test]
	fn default_claims_permit_issuance() {
		let claims = ProvisionerClaims::default();
		assert!(!claims.disable_issuance);
		assert!(claims.allow_renewal);
	}
}

// vim: ts=4
