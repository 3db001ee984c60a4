//! Startup configuration (SPEC_FULL §3 "Configuration"): a typed `Config`
//! loaded once from a TOML file path given on the CLI surface (spec §6),
//! never read ambiently — the CA is single-tenant, so there is exactly one
//! `Config` per process and it is threaded explicitly into `AppState`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use castellan_types::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbConfig {
	/// Directory the `sled` adapter opens as its data store.
	pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "camelCase")]
pub enum KmsConfig {
	/// In-process software keys, wrapped at rest with a passphrase-derived
	/// key (spec §4.1 "Argon2id-derived key... before being written to the
	/// KV store").
	Softkey { path: PathBuf, passphrase_env: Box<str> },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeConfig {
	pub enabled: bool,
	/// External base URL used to build resource locations (spec §6 "Link"
	/// headers, directory URLs).
	pub external_url: Option<Box<str>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScepConfig {
	pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
	/// Environment variable holding the bearer token `/admin/*` requests
	/// must present (spec §6 "administrative REST endpoints"); read at
	/// request time, same pattern as `KmsConfig::Softkey::passphrase_env`.
	pub token_env: Box<str>,
}

impl Default for AdminConfig {
	fn default() -> Self {
		Self { token_env: "CASTELLAN_ADMIN_TOKEN".into() }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
	pub listen_addr: Box<str>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self { listen_addr: "0.0.0.0:8443".into() }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaConfig {
	pub subject_cn: Box<str>,
	/// Key URI of the already-provisioned signing key (spec §4.1); the CA
	/// does not generate its own root key at startup.
	pub key_uri: Box<str>,
	/// PEM-encoded CA certificate matching `key_uri`, provisioned out of
	/// band (spec §13 Non-goal: offline/root CA ceremonies are not this
	/// crate's concern). Served verbatim by SCEP's `GetCACert` and attached
	/// to every `PKIOperation` response's `SignedData.certificates`.
	pub cert_pem: Box<str>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	pub ca: CaConfig,
	pub db: DbConfig,
	pub kms: KmsConfig,
	#[serde(default)]
	pub acme: AcmeConfig,
	#[serde(default)]
	pub scep: ScepConfig,
	#[serde(default)]
	pub server: ServerConfig,
	#[serde(default)]
	pub admin: AdminConfig,
}

impl Config {
	pub fn load(path: &Path) -> ClResult<Self> {
		let raw = std::fs::read_to_string(path)
			.map_err(|e| Error::Internal(format!("could not read config {}: {e}", path.display())))?;
		toml::from_str(&raw)
			.map_err(|e| Error::Internal(format!("config {} is malformed: {e}", path.display())))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_a_minimal_config() {
		let toml = r#"
			[ca]
			subjectCn = "Castellan Test Root"
			keyUri = "softkey://root"
			certPem = "-----BEGIN CERTIFICATE-----\nMA==\n-----END CERTIFICATE-----\n"

			[db]
			path = "/var/lib/castellan/db"

			[kms]
			backend = "softkey"
			path = "/var/lib/castellan/keys"
			passphraseEnv = "CASTELLAN_KMS_PASSPHRASE"
		"#;
		let config: Config = toml::from_str(toml).unwrap();
		assert_eq!(config.ca.subject_cn.as_ref(), "Castellan Test Root");
		assert!(!config.acme.enabled);
		assert_eq!(config.server.listen_addr.as_ref(), "0.0.0.0:8443");
	}
}

// vim: ts=4
