//! Cloud instance-identity provisioner (spec §4.4): AWS, GCP, and Azure
//! instance-identity documents collapsed into one variant (SPEC_FULL §7),
//! since all three reduce to "fetch the platform's signing material, then
//! verify a signed document" with only the claim names differing.

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};

use castellan_types::prelude::*;
use castellan_types::provisioner::{CloudInstanceIdentityConfig, CloudPlatform};

use super::{http_client, TokenClaims};

fn platform_jwks_uri(platform: CloudPlatform) -> &'static str {
	match platform {
		CloudPlatform::Aws => "https://sts.amazonaws.com/.well-known/jwks.json",
		CloudPlatform::Gcp => "https://www.googleapis.com/oauth2/v3/certs",
		CloudPlatform::Azure => "https://login.microsoftonline.com/common/discovery/v2.0/keys",
	}
}

fn account_claim_name(platform: CloudPlatform) -> &'static str {
	match platform {
		CloudPlatform::Aws => "account",
		CloudPlatform::Gcp => "project_id",
		CloudPlatform::Azure => "tid",
	}
}

pub async fn verify(
	config: &CloudInstanceIdentityConfig,
	token: &str,
	audience: &str,
) -> ClResult<serde_json::Value> {
	let client = http_client(std::time::Duration::from_secs(6))?;
	let jwks: JwkSet = client
		.get(platform_jwks_uri(config.platform))
		.send()
		.await
		.map_err(|e| Error::Transient(format!("cloud signing cert fetch failed: {e}")))?
		.json()
		.await
		.map_err(|e| Error::Transient(format!("cloud signing cert malformed: {e}")))?;

	let header = decode_header(token).map_err(|_| Error::Unauthorized("malformed JWT header".into()))?;
	let kid = header.kid.ok_or_else(|| Error::Unauthorized("instance-identity token missing kid".into()))?;
	let jwk = jwks.find(&kid).ok_or_else(|| Error::Unauthorized("unknown cloud signing key".into()))?;

	let decoding_key = match &jwk.algorithm {
		jsonwebtoken::jwk::AlgorithmParameters::RSA(rsa) => {
			DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
				.map_err(|e| Error::Unauthorized(format!("invalid cloud signing key: {e}")))?
		}
		jsonwebtoken::jwk::AlgorithmParameters::EllipticCurve(ec) => {
			DecodingKey::from_ec_components(&ec.x, &ec.y)
				.map_err(|e| Error::Unauthorized(format!("invalid cloud signing key: {e}")))?
		}
		_ => return Err(Error::Unauthorized("unsupported cloud signing key type".into())),
	};

	let mut validation = Validation::new(header.alg);
	validation.validate_aud = false;
	validation.validate_exp = false;
	validation.set_required_spec_claims(&["exp"]);

	let decoded = decode::<TokenClaims>(token, &decoding_key, &validation)
		.map_err(|_| Error::Unauthorized("instance-identity signature verification failed".into()))?;
	decoded.claims.check_window()?;
	decoded.claims.check_audience(audience)?;

	let claim_name = account_claim_name(config.platform);
	let account = decoded.claims.extra.get(claim_name).and_then(|v| v.as_str()).ok_or_else(|| {
		Error::Unauthorized(format!("instance-identity token missing {claim_name}"))
	})?;
	if !config.account_allowlist.is_empty()
		&& !config.account_allowlist.iter().any(|a| a.as_ref() == account)
	{
		return Err(Error::Forbidden(format!("account {account} is not allow-listed")));
	}

	serde_json::to_value(&decoded.claims)
		.map_err(|e| Error::Internal(format!("claims serialization failed: {e}")))
}

// vim: ts=4
