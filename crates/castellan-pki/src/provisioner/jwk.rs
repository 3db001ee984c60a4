//! JWK provisioner: verifies a compact JWT against a statically configured
//! JSON Web Key Set (spec §4.4 "JWK public keys").

use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};

use castellan_types::prelude::*;
use castellan_types::provisioner::JwkConfig;

use super::TokenClaims;

pub fn verify(config: &JwkConfig, token: &str, audience: &str) -> ClResult<serde_json::Value> {
	let jwks: JwkSet = serde_json::from_value(config.jwks.clone())
		.map_err(|e| Error::Internal(format!("provisioner JWKS is malformed: {e}")))?;

	let header = decode_header(token)
		.map_err(|_| Error::Unauthorized("malformed JWT header".into()))?;
	let kid = header.kid.ok_or_else(|| Error::Unauthorized("JWT missing kid".into()))?;
	let jwk = jwks.find(&kid).ok_or_else(|| Error::Unauthorized("unknown signing key".into()))?;

	let decoding_key = match &jwk.algorithm {
		AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
			.map_err(|e| Error::Unauthorized(format!("invalid RSA JWK: {e}")))?,
		AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y)
			.map_err(|e| Error::Unauthorized(format!("invalid EC JWK: {e}")))?,
		AlgorithmParameters::OctetKeyPair(okp) => {
			DecodingKey::from_ed_components(&okp.x)
				.map_err(|e| Error::Unauthorized(format!("invalid OKP JWK: {e}")))?
		}
		_ => return Err(Error::Unauthorized("unsupported JWK key type".into())),
	};

	let mut validation = Validation::new(header.alg);
	validation.validate_aud = false;
	validation.validate_exp = false;
	validation.set_required_spec_claims(&["exp"]);

	let decoded = decode::<TokenClaims>(token, &decoding_key, &validation)
		.map_err(|_| Error::Unauthorized("JWT signature verification failed".into()))?;

	decoded.claims.check_window()?;
	decoded.claims.check_audience(audience)?;

	serde_json::to_value(&decoded.claims)
		.map_err(|e| Error::Internal(format!("claims serialization failed: {e}")))
}

#[allow(dead_code)]
fn supported_algorithm(alg: Algorithm) -> bool {
	matches!(
		alg,
		Algorithm::RS256
			| Algorithm::RS384
			| Algorithm::RS512
			| Algorithm::ES256
			| Algorithm::ES384
			| Algorithm::EdDSA
	)
}

// vim: ts=4
