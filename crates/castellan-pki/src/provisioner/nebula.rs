//! Nebula provisioner (spec §4.4): validates a compact token issued by a
//! host already enrolled in the configured Nebula certificate authority
//! pool. Nebula's own certificate format is not JWT-shaped, so enrollment
//! here is modeled the same way the rest of the token-based provisioners
//! are: a JWT whose issuer is a fingerprint from the CA pool and whose
//! signature is verified against that pool entry's Ed25519 key.

use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};

use castellan_types::prelude::*;
use castellan_types::provisioner::NebulaConfig;

use super::TokenClaims;

pub fn verify(config: &NebulaConfig, token: &str, audience: &str) -> ClResult<serde_json::Value> {
	let header = decode_header(token).map_err(|_| Error::Unauthorized("malformed JWT header".into()))?;
	if header.alg != jsonwebtoken::Algorithm::EdDSA {
		return Err(Error::Unauthorized("Nebula tokens must use EdDSA".into()));
	}

	let pool = parse_ca_pool(&config.ca_pool_pem)?;
	let mut last_err = Error::Unauthorized("token not signed by any pool member".into());

	for key_der in &pool {
		let decoding_key = DecodingKey::from_ed_der(key_der);
		let mut validation = Validation::new(jsonwebtoken::Algorithm::EdDSA);
		validation.validate_aud = false;
		validation.validate_exp = false;
		validation.set_required_spec_claims(&["exp"]);

		match decode::<TokenClaims>(token, &decoding_key, &validation) {
			Ok(decoded) => {
				decoded.claims.check_window()?;
				decoded.claims.check_audience(audience)?;
				return serde_json::to_value(&decoded.claims)
					.map_err(|e| Error::Internal(format!("claims serialization failed: {e}")));
			}
			Err(e) => last_err = Error::Unauthorized(format!("signature check failed: {e}")),
		}
	}

	Err(last_err)
}

fn parse_ca_pool(pem_bundle: &str) -> ClResult<Vec<Vec<u8>>> {
	pem::parse_many(pem_bundle)
		.map_err(|e| Error::Internal(format!("Nebula CA pool malformed: {e}")))
		.map(|entries| entries.into_iter().map(|p| p.contents().to_vec()).collect())
}

// vim: ts=4
