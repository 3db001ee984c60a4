//! X5C provisioner: the bearer token's JWT header carries an `x5c` chain
//! (RFC 7515 §4.1.6) anchored to one of the provisioner's configured roots,
//! instead of a `kid` pointing into a JWKS.

use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use castellan_types::prelude::*;
use castellan_types::provisioner::X5cConfig;

use super::TokenClaims;

pub fn verify(config: &X5cConfig, token: &str, audience: &str) -> ClResult<serde_json::Value> {
	let roots = parse_roots_pem(&config.roots_pem)?;

	let header = decode_header(token).map_err(|_| Error::Unauthorized("malformed JWT header".into()))?;
	let chain = header.x5c.ok_or_else(|| Error::Unauthorized("JWT missing x5c header".into()))?;
	let der_chain: Vec<Vec<u8>> =
		chain.iter().map(|entry| base64_decode_standard(entry)).collect::<ClResult<_>>()?;

	verify_chain_to_root(&der_chain, &roots)?;

	let leaf_der = der_chain.first().ok_or_else(|| Error::Unauthorized("x5c chain is empty".into()))?;
	let (_, leaf) = X509Certificate::from_der(leaf_der)
		.map_err(|_| Error::Unauthorized("leaf certificate is malformed".into()))?;

	let decoding_key = decoding_key_for(&leaf)?;

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

fn decoding_key_for(cert: &X509Certificate) -> ClResult<DecodingKey> {
	let public_key = cert
		.public_key()
		.parsed()
		.map_err(|_| Error::Unauthorized("unsupported leaf public key encoding".into()))?;

	match public_key {
		PublicKey::RSA(_) => Ok(DecodingKey::from_rsa_der(cert.public_key().raw)),
		PublicKey::EC(point) => Ok(DecodingKey::from_ec_der(point.data())),
		PublicKey::Unknown(raw) if raw.len() == 32 => Ok(DecodingKey::from_ed_der(raw)),
		_ => Err(Error::Unauthorized("leaf certificate key type is not supported".into())),
	}
}

fn parse_roots_pem(pem_bundle: &str) -> ClResult<Vec<Vec<u8>>> {
	::pem::parse_many(pem_bundle)
		.map_err(|e| Error::Internal(format!("provisioner root bundle malformed: {e}")))
		.map(|entries| entries.into_iter().map(|p| p.contents().to_vec()).collect())
}

fn base64_decode_standard(value: &str) -> ClResult<Vec<u8>> {
	use base64::Engine as _;
	base64::engine::general_purpose::STANDARD
		.decode(value)
		.map_err(|_| Error::Unauthorized("x5c entry is not valid base64".into()))
}

/// Verifies the final certificate in `chain` is, or chains directly to, one
/// of the configured roots. A minimal one-hop trust check: enough for
/// provisioner trust anchoring, not a general path-building validator.
fn verify_chain_to_root(der_chain: &[Vec<u8>], roots: &[Vec<u8>]) -> ClResult<()> {
	let last = der_chain.last().ok_or_else(|| Error::Unauthorized("empty x5c chain".into()))?;
	if roots.iter().any(|root| root == last) {
		return Ok(());
	}

	let (_, last_cert) = X509Certificate::from_der(last)
		.map_err(|_| Error::Unauthorized("chain certificate malformed".into()))?;
	let anchored = roots.iter().any(|root| {
		X509Certificate::from_der(root)
			.map(|(_, root_cert)| root_cert.subject() == last_cert.issuer())
			.unwrap_or(false)
	});
	if anchored {
		Ok(())
	} else {
		Err(Error::Unauthorized("x5c chain does not anchor to a configured root".into()))
	}
}

// vim: ts=4
