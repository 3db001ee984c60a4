//! Flattened JWS parsing and verification (spec §4.5 "JWS binding") and RFC
//! 7638 JWK thumbprints. ACME's wire format is always the flattened JSON
//! serialization (RFC 7515 §7.2.2) with a base64url `protected` header, a
//! base64url `payload` (empty string for POST-as-GET), and a base64url
//! `signature` — never the general or compact serializations.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use ed25519_dalek::Verifier as _;
use p256::ecdsa::signature::Verifier as _;
use serde::{Deserialize, Serialize};

use castellan_types::prelude::*;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlattenedJws {
	pub protected: String,
	pub payload: String,
	pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedHeader {
	pub alg: String,
	pub nonce: String,
	pub url: String,
	#[serde(default)]
	pub jwk: Option<serde_json::Value>,
	#[serde(default)]
	pub kid: Option<String>,
}

impl FlattenedJws {
	pub fn parse(body: &[u8]) -> ClResult<Self> {
		serde_json::from_slice(body)
			.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "request body is not a flattened JWS"))
	}

	pub fn protected_header(&self) -> ClResult<ProtectedHeader> {
		let bytes = B64
			.decode(&self.protected)
			.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "protected header is not valid base64url"))?;
		serde_json::from_slice(&bytes)
			.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "protected header is not valid JSON"))
	}

	/// The JSON payload, or `serde_json::Value::Null` for an empty
	/// POST-as-GET payload (RFC 8555 §6.3).
	pub fn payload_json(&self) -> ClResult<serde_json::Value> {
		if self.payload.is_empty() {
			return Ok(serde_json::Value::Null);
		}
		let bytes = B64
			.decode(&self.payload)
			.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "payload is not valid base64url"))?;
		serde_json::from_slice(&bytes)
			.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "payload is not valid JSON"))
	}

	fn signing_input(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(self.protected.len() + self.payload.len() + 1);
		buf.extend_from_slice(self.protected.as_bytes());
		buf.push(b'.');
		buf.extend_from_slice(self.payload.as_bytes());
		buf
	}

	fn signature_bytes(&self) -> ClResult<Vec<u8>> {
		B64.decode(&self.signature)
			.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "signature is not valid base64url"))
	}

	/// Verifies the JWS against `jwk` (RFC 7517), matching `alg` against the
	/// key's own type so a P-256 key can't be used to claim an RS256
	/// signature (spec "badSignatureAlgorithm").
	pub fn verify(&self, alg: &str, jwk: &serde_json::Value) -> ClResult<()> {
		let input = self.signing_input();
		let sig = self.signature_bytes()?;
		let bad_sig = || Error::acme(AcmeErrorKind::Malformed, "JWS signature does not verify");

		match alg {
			"ES256" => {
				let key = p256_verifying_key(jwk)?;
				let signature = p256::ecdsa::Signature::from_slice(&sig).map_err(|_| bad_sig())?;
				key.verify(&input, &signature).map_err(|_| bad_sig())
			}
			"ES384" => {
				let key = p384_verifying_key(jwk)?;
				let signature = p384::ecdsa::Signature::from_slice(&sig).map_err(|_| bad_sig())?;
				use p384::ecdsa::signature::Verifier as _;
				key.verify(&input, &signature).map_err(|_| bad_sig())
			}
			"EdDSA" => {
				let key = ed25519_verifying_key(jwk)?;
				let signature =
					ed25519_dalek::Signature::from_slice(&sig).map_err(|_| bad_sig())?;
				key.verify(&input, &signature).map_err(|_| bad_sig())
			}
			"RS256" => {
				let key = rsa_public_key(jwk)?;
				use rsa::pkcs1v15::VerifyingKey;
				use rsa::signature::Verifier as _;
				let verifying_key = VerifyingKey::<sha2::Sha256>::new(key);
				let signature = rsa::pkcs1v15::Signature::try_from(sig.as_slice()).map_err(|_| bad_sig())?;
				verifying_key.verify(&input, &signature).map_err(|_| bad_sig())
			}
			other => Err(Error::acme(
				AcmeErrorKind::BadSignatureAlgorithm,
				format!("unsupported JWS algorithm {other}"),
			)),
		}
	}

	/// Verifies against the public key embedded in `cert` instead of a
	/// stored JWK, for RFC 8555 §7.6 certificate-key revocation: the
	/// signature itself is the proof of possession, so the key comes from
	/// the certificate being revoked rather than from an account record.
	pub fn verify_with_certificate(&self, alg: &str, cert: &x509_parser::certificate::X509Certificate) -> ClResult<()> {
		use x509_parser::public_key::PublicKey;

		let input = self.signing_input();
		let sig = self.signature_bytes()?;
		let bad_sig = || Error::acme(AcmeErrorKind::Malformed, "JWS signature does not verify");
		let bad_key = || Error::acme(AcmeErrorKind::BadPublicKey, "certificate public key is malformed");
		let public_key = cert.public_key().parsed().map_err(|_| bad_key())?;

		match (alg, public_key) {
			("ES256", PublicKey::EC(point)) => {
				let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point.data()).map_err(|_| bad_key())?;
				let signature = p256::ecdsa::Signature::from_slice(&sig).map_err(|_| bad_sig())?;
				key.verify(&input, &signature).map_err(|_| bad_sig())
			}
			("ES384", PublicKey::EC(point)) => {
				let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point.data()).map_err(|_| bad_key())?;
				let signature = p384::ecdsa::Signature::from_slice(&sig).map_err(|_| bad_sig())?;
				use p384::ecdsa::signature::Verifier as _;
				key.verify(&input, &signature).map_err(|_| bad_sig())
			}
			("EdDSA", PublicKey::Unknown(raw)) if raw.len() == 32 => {
				let bytes: [u8; 32] = raw.try_into().map_err(|_| bad_key())?;
				let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|_| bad_key())?;
				let signature = ed25519_dalek::Signature::from_slice(&sig).map_err(|_| bad_sig())?;
				key.verify(&input, &signature).map_err(|_| bad_sig())
			}
			("RS256", PublicKey::RSA(rsa_key)) => {
				let key = rsa::RsaPublicKey::new(
					rsa::BigUint::from_bytes_be(rsa_key.modulus),
					rsa::BigUint::from_bytes_be(rsa_key.exponent),
				)
				.map_err(|_| bad_key())?;
				use rsa::pkcs1v15::VerifyingKey;
				use rsa::signature::Verifier as _;
				let verifying_key = VerifyingKey::<sha2::Sha256>::new(key);
				let signature = rsa::pkcs1v15::Signature::try_from(sig.as_slice()).map_err(|_| bad_sig())?;
				verifying_key.verify(&input, &signature).map_err(|_| bad_sig())
			}
			(other, _) => Err(Error::acme(
				AcmeErrorKind::BadSignatureAlgorithm,
				format!("JWS algorithm {other} does not match the certificate's key type"),
			)),
		}
	}

	/// Verifies an HMAC-SHA256 ("HS256") signature against a raw key, used
	/// for the EAB inner JWS (spec §4.5 "EAB").
	pub fn verify_hmac(&self, key: &[u8]) -> ClResult<()> {
		use hmac::{Hmac, Mac};
		let input = self.signing_input();
		let sig = self.signature_bytes()?;
		let mut mac = Hmac::<sha2::Sha256>::new_from_slice(key)
			.map_err(|_| Error::Internal("HMAC key has invalid length".into()))?;
		mac.update(&input);
		mac.verify_slice(&sig)
			.map_err(|_| Error::acme(AcmeErrorKind::Unauthorized, "EAB signature does not verify"))
	}
}

/// Decodes a base64url (no padding) field from an ACME JSON payload, e.g.
/// the finalize request's `csr`.
pub fn b64_decode(value: &str) -> ClResult<Vec<u8>> {
	B64.decode(value).map_err(|_| Error::acme(AcmeErrorKind::Malformed, "value is not valid base64url"))
}

fn b64_field(jwk: &serde_json::Value, field: &str) -> ClResult<Vec<u8>> {
	let raw = jwk
		.get(field)
		.and_then(|v| v.as_str())
		.ok_or_else(|| Error::acme(AcmeErrorKind::BadPublicKey, format!("JWK missing '{field}'")))?;
	B64.decode(raw).map_err(|_| Error::acme(AcmeErrorKind::BadPublicKey, format!("JWK '{field}' is not base64url")))
}

fn p256_verifying_key(jwk: &serde_json::Value) -> ClResult<p256::ecdsa::VerifyingKey> {
	let x = b64_field(jwk, "x")?;
	let y = b64_field(jwk, "y")?;
	let mut sec1 = vec![0x04u8];
	sec1.extend_from_slice(&x);
	sec1.extend_from_slice(&y);
	p256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
		.map_err(|_| Error::acme(AcmeErrorKind::BadPublicKey, "malformed P-256 JWK"))
}

fn p384_verifying_key(jwk: &serde_json::Value) -> ClResult<p384::ecdsa::VerifyingKey> {
	let x = b64_field(jwk, "x")?;
	let y = b64_field(jwk, "y")?;
	let mut sec1 = vec![0x04u8];
	sec1.extend_from_slice(&x);
	sec1.extend_from_slice(&y);
	p384::ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
		.map_err(|_| Error::acme(AcmeErrorKind::BadPublicKey, "malformed P-384 JWK"))
}

fn ed25519_verifying_key(jwk: &serde_json::Value) -> ClResult<ed25519_dalek::VerifyingKey> {
	let x = b64_field(jwk, "x")?;
	let bytes: [u8; 32] =
		x.try_into().map_err(|_| Error::acme(AcmeErrorKind::BadPublicKey, "malformed Ed25519 JWK"))?;
	ed25519_dalek::VerifyingKey::from_bytes(&bytes)
		.map_err(|_| Error::acme(AcmeErrorKind::BadPublicKey, "malformed Ed25519 JWK"))
}

fn rsa_public_key(jwk: &serde_json::Value) -> ClResult<rsa::RsaPublicKey> {
	let n = b64_field(jwk, "n")?;
	let e = b64_field(jwk, "e")?;
	rsa::RsaPublicKey::new(rsa::BigUint::from_bytes_be(&n), rsa::BigUint::from_bytes_be(&e))
		.map_err(|_| Error::acme(AcmeErrorKind::BadPublicKey, "malformed RSA JWK"))
}

/// RFC 7638 JWK thumbprint: SHA-256 over the canonical (lexicographically
/// key-sorted, no whitespace) JSON of the required members for the key type.
pub fn thumbprint(jwk: &serde_json::Value) -> ClResult<String> {
	use sha2::{Digest, Sha256};

	let canonical = match jwk.get("kty").and_then(|v| v.as_str()) {
		Some("EC") => serde_json::json!({
			"crv": field_str(jwk, "crv")?,
			"kty": "EC",
			"x": field_str(jwk, "x")?,
			"y": field_str(jwk, "y")?,
		}),
		Some("OKP") => serde_json::json!({
			"crv": field_str(jwk, "crv")?,
			"kty": "OKP",
			"x": field_str(jwk, "x")?,
		}),
		Some("RSA") => serde_json::json!({
			"e": field_str(jwk, "e")?,
			"kty": "RSA",
			"n": field_str(jwk, "n")?,
		}),
		_ => return Err(Error::acme(AcmeErrorKind::BadPublicKey, "unsupported JWK key type")),
	};
	let bytes = serde_json::to_vec(&canonical)?;
	Ok(B64.encode(Sha256::digest(bytes)))
}

fn field_str(jwk: &serde_json::Value, field: &str) -> ClResult<String> {
	jwk.get(field)
		.and_then(|v| v.as_str())
		.map(String::from)
		.ok_or_else(|| Error::acme(AcmeErrorKind::BadPublicKey, format!("JWK missing '{field}'")))
}

/// The key authorization a challenge response must contain (RFC 8555 §8.1):
/// `token || "." || base64url(SHA-256(accountKey-thumbprint))`.
pub fn key_authorization(token: &str, account_jwk: &serde_json::Value) -> ClResult<String> {
	Ok(format!("{token}.{}", thumbprint(account_jwk)?))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ed25519_jws_round_trips() {
		use ed25519_dalek::{Signer, SigningKey};
		let sk = SigningKey::from_bytes(&[7u8; 32]);
		let vk = sk.verifying_key();
		let x = B64.encode(vk.to_bytes());
		let jwk = serde_json::json!({"kty": "OKP", "crv": "Ed25519", "x": x});

		let header = serde_json::json!({"alg": "EdDSA", "nonce": "n1", "url": "https://example/x", "jwk": jwk});
		let protected = B64.encode(serde_json::to_vec(&header).unwrap());
		let payload = B64.encode(b"{}");
		let signing_input = format!("{protected}.{payload}");
		let signature = sk.sign(signing_input.as_bytes());

		let jws = FlattenedJws {
			protected,
			payload,
			signature: B64.encode(signature.to_bytes()),
		};
		jws.verify("EdDSA", &jwk).unwrap();
	}

	#[test]
	fn thumbprint_is_stable_for_same_key() {
		let jwk = serde_json::json!({"kty": "OKP", "crv": "Ed25519", "x": "abc"});
		assert_eq!(thumbprint(&jwk).unwrap(), thumbprint(&jwk).unwrap());
	}

	#[test]
	fn key_authorization_matches_rfc8555_shape() {
		let jwk = serde_json::json!({"kty": "OKP", "crv": "Ed25519", "x": "abc"});
		let ka = key_authorization("tok123", &jwk).unwrap();
		assert!(ka.starts_with("tok123."));
	}
}

// vim: ts=4
