//! SSH-POP provisioner (spec §4.4): the bearer presents a token signed by
//! an SSH CA key already trusted for this provisioner, proving possession
//! of a certificate that CA issued. Keys are configured as OpenSSH
//! authorized-key-format public keys; the signature check reuses the same
//! Ed25519/ECDSA verification path as the other token provisioners since
//! an SSH Ed25519/ECDSA public key and a JWT's are the same curve math,
//! just a different wire encoding.

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};

use castellan_types::prelude::*;
use castellan_types::provisioner::SshPopConfig;

use super::TokenClaims;

pub fn verify(config: &SshPopConfig, token: &str, audience: &str) -> ClResult<serde_json::Value> {
	let header = decode_header(token).map_err(|_| Error::Unauthorized("malformed JWT header".into()))?;

	let mut last_err = Error::Unauthorized("token not signed by any trusted CA key".into());
	for authorized_key in &config.ca_public_keys {
		let Some(decoding_key) = decoding_key_from_authorized_key(authorized_key, header.alg) else {
			continue;
		};

		let mut validation = Validation::new(header.alg);
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

/// Parses `ssh-ed25519 AAAA...` / `ecdsa-sha2-nistp256 AAAA...` lines into a
/// `DecodingKey`, or `None` if the key type doesn't match the JWT's
/// algorithm (so callers can try the next configured key instead of
/// erroring out on a type mismatch).
fn decoding_key_from_authorized_key(line: &str, alg: Algorithm) -> Option<DecodingKey> {
	use base64::Engine as _;

	let mut parts = line.split_whitespace();
	let key_type = parts.next()?;
	let encoded = parts.next()?;
	let blob = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;

	match (key_type, alg) {
		("ssh-ed25519", Algorithm::EdDSA) => {
			let raw_key = ssh_wire_string(&blob, 1)?;
			Some(DecodingKey::from_ed_der(raw_key))
		}
		("ecdsa-sha2-nistp256", Algorithm::ES256) => {
			let point = ssh_wire_string(&blob, 2)?;
			// SSH encodes the EC point uncompressed (0x04 || x || y);
			// jsonwebtoken wants raw x||y.
			let xy = point.get(1..)?;
			let (x, y) = xy.split_at(xy.len() / 2);
			Some(DecodingKey::from_ec_components(&hex::encode(x), &hex::encode(y)).ok()?)
		}
		_ => None,
	}
}

/// SSH wire format strings are length-prefixed (`u32` big-endian length
/// followed by the bytes); `skip` selects the Nth such field.
fn ssh_wire_string(blob: &[u8], skip: usize) -> Option<&[u8]> {
	let mut cursor = 0usize;
	let mut field = None;
	for _ in 0..=skip {
		let len_bytes = blob.get(cursor..cursor + 4)?;
		let len = u32::from_be_bytes(len_bytes.try_into().ok()?) as usize;
		cursor += 4;
		field = blob.get(cursor..cursor + len);
		cursor += len;
	}
	field
}

// vim: ts=4
