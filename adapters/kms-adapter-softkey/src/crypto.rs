//! Passphrase-based wrapping for private key material at rest (spec §4.1
//! "private key bytes may be wrapped with an Argon2id-derived key"),
//! grounded on the teacher's `auth-adapter-sqlite::crypto` key-generation
//! module, swapping its bcrypt/JWT concerns for a KEK derivation since here
//! the passphrase protects a stored key, not a login.

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use castellan_types::prelude::*;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

fn derive_kek(passphrase: &[u8], salt: &[u8; SALT_LEN]) -> ClResult<Zeroizing<[u8; 32]>> {
	let mut key = Zeroizing::new([0u8; 32]);
	Argon2::default()
		.hash_password_into(passphrase, salt, key.as_mut())
		.map_err(|e| Error::Internal(format!("key derivation failed: {e}")))?;
	Ok(key)
}

/// Encrypts `plaintext` (a PKCS#8 DER private key) under a fresh
/// Argon2id-derived key. Returns `(salt, nonce, ciphertext)`.
pub fn seal(passphrase: &[u8], plaintext: &[u8]) -> ClResult<([u8; SALT_LEN], [u8; NONCE_LEN], Vec<u8>)> {
	let mut salt = [0u8; SALT_LEN];
	rand::thread_rng().fill_bytes(&mut salt);
	let mut nonce_bytes = [0u8; NONCE_LEN];
	rand::thread_rng().fill_bytes(&mut nonce_bytes);

	let kek = derive_kek(passphrase, &salt)?;
	let cipher = ChaCha20Poly1305::new((&*kek).into());
	let ciphertext = cipher
		.encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
		.map_err(|_| Error::Internal("key wrapping failed".into()))?;
	Ok((salt, nonce_bytes, ciphertext))
}

pub fn open(
	passphrase: &[u8],
	salt: &[u8; SALT_LEN],
	nonce: &[u8; NONCE_LEN],
	ciphertext: &[u8],
) -> ClResult<Zeroizing<Vec<u8>>> {
	let kek = derive_kek(passphrase, salt)?;
	let cipher = ChaCha20Poly1305::new((&*kek).into());
	let plaintext = cipher
		.decrypt(Nonce::from_slice(nonce), ciphertext)
		.map_err(|_| Error::Unauthorized("key unwrap failed: wrong passphrase or corrupt record".into()))?;
	Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn seal_then_open_round_trips() {
		let passphrase = b"correct horse battery staple";
		let (salt, nonce, ciphertext) = seal(passphrase, b"top secret pkcs8 bytes").unwrap();
		let opened = open(passphrase, &salt, &nonce, &ciphertext).unwrap();
		assert_eq!(&*opened, b"top secret pkcs8 bytes");
	}

	#[test]
	fn wrong_passphrase_fails_to_open() {
		let (salt, nonce, ciphertext) = seal(b"right", b"secret").unwrap();
		let err = open(b"wrong", &salt, &nonce, &ciphertext);
		assert!(matches!(err, Err(Error::Unauthorized(_))));
	}
}

// vim: ts=4
