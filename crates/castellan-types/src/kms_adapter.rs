//! Signing-key abstraction (spec §4.1). Every backend — an in-process
//! software key, a PKCS#11 token, a cloud HSM — implements the same three
//! operations; the issuance pipeline never branches on which one is wired
//! in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::error::ClResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
	Ed25519,
	EcdsaP256Sha256,
	EcdsaP384Sha384,
	RsaPkcs1Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum KeyAlgorithm {
	Ed25519,
	EcdsaP256,
	EcdsaP384,
	Rsa { bits: u32 },
}

/// Opaque handle identifying a key within a KMS backend, e.g.
/// `softkey://<id>`, `pkcs11://<slot>/<label>`, `awskms://<key-arn>`. Never
/// parsed for structure outside the adapter that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyUri(pub Box<str>);

impl std::fmt::Display for KeyUri {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone)]
pub struct CreateKeyOptions {
	pub algorithm: KeyAlgorithm,
	/// Passphrase used to wrap the private key at rest, when the backend
	/// supports software wrapping (softkey backend only).
	pub passphrase: Option<Box<[u8]>>,
}

/// The private key material itself is never observed by core logic; every
/// return value here is either a public key, a signature, or an opaque URI.
#[async_trait]
pub trait KmsAdapter: Debug + Send + Sync {
	/// Signs `digest` (already hashed per `algorithm(key_uri)`) and returns
	/// the raw signature bytes in the encoding `SignatureAlgorithm` implies
	/// (fixed-width r||s for ECDSA, not DER — callers re-encode for X.509).
	async fn sign(&self, key_uri: &KeyUri, digest: &[u8]) -> ClResult<Vec<u8>>;

	/// Generates a new key pair and returns its SPKI-encoded public key plus
	/// the URI to address it by for future signing.
	async fn create_key(&self, opts: CreateKeyOptions) -> ClResult<(Vec<u8>, KeyUri)>;

	/// Returns the SPKI-encoded public key for an existing key URI.
	async fn get_public_key(&self, key_uri: &KeyUri) -> ClResult<Vec<u8>>;

	/// The signature algorithm this key signs with, so the issuance
	/// pipeline can pick the right X.509 `AlgorithmIdentifier` without a
	/// round trip through the public key bytes.
	async fn algorithm(&self, key_uri: &KeyUri) -> ClResult<SignatureAlgorithm>;

	/// `softkey`, `pkcs11`, `awskms`, ... — logged alongside signing
	/// operations so an audit trail never needs to touch key material to
	/// say which backend minted a signature.
	fn key_uri_scheme(&self) -> &'static str;

	/// Decrypts `ciphertext` with the key's private half (RSA-OAEP/SHA-256).
	/// Only meaningful for RSA keys — SCEP's `PKIOperation` (RFC 8894) is the
	/// sole caller, unwrapping the content-encryption key from a CMS
	/// `EnvelopedData`. Backends whose keys never decrypt (Ed25519, ECDSA)
	/// return `Error::BadRequest`.
	async fn decrypt(&self, key_uri: &KeyUri, ciphertext: &[u8]) -> ClResult<Vec<u8>>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_double {
	//! A deterministic in-memory signer for unit tests elsewhere in the
	//! workspace. Not cryptographically meaningful — callers that need a
	//! real signature exercise `kms-adapter-softkey` directly.

	use super::*;
	use std::collections::HashMap;
	use std::sync::Mutex;
	use std::sync::atomic::{AtomicU64, Ordering};

	use crate::error::Error;

	#[derive(Debug, Default)]
	pub struct MemoryKms {
		keys: Mutex<HashMap<Box<str>, Vec<u8>>>,
		counter: AtomicU64,
	}

	impl MemoryKms {
		pub fn new() -> Self {
			Self::default()
		}
	}

	#[async_trait]
	impl KmsAdapter for MemoryKms {
		async fn sign(&self, key_uri: &KeyUri, digest: &[u8]) -> ClResult<Vec<u8>> {
			let keys = self.keys.lock().map_err(|_| Error::Internal("poisoned".into()))?;
			if !keys.contains_key(&key_uri.0) {
				return Err(Error::NotFound);
			}
			Ok(digest.to_vec())
		}

		async fn create_key(&self, _opts: CreateKeyOptions) -> ClResult<(Vec<u8>, KeyUri)> {
			let id = self.counter.fetch_add(1, Ordering::SeqCst);
			let uri = KeyUri(format!("test://{id}").into());
			let pubkey = format!("pub-{id}").into_bytes();
			self.keys
				.lock()
				.map_err(|_| Error::Internal("poisoned".into()))?
				.insert(uri.0.clone(), pubkey.clone());
			Ok((pubkey, uri))
		}

		async fn get_public_key(&self, key_uri: &KeyUri) -> ClResult<Vec<u8>> {
			self.keys
				.lock()
				.map_err(|_| Error::Internal("poisoned".into()))?
				.get(&key_uri.0)
				.cloned()
				.ok_or(Error::NotFound)
		}

		async fn algorithm(&self, _key_uri: &KeyUri) -> ClResult<SignatureAlgorithm> {
			Ok(SignatureAlgorithm::Ed25519)
		}

		fn key_uri_scheme(&self) -> &'static str {
			"test"
		}

		async fn decrypt(&self, key_uri: &KeyUri, ciphertext: &[u8]) -> ClResult<Vec<u8>> {
			let keys = self.keys.lock().map_err(|_| Error::Internal("poisoned".into()))?;
			if !keys.contains_key(&key_uri.0) {
				return Err(Error::NotFound);
			}
			Ok(ciphertext.to_vec())
		}
	}

	#[tokio::test]
	async fn sign_against_unknown_key_is_not_found() {
		let kms = MemoryKms::new();
		let err = kms.sign(&KeyUri("test://missing".into()), b"digest").await;
		assert!(matches!(err, Err(Error::NotFound)));
	}

	#[tokio::test]
	async fn create_key_then_sign_round_trips() {
		let kms = MemoryKms::new();
		let (pubkey, uri) = kms
			.create_key(CreateKeyOptions { algorithm: KeyAlgorithm::Ed25519, passphrase: None })
			.await
			.unwrap();
		assert!(!pubkey.is_empty());
		let sig = kms.sign(&uri, b"tbs-digest").await.unwrap();
		assert_eq!(sig, b"tbs-digest");
	}
}

// vim: ts=4
