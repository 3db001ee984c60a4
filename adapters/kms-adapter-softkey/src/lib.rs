//! In-process software-key `KmsAdapter` (spec §4.1). Ed25519, ECDSA
//! P-256/P-384, and RSA keys generated and held in this process; private
//! key bytes are PKCS#8-DER-encoded, optionally sealed under an
//! Argon2id-derived key (`crypto::seal`/`open`) before being written to the
//! `signing_keys` bucket through the `DbAdapter` the adapter is
//! constructed with — the reference backend SPEC_FULL §4 describes.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

mod crypto;

use async_trait::async_trait;
use ed25519_dalek::Signer as _;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroizing;

use castellan_types::db_adapter::{Bucket, DbAdapter};
use castellan_types::kms_adapter::{CreateKeyOptions, KeyAlgorithm, KeyUri, KmsAdapter, SignatureAlgorithm};
use castellan_types::prelude::*;
use castellan_types::storage::VersionedRecord;

fn map_algorithm(algo: KeyAlgorithm) -> SignatureAlgorithm {
	match algo {
		KeyAlgorithm::Ed25519 => SignatureAlgorithm::Ed25519,
		KeyAlgorithm::EcdsaP256 => SignatureAlgorithm::EcdsaP256Sha256,
		KeyAlgorithm::EcdsaP384 => SignatureAlgorithm::EcdsaP384Sha384,
		KeyAlgorithm::Rsa { .. } => SignatureAlgorithm::RsaPkcs1Sha256,
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKey {
	algorithm: KeyAlgorithm,
	public_key_der: Vec<u8>,
	/// `None` when the adapter was configured without a passphrase: the
	/// PKCS#8 bytes below are plaintext. Present otherwise.
	seal: Option<StoredSeal>,
	pkcs8_der: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSeal {
	salt: [u8; crypto::SALT_LEN],
	nonce: [u8; crypto::NONCE_LEN],
}

enum SigningKey {
	Ed25519(Box<ed25519_dalek::SigningKey>),
	EcdsaP256(Box<p256::ecdsa::SigningKey>),
	EcdsaP384(Box<p384::ecdsa::SigningKey>),
	Rsa(Box<rsa::RsaPrivateKey>),
}

pub struct SoftkeyKmsAdapter {
	db: Arc<dyn DbAdapter>,
	passphrase: Option<Zeroizing<Vec<u8>>>,
	cache: Mutex<HashMap<Box<str>, Arc<SigningKey>>>,
}

impl std::fmt::Debug for SoftkeyKmsAdapter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SoftkeyKmsAdapter").field("wrapped", &self.passphrase.is_some()).finish()
	}
}

impl SoftkeyKmsAdapter {
	pub fn new(db: Arc<dyn DbAdapter>, passphrase: Option<Vec<u8>>) -> Self {
		Self { db, passphrase: passphrase.map(Zeroizing::new), cache: Mutex::new(HashMap::new()) }
	}

	fn key_id(key_uri: &KeyUri) -> ClResult<&str> {
		key_uri
			.0
			.strip_prefix("softkey://")
			.ok_or_else(|| Error::bad_request("key URI is not a softkey:// URI"))
	}

	async fn load_record(&self, key_uri: &KeyUri) -> ClResult<StoredKey> {
		let id = Self::key_id(key_uri)?;
		let bytes = self.db.get(Bucket::SigningKeys, id).await?;
		let record: VersionedRecord<StoredKey> = VersionedRecord::decode(&bytes)?;
		Ok(record.value)
	}

	fn unwrap_pkcs8(&self, stored: &StoredKey) -> ClResult<Zeroizing<Vec<u8>>> {
		match &stored.seal {
			Some(seal) => {
				let passphrase = self
					.passphrase
					.as_ref()
					.ok_or_else(|| Error::Internal("key is sealed but no passphrase configured".into()))?;
				crypto::open(passphrase, &seal.salt, &seal.nonce, &stored.pkcs8_der)
			}
			None => Ok(Zeroizing::new(stored.pkcs8_der.clone())),
		}
	}

	fn decode_signing_key(algorithm: KeyAlgorithm, pkcs8_der: &[u8]) -> ClResult<SigningKey> {
		Ok(match algorithm {
			KeyAlgorithm::Ed25519 => SigningKey::Ed25519(Box::new(
				ed25519_dalek::SigningKey::from_pkcs8_der(pkcs8_der)
					.map_err(|e| Error::Internal(format!("ed25519 pkcs8 decode failed: {e}")))?,
			)),
			KeyAlgorithm::EcdsaP256 => SigningKey::EcdsaP256(Box::new(
				p256::ecdsa::SigningKey::from_pkcs8_der(pkcs8_der)
					.map_err(|e| Error::Internal(format!("p256 pkcs8 decode failed: {e}")))?,
			)),
			KeyAlgorithm::EcdsaP384 => SigningKey::EcdsaP384(Box::new(
				p384::ecdsa::SigningKey::from_pkcs8_der(pkcs8_der)
					.map_err(|e| Error::Internal(format!("p384 pkcs8 decode failed: {e}")))?,
			)),
			KeyAlgorithm::Rsa { .. } => SigningKey::Rsa(Box::new(
				rsa::RsaPrivateKey::from_pkcs8_der(pkcs8_der)
					.map_err(|e| Error::Internal(format!("rsa pkcs8 decode failed: {e}")))?,
			)),
		})
	}

	async fn signing_key_for(&self, key_uri: &KeyUri) -> ClResult<Arc<SigningKey>> {
		let id = Self::key_id(key_uri)?.to_string();
		if let Some(cached) = self.cache.lock().get(id.as_str()).cloned() {
			return Ok(cached);
		}
		let stored = self.load_record(key_uri).await?;
		let pkcs8_der = self.unwrap_pkcs8(&stored)?;
		let key = Arc::new(Self::decode_signing_key(stored.algorithm, &pkcs8_der)?);
		self.cache.lock().insert(id.into(), key.clone());
		Ok(key)
	}
}

#[async_trait]
impl KmsAdapter for SoftkeyKmsAdapter {
	async fn sign(&self, key_uri: &KeyUri, digest: &[u8]) -> ClResult<Vec<u8>> {
		let key = self.signing_key_for(key_uri).await?;
		match key.as_ref() {
			SigningKey::Ed25519(sk) => Ok(sk.sign(digest).to_bytes().to_vec()),
			SigningKey::EcdsaP256(sk) => {
				let sig: p256::ecdsa::Signature = sk
					.sign_prehash(digest)
					.map_err(|e| Error::Internal(format!("p256 signing failed: {e}")))?;
				Ok(sig.to_bytes().to_vec())
			}
			SigningKey::EcdsaP384(sk) => {
				let sig: p384::ecdsa::Signature = sk
					.sign_prehash(digest)
					.map_err(|e| Error::Internal(format!("p384 signing failed: {e}")))?;
				Ok(sig.to_bytes().to_vec())
			}
			SigningKey::Rsa(sk) => sk
				.sign(rsa::Pkcs1v15Sign::new::<sha2::Sha256>(), digest)
				.map_err(|e| Error::Internal(format!("rsa signing failed: {e}"))),
		}
	}

	async fn create_key(&self, opts: CreateKeyOptions) -> ClResult<(Vec<u8>, KeyUri)> {
		let mut rng = OsRng;
		let (pkcs8_der, public_key_der): (Vec<u8>, Vec<u8>) = match opts.algorithm {
			KeyAlgorithm::Ed25519 => {
				let sk = ed25519_dalek::SigningKey::generate(&mut rng);
				let pkcs8 = sk
					.to_pkcs8_der()
					.map_err(|e| Error::Internal(format!("ed25519 pkcs8 encode failed: {e}")))?;
				let spki = sk
					.verifying_key()
					.to_public_key_der()
					.map_err(|e| Error::Internal(format!("ed25519 spki encode failed: {e}")))?;
				(pkcs8.as_bytes().to_vec(), spki.as_bytes().to_vec())
			}
			KeyAlgorithm::EcdsaP256 => {
				let sk = p256::ecdsa::SigningKey::random(&mut rng);
				let pkcs8 = sk
					.to_pkcs8_der()
					.map_err(|e| Error::Internal(format!("p256 pkcs8 encode failed: {e}")))?;
				let spki = sk
					.verifying_key()
					.to_public_key_der()
					.map_err(|e| Error::Internal(format!("p256 spki encode failed: {e}")))?;
				(pkcs8.as_bytes().to_vec(), spki.as_bytes().to_vec())
			}
			KeyAlgorithm::EcdsaP384 => {
				let sk = p384::ecdsa::SigningKey::random(&mut rng);
				let pkcs8 = sk
					.to_pkcs8_der()
					.map_err(|e| Error::Internal(format!("p384 pkcs8 encode failed: {e}")))?;
				let spki = sk
					.verifying_key()
					.to_public_key_der()
					.map_err(|e| Error::Internal(format!("p384 spki encode failed: {e}")))?;
				(pkcs8.as_bytes().to_vec(), spki.as_bytes().to_vec())
			}
			KeyAlgorithm::Rsa { bits } => {
				let sk = rsa::RsaPrivateKey::new(&mut rng, bits as usize)
					.map_err(|e| Error::Internal(format!("rsa keygen failed: {e}")))?;
				let pkcs8 = sk
					.to_pkcs8_der()
					.map_err(|e| Error::Internal(format!("rsa pkcs8 encode failed: {e}")))?;
				let spki = rsa::RsaPublicKey::from(&sk)
					.to_public_key_der()
					.map_err(|e| Error::Internal(format!("rsa spki encode failed: {e}")))?;
				(pkcs8.as_bytes().to_vec(), spki.as_bytes().to_vec())
			}
		};

		let (seal, stored_bytes) = match (&self.passphrase, &opts.passphrase) {
			(_, Some(one_shot)) => {
				let (salt, nonce, ciphertext) = crypto::seal(one_shot, &pkcs8_der)?;
				(Some(StoredSeal { salt, nonce }), ciphertext)
			}
			(Some(configured), None) => {
				let (salt, nonce, ciphertext) = crypto::seal(configured, &pkcs8_der)?;
				(Some(StoredSeal { salt, nonce }), ciphertext)
			}
			(None, None) => (None, pkcs8_der.clone()),
		};

		let id: Box<str> = uuid::Uuid::new_v4().to_string().into();
		let record = StoredKey {
			algorithm: opts.algorithm,
			public_key_der: public_key_der.clone(),
			seal,
			pkcs8_der: stored_bytes,
		};
		let bytes = VersionedRecord::new(record).encode()?;
		self.db.put(Bucket::SigningKeys, &id, bytes).await?;

		let key_uri = KeyUri(format!("softkey://{id}").into());
		let signing_key = Self::decode_signing_key(opts.algorithm, &pkcs8_der)?;
		self.cache.lock().insert(id, Arc::new(signing_key));

		tracing::info!(key_uri = %key_uri, algorithm = ?opts.algorithm, "signing key created");
		Ok((public_key_der, key_uri))
	}

	async fn get_public_key(&self, key_uri: &KeyUri) -> ClResult<Vec<u8>> {
		Ok(self.load_record(key_uri).await?.public_key_der)
	}

	async fn algorithm(&self, key_uri: &KeyUri) -> ClResult<SignatureAlgorithm> {
		Ok(map_algorithm(self.load_record(key_uri).await?.algorithm))
	}

	fn key_uri_scheme(&self) -> &'static str {
		"softkey"
	}

	async fn decrypt(&self, key_uri: &KeyUri, ciphertext: &[u8]) -> ClResult<Vec<u8>> {
		let key = self.signing_key_for(key_uri).await?;
		match key.as_ref() {
			SigningKey::Rsa(sk) => sk
				.decrypt(rsa::Oaep::new::<sha2::Sha256>(), ciphertext)
				.map_err(|e| Error::Internal(format!("rsa decryption failed: {e}"))),
			_ => Err(Error::bad_request("key does not support decryption")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use castellan_types::db_adapter::test_double::MemoryDb;
	use ed25519_dalek::pkcs8::DecodePublicKey;
	use sha2::{Digest, Sha256};

	fn adapter(passphrase: Option<&str>) -> SoftkeyKmsAdapter {
		SoftkeyKmsAdapter::new(Arc::new(MemoryDb::new()), passphrase.map(|p| p.as_bytes().to_vec()))
	}

	#[tokio::test]
	async fn ed25519_create_then_sign_and_verify() {
		let kms = adapter(None);
		let (pubkey_der, uri) = kms
			.create_key(CreateKeyOptions { algorithm: KeyAlgorithm::Ed25519, passphrase: None })
			.await
			.unwrap();

		let message = b"to-be-signed bytes";
		let sig = kms.sign(&uri, message).await.unwrap();

		let verifying_key = ed25519_dalek::VerifyingKey::from_public_key_der(&pubkey_der).unwrap();
		let signature = ed25519_dalek::Signature::from_slice(&sig).unwrap();
		use ed25519_dalek::Verifier;
		verifying_key.verify(message, &signature).unwrap();
	}

	#[tokio::test]
	async fn wrapped_key_requires_correct_passphrase() {
		let db = Arc::new(MemoryDb::new());
		let sealed = SoftkeyKmsAdapter::new(db.clone(), Some(b"correct horse".to_vec()));
		let (_, uri) = sealed
			.create_key(CreateKeyOptions { algorithm: KeyAlgorithm::Ed25519, passphrase: None })
			.await
			.unwrap();

		// Fresh adapter (no in-memory cache) over the same DB, wrong passphrase.
		let wrong = SoftkeyKmsAdapter::new(db, Some(b"wrong".to_vec()));
		let err = wrong.sign(&uri, b"msg").await;
		assert!(matches!(err, Err(Error::Unauthorized(_))));
	}

	#[tokio::test]
	async fn ecdsa_p256_sign_produces_fixed_width_signature() {
		let kms = adapter(None);
		let (_, uri) = kms
			.create_key(CreateKeyOptions { algorithm: KeyAlgorithm::EcdsaP256, passphrase: None })
			.await
			.unwrap();
		let digest = Sha256::digest(b"tbs bytes");
		let sig = kms.sign(&uri, &digest).await.unwrap();
		assert_eq!(sig.len(), 64);
	}

	#[tokio::test]
	async fn get_public_key_does_not_require_passphrase() {
		let db = Arc::new(MemoryDb::new());
		let kms = SoftkeyKmsAdapter::new(db, Some(b"some-passphrase".to_vec()));
		let (pubkey_der, uri) = kms
			.create_key(CreateKeyOptions { algorithm: KeyAlgorithm::EcdsaP384, passphrase: None })
			.await
			.unwrap();
		let fetched = kms.get_public_key(&uri).await.unwrap();
		assert_eq!(fetched, pubkey_der);
	}
}

// vim: ts=4
