//! Content and key-transport crypto for the CMS envelope (RFC 8894 §3.1.2
//! "PKCSReq"). This CA's SCEP profile favors AES-256-CBC content
//! encryption and RSAES-OAEP/SHA-256 key transport over the legacy
//! DES3/PKCS#1v1.5 pairing most SCEP implementations default to — both are
//! explicit algorithm identifiers on the wire, so a compliant client
//! negotiates off `GetCACaps` rather than assuming the legacy defaults.

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use der::asn1::OctetString;
use der::{Decode, Encode, Sequence};
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use x509_cert::spki::AlgorithmIdentifierOwned;

use castellan_types::prelude::*;

use crate::pkcs7;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const OID_AES256_CBC: &str = "2.16.840.1.101.3.4.1.42";
pub const OID_RSAES_OAEP: &str = "1.2.840.113549.1.1.7";
pub const OID_MGF1: &str = "1.2.840.113549.1.1.8";
pub const OID_SHA256: &str = "2.16.840.1.101.3.4.2.1";

#[derive(Clone, Debug, Sequence)]
struct OaepParams {
	#[asn1(context_specific = "0", explicit = "true")]
	hash_func: AlgorithmIdentifierOwned,
	#[asn1(context_specific = "1", explicit = "true")]
	mask_gen_func: AlgorithmIdentifierOwned,
}

pub fn rsaes_oaep_sha256_algorithm() -> ClResult<AlgorithmIdentifierOwned> {
	let sha256 = AlgorithmIdentifierOwned { oid: pkcs7::oid(OID_SHA256)?, parameters: None };
	let mgf1_sha256 = AlgorithmIdentifierOwned { oid: pkcs7::oid(OID_MGF1)?, parameters: Some(pkcs7::wrap_any(&sha256)?) };
	let params = OaepParams { hash_func: sha256, mask_gen_func: mgf1_sha256 };
	Ok(AlgorithmIdentifierOwned { oid: pkcs7::oid(OID_RSAES_OAEP)?, parameters: Some(pkcs7::wrap_any(&params)?) })
}

pub fn aes256_cbc_algorithm(iv: &[u8; 16]) -> ClResult<AlgorithmIdentifierOwned> {
	let iv_octets = OctetString::new(iv.to_vec()).map_err(|_| Error::Internal("IV encoding failed".into()))?;
	Ok(AlgorithmIdentifierOwned { oid: pkcs7::oid(OID_AES256_CBC)?, parameters: Some(pkcs7::wrap_any(&iv_octets)?) })
}

pub fn aes256_cbc_iv(algorithm: &AlgorithmIdentifierOwned) -> ClResult<[u8; 16]> {
	let params = algorithm
		.parameters
		.as_ref()
		.ok_or_else(|| Error::bad_request("contentEncryptionAlgorithm is missing its IV parameter"))?;
	let octets: OctetString = pkcs7::unwrap_any(params)?;
	octets
		.as_bytes()
		.try_into()
		.map_err(|_| Error::bad_request("AES-CBC IV is not 16 bytes"))
}

/// Generates a fresh content-encryption key and IV, encrypts `plaintext`
/// under AES-256-CBC (PKCS#7 padding), and returns `(cek, iv, ciphertext)`.
pub fn encrypt_content(plaintext: &[u8]) -> ([u8; 32], [u8; 16], Vec<u8>) {
	let mut rng = rand::thread_rng();
	let mut cek = [0u8; 32];
	rng.fill_bytes(&mut cek);
	let mut iv = [0u8; 16];
	rng.fill_bytes(&mut iv);

	let ciphertext = Aes256CbcEnc::new(&cek.into(), &iv.into()).encrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(plaintext);
	(cek, iv, ciphertext)
}

pub fn decrypt_content(cek: &[u8], iv: &[u8; 16], ciphertext: &[u8]) -> ClResult<Vec<u8>> {
	let key: [u8; 32] =
		cek.try_into().map_err(|_| Error::bad_request("content-encryption key is not 32 bytes"))?;
	Aes256CbcDec::new(&key.into(), iv.into())
		.decrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(ciphertext)
		.map_err(|_| Error::bad_request("content decryption failed: bad key, IV, or padding"))
}

/// Encrypts `cek` to the recipient's RSA public key (SPKI DER) under
/// RSAES-OAEP/SHA-256. No private-key operation is involved, so this runs
/// directly against `rsa` rather than through `KmsAdapter`.
pub fn wrap_key_for_recipient(recipient_spki_der: &[u8], cek: &[u8]) -> ClResult<Vec<u8>> {
	let public_key = RsaPublicKey::from_public_key_der(recipient_spki_der)
		.map_err(|_| Error::bad_request("recipient public key is not valid RSA SPKI DER"))?;
	public_key
		.encrypt(&mut rand::thread_rng(), Oaep::new::<sha2::Sha256>(), cek)
		.map_err(|e| Error::Internal(format!("RSA key wrap failed: {e}")))
}

// vim: ts=4
