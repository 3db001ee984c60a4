//! RFC 8894 message framing: SCEP's own attribute OIDs, `messageType` /
//! `pkiStatus` / `failInfo` codes, and the `PKIOperation` request/response
//! pipeline built on `pkcs7`/`crypto`.

use der::asn1::{Any, OctetString, PrintableString, SetOfVec};
use der::{Decode, Encode};
use ed25519_dalek::Verifier as _;
use p256::ecdsa::signature::Verifier as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

use castellan_pki::authority::Authority;
use castellan_pki::provisioner::ProvisionerProof;
use castellan_types::db_adapter::{Bucket, DbAdapter};
use castellan_types::kms_adapter::{KeyUri, KmsAdapter, SignatureAlgorithm};
use castellan_types::model::CertificateRecord;
use castellan_types::prelude::*;
use castellan_types::storage::VersionedRecord;

use crate::crypto;
use crate::pkcs7::{
	self, Attribute, ContentInfo, EncapsulatedContentInfo, EncryptedContentInfo, EnvelopedData,
	IssuerAndSerialNumber, KeyTransRecipientInfo, SignedData, SignerInfo,
};

const OID_PKCS7_DATA: &str = "1.2.840.113549.1.7.1";
const OID_PKCS7_SIGNED_DATA: &str = "1.2.840.113549.1.7.2";
const OID_PKCS7_ENVELOPED_DATA: &str = "1.2.840.113549.1.7.3";
const OID_PKCS9_CONTENT_TYPE: &str = "1.2.840.113549.1.9.3";
const OID_PKCS9_MESSAGE_DIGEST: &str = "1.2.840.113549.1.9.4";
const OID_PKCS9_CHALLENGE_PASSWORD: &str = "1.2.840.113549.1.9.7";

const OID_SCEP_MESSAGE_TYPE: &str = "2.16.840.1.113733.1.9.2";
const OID_SCEP_PKI_STATUS: &str = "2.16.840.1.113733.1.9.3";
const OID_SCEP_FAIL_INFO: &str = "2.16.840.1.113733.1.9.4";
const OID_SCEP_SENDER_NONCE: &str = "2.16.840.1.113733.1.9.5";
const OID_SCEP_RECIPIENT_NONCE: &str = "2.16.840.1.113733.1.9.6";
const OID_SCEP_TRANSACTION_ID: &str = "2.16.840.1.113733.1.9.7";

// RFC 8894 §3.2.1.2 messageType values. `GetCertInitial` is the legacy
// (pre-RFC) name for `CertPoll`, still the common term in SCEP client UIs
// and the one spec.md §4.6 uses; the wire code is the same either way.
const MESSAGE_TYPE_PKCS_REQ: &str = "19";
const MESSAGE_TYPE_RENEWAL_REQ: &str = "17";
const MESSAGE_TYPE_CERT_POLL: &str = "20";
const MESSAGE_TYPE_CERT_REP: &str = "3";

const PKI_STATUS_SUCCESS: &str = "0";
const PKI_STATUS_FAILURE: &str = "2";

/// The three request shapes `pki_operation` answers (spec §4.6). `CertPoll`
/// carries no CSR of its own — it just asks "is the transaction from my
/// last `PKCSReq` done yet" — so it's dispatched separately from the two
/// CSR-carrying kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScepMessageType {
	PkcsReq,
	RenewalReq,
	CertPoll,
}

impl ScepMessageType {
	fn from_wire(code: &str) -> ClResult<Self> {
		match code {
			MESSAGE_TYPE_PKCS_REQ => Ok(Self::PkcsReq),
			MESSAGE_TYPE_RENEWAL_REQ => Ok(Self::RenewalReq),
			MESSAGE_TYPE_CERT_POLL => Ok(Self::CertPoll),
			other => Err(Error::bad_request(format!("unsupported messageType {other}"))),
		}
	}
}

/// RFC 8894 §3.2.1.3 failInfo reason codes, as the numeric string carried
/// in the `failInfo` signed attribute.
#[derive(Clone, Copy, Debug)]
pub enum FailInfo {
	BadAlg,
	BadMessageCheck,
	BadRequest,
	BadCertId,
}

impl FailInfo {
	fn code(self) -> &'static str {
		match self {
			Self::BadAlg => "0",
			Self::BadMessageCheck => "1",
			Self::BadRequest => "2",
			Self::BadCertId => "4",
		}
	}
}

fn digest_for(alg: SignatureAlgorithm, message: &[u8]) -> Vec<u8> {
	match alg {
		SignatureAlgorithm::Ed25519 => message.to_vec(),
		_ => Sha256::digest(message).to_vec(),
	}
}

fn printable_attr(oid: &str, value: &str) -> ClResult<Attribute> {
	let printable =
		PrintableString::new(value).map_err(|_| Error::Internal("not a valid PrintableString".into()))?;
	Attribute::single(pkcs7::oid(oid)?, pkcs7::wrap_any(&printable)?)
}

fn octet_attr(oid: &str, bytes: &[u8]) -> ClResult<Attribute> {
	let octets =
		OctetString::new(bytes.to_vec()).map_err(|_| Error::Internal("OCTET STRING encoding failed".into()))?;
	Attribute::single(pkcs7::oid(oid)?, pkcs7::wrap_any(&octets)?)
}

fn decode_attrs(set: &SetOfVec<Any>) -> ClResult<Vec<Attribute>> {
	set.iter().map(|any| pkcs7::unwrap_any::<Attribute>(any)).collect()
}

fn find_attr<'a>(attrs: &'a [Attribute], oid: &str) -> ClResult<&'a Attribute> {
	let wanted = pkcs7::oid(oid)?;
	attrs.iter().find(|a| a.oid == wanted).ok_or_else(|| Error::bad_request(format!("missing signed attribute {oid}")))
}

fn attr_printable(attrs: &[Attribute], oid: &str) -> ClResult<Box<str>> {
	let value: PrintableString = pkcs7::unwrap_any(find_attr(attrs, oid)?.single_value()?)?;
	Ok(value.as_str().into())
}

fn attr_octets(attrs: &[Attribute], oid: &str) -> ClResult<Vec<u8>> {
	let value: OctetString = pkcs7::unwrap_any(find_attr(attrs, oid)?.single_value()?)?;
	Ok(value.as_bytes().to_vec())
}

/// The pieces of an authenticated `PKIOperation` request needed to answer
/// it: the SCEP transaction bookkeeping (echoed back verbatim in the
/// reply), which of the three request shapes it is, and the CSR to submit
/// to `Authority::sign`/`Authority::renew` — absent for `CertPoll`, which
/// carries no CSR.
struct ParsedRequest {
	message_type: ScepMessageType,
	transaction_id: Box<str>,
	sender_nonce: Vec<u8>,
	requester_cert: Certificate,
	csr_der: Option<Vec<u8>>,
}

/// Unwraps the outer `SignedData` (RFC 8894 §3.1), verifies its signature
/// against the requester certificate it carries (spec §4.6: self-signed
/// for `PKCSReq`, the current client certificate for `RenewalReq`/
/// `CertPoll`), then for the two CSR-carrying message types decrypts the
/// inner `EnvelopedData` to recover the CSR. The signature check here only
/// proves the request was made with the key matching the carried
/// certificate; for `PKCSReq` that certificate is self-signed and proves
/// nothing about identity on its own, which is why the actual enrollment
/// authorization is the CSR's `challengePassword` attribute, checked
/// downstream by `try_sign`.
async fn parse_request(kms: &dyn KmsAdapter, ca_key_uri: &KeyUri, body: &[u8]) -> ClResult<ParsedRequest> {
	let outer = ContentInfo::from_der(body).map_err(|_| Error::bad_request("not a valid PKCSReq ContentInfo"))?;
	if outer.content_type.to_string() != OID_PKCS7_SIGNED_DATA {
		return Err(Error::bad_request("outer ContentInfo is not SignedData"));
	}
	let signed_data: SignedData = pkcs7::unwrap_any(&outer.content)?;

	let certs = signed_data
		.certificates
		.as_ref()
		.ok_or_else(|| Error::bad_request("request is missing the requester's certificate"))?;
	let requester_cert: Certificate = certs
		.iter()
		.next()
		.ok_or_else(|| Error::bad_request("certificates set is empty"))
		.and_then(|any| pkcs7::unwrap_any(any))?;

	let signer_info: SignerInfo = signed_data
		.signer_infos
		.iter()
		.next()
		.ok_or_else(|| Error::bad_request("request has no SignerInfo"))
		.and_then(|any| pkcs7::unwrap_any(any))?;
	let signed_attrs_set = signer_info
		.signed_attrs
		.as_ref()
		.ok_or_else(|| Error::bad_request("request SignerInfo has no signedAttrs"))?;
	let attrs = decode_attrs(signed_attrs_set)?;

	// RFC 5652 §5.4: the signature covers signedAttrs re-tagged as a
	// UNIVERSAL SET, the same re-tagging `build_response` does when it
	// signs its own CertRep attributes.
	let signed_attrs_der =
		signed_attrs_set.to_der().map_err(|e| Error::bad_request(format!("signedAttrs encoding failed: {e}")))?;
	verify_signer_signature(&requester_cert, &signer_info, &signed_attrs_der)?;

	let message_type = ScepMessageType::from_wire(attr_printable(&attrs, OID_SCEP_MESSAGE_TYPE)?.as_ref())?;
	let transaction_id = attr_printable(&attrs, OID_SCEP_TRANSACTION_ID)?;
	let sender_nonce = attr_octets(&attrs, OID_SCEP_SENDER_NONCE)?;

	if message_type == ScepMessageType::CertPoll {
		return Ok(ParsedRequest { message_type, transaction_id, sender_nonce, requester_cert, csr_der: None });
	}

	let econtent = signed_data
		.encap_content_info
		.econtent
		.ok_or_else(|| Error::bad_request("request has no encapsulated content"))?;
	let enveloped_content_info =
		ContentInfo::from_der(econtent.as_bytes()).map_err(|_| Error::bad_request("encapsulated content is not a valid ContentInfo"))?;
	if enveloped_content_info.content_type.to_string() != OID_PKCS7_ENVELOPED_DATA {
		return Err(Error::bad_request("encapsulated content is not EnvelopedData"));
	}
	let enveloped: EnvelopedData = pkcs7::unwrap_any(&enveloped_content_info.content)?;

	let recipient: KeyTransRecipientInfo = enveloped
		.recipient_infos
		.iter()
		.next()
		.ok_or_else(|| Error::bad_request("EnvelopedData has no RecipientInfo"))
		.and_then(|any| pkcs7::unwrap_any(any))?;

	let cek = kms.decrypt(ca_key_uri, recipient.encrypted_key.as_bytes()).await?;
	let iv = crypto::aes256_cbc_iv(&enveloped.encrypted_content_info.content_encryption_algorithm)?;
	let ciphertext = enveloped
		.encrypted_content_info
		.encrypted_content
		.ok_or_else(|| Error::bad_request("EncryptedContentInfo has no encryptedContent"))?;
	let csr_der = crypto::decrypt_content(&cek, &iv, ciphertext.as_bytes())?;

	Ok(ParsedRequest { message_type, transaction_id, sender_nonce, requester_cert, csr_der: Some(csr_der) })
}

/// Verifies `signer_info`'s signature over `signed_attrs_der` against the
/// public key in `requester_cert` — the proof of possession RFC 8894 §3.1
/// anchors every `PKIOperation` to.
fn verify_signer_signature(requester_cert: &Certificate, signer_info: &SignerInfo, signed_attrs_der: &[u8]) -> ClResult<()> {
	let oid = signer_info.signature_algorithm.oid.to_string();
	let sig = signer_info.signature.as_bytes();
	let bad_sig = || Error::bad_request("PKIOperation signature does not verify");
	let bad_key = || Error::bad_request("requester certificate key is malformed");
	let spki = &requester_cert.tbs_certificate.subject_public_key_info;

	match oid.as_str() {
		// rsaEncryption-with-sha256 (PKCS#1 v1.5).
		"1.2.840.113549.1.1.11" => {
			use rsa::pkcs8::DecodePublicKey;
			let spki_der = spki.to_der().map_err(|_| bad_key())?;
			let key = rsa::RsaPublicKey::from_public_key_der(&spki_der).map_err(|_| bad_key())?;
			use rsa::pkcs1v15::VerifyingKey;
			use rsa::signature::Verifier as _;
			let verifying_key = VerifyingKey::<Sha256>::new(key);
			let signature = rsa::pkcs1v15::Signature::try_from(sig).map_err(|_| bad_sig())?;
			verifying_key.verify(signed_attrs_der, &signature).map_err(|_| bad_sig())
		}
		// ecdsa-with-SHA256.
		"1.2.840.10045.4.3.2" => {
			let raw = spki.subject_public_key.raw_bytes();
			let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(raw).map_err(|_| bad_key())?;
			let signature = p256::ecdsa::Signature::from_der(sig).map_err(|_| bad_sig())?;
			key.verify(signed_attrs_der, &signature).map_err(|_| bad_sig())
		}
		// ecdsa-with-SHA384.
		"1.2.840.10045.4.3.3" => {
			use p384::ecdsa::signature::Verifier as _;
			let raw = spki.subject_public_key.raw_bytes();
			let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(raw).map_err(|_| bad_key())?;
			let signature = p384::ecdsa::Signature::from_der(sig).map_err(|_| bad_sig())?;
			key.verify(signed_attrs_der, &signature).map_err(|_| bad_sig())
		}
		// Ed25519.
		"1.3.101.112" => {
			let raw = spki.subject_public_key.raw_bytes();
			let bytes: [u8; 32] = raw.try_into().map_err(|_| bad_key())?;
			let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|_| bad_key())?;
			let signature = ed25519_dalek::Signature::from_slice(sig).map_err(|_| bad_sig())?;
			key.verify(signed_attrs_der, &signature).map_err(|_| bad_sig())
		}
		other => Err(Error::bad_request(format!("unsupported requester signature algorithm {other}"))),
	}
}

/// `Serial` is the certificate's DER `INTEGER` left-padded to 128 bits
/// (spec §3); `RenewalReq`/`CertPoll` need it to look up the requester's
/// own certificate record, mirroring `castellan_acme::order`'s identical
/// conversion for certificate-key revocation.
fn requester_serial(cert: &Certificate) -> ClResult<Serial> {
	let bytes = cert.tbs_certificate.serial_number.as_bytes();
	if bytes.len() > 16 {
		return Err(Error::bad_request("requester certificate serial is wider than 128 bits"));
	}
	let mut padded = [0u8; 16];
	padded[16 - bytes.len()..].copy_from_slice(bytes);
	Ok(Serial(u128::from_be_bytes(padded)))
}

async fn load_certificate(db: &dyn DbAdapter, serial: Serial) -> ClResult<CertificateRecord> {
	let bytes = db.get(Bucket::Certs, &serial.to_string()).await?;
	Ok(VersionedRecord::<CertificateRecord>::decode(&bytes)?.value)
}

fn transaction_key(provisioner_id: &str, transaction_id: &str) -> String {
	format!("{provisioner_id}/{transaction_id}")
}

/// RFC 8894 §3.1's replay-safety requirement ("a transaction ID identifies
/// one enrollment"): looks up a previously recorded `transactionId ->
/// serial` mapping before doing any signing, so a replayed `PKCSReq`
/// returns the same certificate instead of allocating a new one.
async fn lookup_transaction(db: &dyn DbAdapter, provisioner_id: &str, transaction_id: &str) -> ClResult<Option<Serial>> {
	match db.get(Bucket::ScepTransactions, &transaction_key(provisioner_id, transaction_id)).await {
		Ok(bytes) => {
			let hex = String::from_utf8(bytes).map_err(|_| Error::Internal("transaction index value is not UTF-8".into()))?;
			let serial = u128::from_str_radix(&hex, 16).map_err(|_| Error::Internal("transaction index value is not a serial".into()))?;
			Ok(Some(Serial(serial)))
		}
		Err(Error::NotFound) => Ok(None),
		Err(other) => Err(other),
	}
}

/// Records the mapping so a later replay or `CertPoll` on the same
/// transaction ID resolves to the same certificate. A conflict here just
/// means a concurrent retry of the same transaction already recorded it —
/// harmless, so it's swallowed rather than propagated.
async fn record_transaction(db: &dyn DbAdapter, provisioner_id: &str, transaction_id: &str, serial: Serial) -> ClResult<()> {
	match db
		.cmp_and_swap(
			Bucket::ScepTransactions,
			&transaction_key(provisioner_id, transaction_id),
			None,
			Some(serial.to_string().into_bytes()),
		)
		.await
	{
		Ok(()) | Err(Error::Conflict(_)) => Ok(()),
		Err(other) => Err(other),
	}
}

/// Outcome of the signing attempt, carried through to response assembly so
/// a CAS/policy rejection still produces a well-formed (if `FAILURE`)
/// `CertRep` instead of an opaque HTTP error.
enum SignOutcome {
	Issued(Vec<u8>),
	Failed(FailInfo),
}

async fn try_sign(authority: &Authority, provisioner_id: &str, csr_der: &[u8]) -> ClResult<SignOutcome> {
	let challenge_password = match extract_challenge_password(csr_der) {
		Ok(pw) => pw,
		Err(_) => return Ok(SignOutcome::Failed(FailInfo::BadRequest)),
	};
	let csr_pem = pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", csr_der.to_vec()));
	match authority.sign(&csr_pem, provisioner_id, ProvisionerProof::ScepChallenge(&challenge_password), None).await {
		Ok(record) => Ok(SignOutcome::Issued(record.der)),
		Err(Error::Unauthorized(_)) => Ok(SignOutcome::Failed(FailInfo::BadMessageCheck)),
		Err(Error::BadRequest(_)) | Err(Error::Acme(_, _)) => Ok(SignOutcome::Failed(FailInfo::BadRequest)),
		Err(other) => Err(other),
	}
}

/// `RenewalReq` (spec §4.6): the requester authenticates with its *current*
/// certificate rather than a `challengePassword`, so the CSR's key is
/// discarded in favor of `Authority::renew`'s own key-preserving reissue —
/// mirroring `server/src/rest.rs::renew`'s lookup-then-renew shape.
async fn try_renew(authority: &Authority, db: &dyn DbAdapter, provisioner_id: &str, requester_cert: &Certificate) -> ClResult<SignOutcome> {
	let serial = requester_serial(requester_cert)?;
	let current = match load_certificate(db, serial).await {
		Ok(record) => record,
		Err(Error::NotFound) => return Ok(SignOutcome::Failed(FailInfo::BadCertId)),
		Err(other) => return Err(other),
	};
	match authority.renew(&current, provisioner_id).await {
		Ok(record) => Ok(SignOutcome::Issued(record.der)),
		Err(Error::Forbidden(_)) | Err(Error::Unauthorized(_)) => Ok(SignOutcome::Failed(FailInfo::BadRequest)),
		Err(Error::BadRequest(_)) | Err(Error::Acme(_, _)) => Ok(SignOutcome::Failed(FailInfo::BadRequest)),
		Err(other) => Err(other),
	}
}

/// `CertPoll`/`GetCertInitial` (spec §4.6): this CA signs synchronously, so
/// a poll never finds a transaction still pending — it either resolves the
/// `transactionId` to the certificate issued by the matching `PKCSReq`/
/// `RenewalReq`, or reports `BadCertId` for an unknown transaction.
async fn try_cert_poll(db: &dyn DbAdapter, provisioner_id: &str, transaction_id: &str) -> ClResult<SignOutcome> {
	match lookup_transaction(db, provisioner_id, transaction_id).await? {
		Some(serial) => match load_certificate(db, serial).await {
			Ok(record) => Ok(SignOutcome::Issued(record.der)),
			Err(Error::NotFound) => Ok(SignOutcome::Failed(FailInfo::BadCertId)),
			Err(other) => Err(other),
		},
		None => Ok(SignOutcome::Failed(FailInfo::BadCertId)),
	}
}

fn serial_from_issued_der(der: &[u8]) -> ClResult<Serial> {
	let cert = Certificate::from_der(der).map_err(|_| Error::Internal("issued certificate is not valid DER".into()))?;
	requester_serial(&cert)
}

/// PKCS#9 `challengePassword` (RFC 2986 §4.1 `Attribute`), read out of the
/// CSR's own attribute set rather than the CMS signed attributes — SCEP
/// binds authorization to the CSR, not the enrollment transport.
/// `x509_parser` hands back each attribute's raw `SET OF AttributeValue`
/// DER; re-decoded here with `der` since the value can be any of the
/// usual ASN.1 string types.
fn extract_challenge_password(csr_der: &[u8]) -> ClResult<Box<str>> {
	use x509_parser::certification_request::X509CertificationRequest;
	use x509_parser::prelude::FromDer;

	let (_, csr) = X509CertificationRequest::from_der(csr_der)
		.map_err(|_| Error::bad_request("CSR could not be parsed for challengePassword"))?;
	for attr in &csr.certification_request_info.attributes {
		if attr.oid.to_string() != OID_PKCS9_CHALLENGE_PASSWORD {
			continue;
		}
		let values = SetOfVec::<Any>::from_der(attr.value)
			.map_err(|_| Error::bad_request("challengePassword attribute is malformed"))?;
		let value = values.iter().next().ok_or_else(|| Error::bad_request("challengePassword has no value"))?;
		if let Ok(s) = pkcs7::unwrap_any::<PrintableString>(value) {
			return Ok(s.as_str().into());
		}
		if let Ok(s) = pkcs7::unwrap_any::<der::asn1::Ia5String>(value) {
			return Ok(s.as_str().into());
		}
		return Err(Error::bad_request("challengePassword value is not a recognized string type"));
	}
	Err(Error::bad_request("CSR has no challengePassword attribute"))
}

/// Assembles the doubly-wrapped `CertRep` (RFC 8894 §3.3): an inner
/// degenerate `SignedData` (certificates-only, no signerInfos) carrying the
/// issued certificate or an empty certificate set on failure, encrypted to
/// the requester's self-signed certificate, then signed by the CA.
async fn build_response(
	kms: &dyn KmsAdapter,
	ca_key_uri: &KeyUri,
	ca_cert_der: &[u8],
	req: &ParsedRequest,
	outcome: &SignOutcome,
) -> ClResult<Vec<u8>> {
	let degenerate_certs: Vec<Vec<u8>> = match outcome {
		SignOutcome::Issued(der) => vec![der.clone()],
		SignOutcome::Failed(_) => Vec::new(),
	};
	let mut cert_any = Vec::with_capacity(degenerate_certs.len());
	for der in &degenerate_certs {
		let cert = Certificate::from_der(der).map_err(|_| Error::Internal("issued certificate is not valid DER".into()))?;
		cert_any.push(pkcs7::wrap_any(&cert)?);
	}
	let inner_signed_data = SignedData {
		version: 1,
		digest_algorithms: pkcs7::set_of(Vec::new())?,
		encap_content_info: EncapsulatedContentInfo { econtent_type: pkcs7::oid(OID_PKCS7_DATA)?, econtent: None },
		certificates: if cert_any.is_empty() { None } else { Some(pkcs7::set_of(cert_any)?) },
		signer_infos: pkcs7::set_of(Vec::new())?,
	};
	let inner_content_info =
		ContentInfo { content_type: pkcs7::oid(OID_PKCS7_SIGNED_DATA)?, content: pkcs7::wrap_any(&inner_signed_data)? };
	let inner_der = inner_content_info.to_der().map_err(|e| Error::Internal(format!("inner ContentInfo encoding failed: {e}")))?;

	let (cek, iv, ciphertext) = crypto::encrypt_content(&inner_der);
	let recipient_spki_der = req
		.requester_cert
		.tbs_certificate
		.subject_public_key_info
		.to_der()
		.map_err(|e| Error::Internal(format!("requester SPKI re-encoding failed: {e}")))?;
	let encrypted_key = crypto::wrap_key_for_recipient(&recipient_spki_der, &cek)?;

	let recipient_info = KeyTransRecipientInfo {
		version: 0,
		rid: IssuerAndSerialNumber {
			issuer: req.requester_cert.tbs_certificate.issuer.clone(),
			serial_number: req.requester_cert.tbs_certificate.serial_number.clone(),
		},
		key_encryption_algorithm: crypto::rsaes_oaep_sha256_algorithm()?,
		encrypted_key: OctetString::new(encrypted_key).map_err(|_| Error::Internal("encryptedKey encoding failed".into()))?,
	};
	let enveloped_data = EnvelopedData {
		version: 0,
		recipient_infos: pkcs7::set_of(vec![pkcs7::wrap_any(&recipient_info)?])?,
		encrypted_content_info: EncryptedContentInfo {
			content_type: pkcs7::oid(OID_PKCS7_DATA)?,
			content_encryption_algorithm: crypto::aes256_cbc_algorithm(&iv)?,
			encrypted_content: Some(
				OctetString::new(ciphertext).map_err(|_| Error::Internal("encryptedContent encoding failed".into()))?,
			),
		},
	};
	let enveloped_content_info =
		ContentInfo { content_type: pkcs7::oid(OID_PKCS7_ENVELOPED_DATA)?, content: pkcs7::wrap_any(&enveloped_data)? };
	let enveloped_der =
		enveloped_content_info.to_der().map_err(|e| Error::Internal(format!("EnvelopedData ContentInfo encoding failed: {e}")))?;

	let mut response_nonce = [0u8; 16];
	rand::thread_rng().fill_bytes(&mut response_nonce);

	let (pki_status, fail_info_attr) = match outcome {
		SignOutcome::Issued(_) => (PKI_STATUS_SUCCESS, None),
		SignOutcome::Failed(info) => (PKI_STATUS_FAILURE, Some(printable_attr(OID_SCEP_FAIL_INFO, info.code())?)),
	};

	let message_digest = Sha256::digest(&enveloped_der).to_vec();
	let mut signed_attrs = vec![
		printable_attr(OID_PKCS9_CONTENT_TYPE, OID_PKCS7_DATA)?,
		octet_attr(OID_PKCS9_MESSAGE_DIGEST, &message_digest)?,
		printable_attr(OID_SCEP_MESSAGE_TYPE, MESSAGE_TYPE_CERT_REP)?,
		printable_attr(OID_SCEP_PKI_STATUS, pki_status)?,
		printable_attr(OID_SCEP_TRANSACTION_ID, &req.transaction_id)?,
		octet_attr(OID_SCEP_SENDER_NONCE, &response_nonce)?,
		octet_attr(OID_SCEP_RECIPIENT_NONCE, &req.sender_nonce)?,
	];
	if let Some(fail_info) = fail_info_attr {
		signed_attrs.push(fail_info);
	}
	let signed_attrs_any: Vec<Any> = signed_attrs.iter().map(pkcs7::wrap_any).collect::<ClResult<_>>()?;
	let signed_attrs_set = pkcs7::set_of(signed_attrs_any)?;
	// RFC 5652 §5.4: the signature covers the attributes re-tagged as a
	// UNIVERSAL SET (the wire encoding tags them `[0] IMPLICIT` instead).
	let attrs_for_signature =
		signed_attrs_set.to_der().map_err(|e| Error::Internal(format!("signedAttrs encoding failed: {e}")))?;

	let algorithm = kms.algorithm(ca_key_uri).await?;
	let digest = digest_for(algorithm, &attrs_for_signature);
	let raw_signature = kms.sign(ca_key_uri, &digest).await?;

	let ca_cert = Certificate::from_der(ca_cert_der).map_err(|_| Error::Internal("CA certificate is not valid DER".into()))?;
	let signer_info = SignerInfo {
		version: 1,
		sid: IssuerAndSerialNumber {
			issuer: ca_cert.tbs_certificate.issuer.clone(),
			serial_number: ca_cert.tbs_certificate.serial_number.clone(),
		},
		digest_algorithm: x509_cert::spki::AlgorithmIdentifierOwned { oid: pkcs7::oid(crypto::OID_SHA256)?, parameters: None },
		signed_attrs: Some(signed_attrs_set),
		signature_algorithm: signature_algorithm_identifier(algorithm)?,
		signature: OctetString::new(raw_signature).map_err(|_| Error::Internal("signature encoding failed".into()))?,
		unsigned_attrs: None,
	};

	let outer_signed_data = SignedData {
		version: 1,
		digest_algorithms: pkcs7::set_of(vec![pkcs7::wrap_any(&x509_cert::spki::AlgorithmIdentifierOwned {
			oid: pkcs7::oid(crypto::OID_SHA256)?,
			parameters: None,
		})?])?,
		encap_content_info: EncapsulatedContentInfo {
			econtent_type: pkcs7::oid(OID_PKCS7_DATA)?,
			econtent: Some(OctetString::new(enveloped_der).map_err(|_| Error::Internal("econtent encoding failed".into()))?),
		},
		certificates: Some(pkcs7::set_of(vec![pkcs7::wrap_any(&ca_cert)?])?),
		signer_infos: pkcs7::set_of(vec![pkcs7::wrap_any(&signer_info)?])?,
	};
	let outer = ContentInfo { content_type: pkcs7::oid(OID_PKCS7_SIGNED_DATA)?, content: pkcs7::wrap_any(&outer_signed_data)? };
	outer.to_der().map_err(|e| Error::Internal(format!("response ContentInfo encoding failed: {e}")))
}

fn signature_algorithm_identifier(alg: SignatureAlgorithm) -> ClResult<x509_cert::spki::AlgorithmIdentifierOwned> {
	let oid = match alg {
		SignatureAlgorithm::Ed25519 => "1.3.101.112",
		SignatureAlgorithm::EcdsaP256Sha256 => "1.2.840.10045.4.3.2",
		SignatureAlgorithm::EcdsaP384Sha384 => "1.2.840.10045.4.3.3",
		SignatureAlgorithm::RsaPkcs1Sha256 => "1.2.840.113549.1.1.11",
	};
	Ok(x509_cert::spki::AlgorithmIdentifierOwned { oid: pkcs7::oid(oid)?, parameters: None })
}

/// The full `PKIOperation` handler: parse, verify the outer CMS signature,
/// dispatch by `messageType` to `Authority::sign`/`Authority::renew`/the
/// transaction index, and answer with a signed, encrypted `CertRep`.
///
/// `PKCSReq`/`RenewalReq` consult `Bucket::ScepTransactions` before signing
/// anything: a replay of a `transactionId` already seen returns the
/// certificate issued the first time instead of allocating a new one
/// (RFC 8894 §3.1).
pub async fn pki_operation(
	authority: &Authority,
	db: &dyn DbAdapter,
	kms: &dyn KmsAdapter,
	ca_key_uri: &KeyUri,
	ca_cert_der: &[u8],
	provisioner_id: &str,
	body: &[u8],
) -> ClResult<Vec<u8>> {
	let parsed = parse_request(kms, ca_key_uri, body).await?;

	let outcome = match parsed.message_type {
		ScepMessageType::CertPoll => try_cert_poll(db, provisioner_id, &parsed.transaction_id).await?,
		ScepMessageType::PkcsReq | ScepMessageType::RenewalReq => {
			match lookup_transaction(db, provisioner_id, &parsed.transaction_id).await? {
				Some(serial) => match load_certificate(db, serial).await {
					Ok(record) => SignOutcome::Issued(record.der),
					Err(Error::NotFound) => SignOutcome::Failed(FailInfo::BadCertId),
					Err(other) => return Err(other),
				},
				None => {
					let outcome = if parsed.message_type == ScepMessageType::PkcsReq {
						let csr_der = parsed
							.csr_der
							.as_deref()
							.ok_or_else(|| Error::Internal("PKCSReq is missing its CSR".into()))?;
						try_sign(authority, provisioner_id, csr_der).await?
					} else {
						try_renew(authority, db, provisioner_id, &parsed.requester_cert).await?
					};
					if let SignOutcome::Issued(der) = &outcome {
						let serial = serial_from_issued_der(der)?;
						record_transaction(db, provisioner_id, &parsed.transaction_id, serial).await?;
					}
					outcome
				}
			}
		}
	};

	build_response(kms, ca_key_uri, ca_cert_der, &parsed, &outcome).await
}

// vim: ts=4
