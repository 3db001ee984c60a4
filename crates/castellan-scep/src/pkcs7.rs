//! A minimal RFC 5652 (CMS) subset, hand-derived directly on `der` rather
//! than built through the `cms` crate's builder API: that API expects a
//! local `signature::Signer`, and the CA's signer is an async KMS handle —
//! the same reason `castellan_pki::certbuild` hand-assembles `x509-cert`
//! types instead of driving them through `rcgen`. Every "SET OF" field is
//! carried as `SetOfVec<Any>` so the concrete element type never has to
//! implement `DerOrd` itself; callers re-decode the element they expect.

use der::asn1::{Any, ObjectIdentifier, OctetString, SetOfVec};
use der::{Decode, Encode, Sequence};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;

use castellan_types::prelude::*;

pub fn oid(dotted: &str) -> ClResult<ObjectIdentifier> {
	ObjectIdentifier::new(dotted).map_err(|_| Error::Internal(format!("malformed OID literal {dotted}")))
}

pub fn wrap_any<T: Encode>(value: &T) -> ClResult<Any> {
	let der = value.to_der().map_err(|e| Error::Internal(format!("DER encoding failed: {e}")))?;
	Any::from_der(&der).map_err(|e| Error::Internal(format!("re-decoding as ANY failed: {e}")))
}

pub fn unwrap_any<T: for<'a> Decode<'a>>(value: &Any) -> ClResult<T> {
	let der = value.to_der().map_err(|e| Error::Internal(format!("ANY re-encoding failed: {e}")))?;
	T::from_der(&der).map_err(|_| Error::bad_request("CMS element has an unexpected ASN.1 shape"))
}

pub fn set_of(items: Vec<Any>) -> ClResult<SetOfVec<Any>> {
	let mut set = SetOfVec::new();
	for item in items {
		set.insert(item).map_err(|_| Error::Internal("SET OF insertion failed".into()))?;
	}
	Ok(set)
}

#[derive(Clone, Debug, Sequence)]
pub struct ContentInfo {
	pub content_type: ObjectIdentifier,
	#[asn1(context_specific = "0", explicit = "true")]
	pub content: Any,
}

#[derive(Clone, Debug, Sequence)]
pub struct IssuerAndSerialNumber {
	pub issuer: Name,
	pub serial_number: SerialNumber,
}

/// `type OID, values SET OF ANY` (RFC 5652 §11.1). Used both for the
/// SCEP-specific signed attributes (transactionID, messageType, ...) and
/// the standard `contentType`/`messageDigest` pair.
#[derive(Clone, Debug, Sequence)]
pub struct Attribute {
	pub oid: ObjectIdentifier,
	pub values: SetOfVec<Any>,
}

impl Attribute {
	pub fn single(oid: ObjectIdentifier, value: Any) -> ClResult<Self> {
		Ok(Self { oid, values: set_of(vec![value])? })
	}

	pub fn single_value(&self) -> ClResult<&Any> {
		self.values.iter().next().ok_or_else(|| Error::bad_request("attribute has no value"))
	}
}

#[derive(Clone, Debug, Sequence)]
pub struct EncapsulatedContentInfo {
	pub econtent_type: ObjectIdentifier,
	#[asn1(context_specific = "0", explicit = "true", optional = "true")]
	pub econtent: Option<OctetString>,
}

#[derive(Clone, Debug, Sequence)]
pub struct SignerInfo {
	pub version: u8,
	pub sid: IssuerAndSerialNumber,
	pub digest_algorithm: AlgorithmIdentifierOwned,
	#[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
	pub signed_attrs: Option<SetOfVec<Any>>,
	pub signature_algorithm: AlgorithmIdentifierOwned,
	pub signature: OctetString,
	#[asn1(context_specific = "1", tag_mode = "IMPLICIT", optional = "true")]
	pub unsigned_attrs: Option<SetOfVec<Any>>,
}

#[derive(Clone, Debug, Sequence)]
pub struct SignedData {
	pub version: u8,
	pub digest_algorithms: SetOfVec<Any>,
	pub encap_content_info: EncapsulatedContentInfo,
	#[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
	pub certificates: Option<SetOfVec<Any>>,
	pub signer_infos: SetOfVec<Any>,
}

#[derive(Clone, Debug, Sequence)]
pub struct KeyTransRecipientInfo {
	pub version: u8,
	pub rid: IssuerAndSerialNumber,
	pub key_encryption_algorithm: AlgorithmIdentifierOwned,
	pub encrypted_key: OctetString,
}

#[derive(Clone, Debug, Sequence)]
pub struct EncryptedContentInfo {
	pub content_type: ObjectIdentifier,
	pub content_encryption_algorithm: AlgorithmIdentifierOwned,
	#[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
	pub encrypted_content: Option<OctetString>,
}

#[derive(Clone, Debug, Sequence)]
pub struct EnvelopedData {
	pub version: u8,
	pub recipient_infos: SetOfVec<Any>,
	pub encrypted_content_info: EncryptedContentInfo,
}

// vim: ts=4
