//! DER assembly for issued certificates (spec §4.7 step 7: "Marshal TBS,
//! request signature from the Signer, assemble the final cert"). Built
//! directly on `x509-cert`/`der`/`spki` rather than `rcgen`, since the
//! signer here is an async KMS handle, not a local key `rcgen` can hold —
//! the TBS bytes are marshaled, hashed per the key's algorithm, handed to
//! `KmsAdapter::sign`, and the signature is spliced back in.

use std::str::FromStr;

use der::asn1::{BitString, Ia5String, ObjectIdentifier, OctetString};
use der::{Decode, Encode};
use sha2::{Digest, Sha256, Sha384};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages, SubjectAltName};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};
use x509_cert::{Certificate, TbsCertificate, Version};

use castellan_types::kms_adapter::{KeyUri, KmsAdapter, SignatureAlgorithm};
use castellan_types::model::{Identifier, IdentifierType};
use castellan_types::prelude::*;

fn oid(dotted: &str) -> ObjectIdentifier {
	ObjectIdentifier::new(dotted).unwrap_or(ObjectIdentifier::new_unwrap("2.5.4.3"))
}

fn signature_algorithm_identifier(alg: SignatureAlgorithm) -> AlgorithmIdentifierOwned {
	let oid = match alg {
		SignatureAlgorithm::Ed25519 => oid("1.3.101.112"),
		SignatureAlgorithm::EcdsaP256Sha256 => oid("1.2.840.10045.4.3.2"),
		SignatureAlgorithm::EcdsaP384Sha384 => oid("1.2.840.10045.4.3.3"),
		SignatureAlgorithm::RsaPkcs1Sha256 => oid("1.2.840.113549.1.1.11"),
	};
	AlgorithmIdentifierOwned { oid, parameters: None }
}

/// The bytes actually submitted to `KmsAdapter::sign`: EdDSA signs the raw
/// message, every other algorithm here signs a SHA-2 digest of it.
fn digest_for(alg: SignatureAlgorithm, message: &[u8]) -> Vec<u8> {
	match alg {
		SignatureAlgorithm::Ed25519 => message.to_vec(),
		SignatureAlgorithm::EcdsaP256Sha256 | SignatureAlgorithm::RsaPkcs1Sha256 => {
			Sha256::digest(message).to_vec()
		}
		SignatureAlgorithm::EcdsaP384Sha384 => Sha384::digest(message).to_vec(),
	}
}

fn general_name_for(identifier: &Identifier) -> ClResult<GeneralName> {
	match identifier.kind {
		IdentifierType::Dns | IdentifierType::Permanentidentifier => {
			let name = Ia5String::new(identifier.value.as_ref())
				.map_err(|_| Error::bad_request("SAN is not valid IA5String"))?;
			Ok(GeneralName::DnsName(name))
		}
		IdentifierType::Email => {
			let name = Ia5String::new(identifier.value.as_ref())
				.map_err(|_| Error::bad_request("SAN is not valid IA5String"))?;
			Ok(GeneralName::Rfc822Name(name))
		}
		IdentifierType::Uri => {
			let name = Ia5String::new(identifier.value.as_ref())
				.map_err(|_| Error::bad_request("SAN is not valid IA5String"))?;
			Ok(GeneralName::UniformResourceIdentifier(name))
		}
		IdentifierType::Ip => {
			let octets: Vec<u8> = identifier
				.value
				.parse::<std::net::IpAddr>()
				.map(|ip| match ip {
					std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
					std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
				})
				.map_err(|_| Error::bad_request("SAN is not a valid IP address"))?;
			Ok(GeneralName::IpAddress(OctetString::new(octets).map_err(|_| {
				Error::Internal("IP SAN encoding failed".into())
			})?))
		}
	}
}

fn key_usage_bits(usages: &[Box<str>]) -> KeyUsages {
	let mut bits = KeyUsages::empty();
	for usage in usages {
		bits |= match usage.as_ref() {
			"digitalSignature" => KeyUsages::DigitalSignature,
			"keyEncipherment" => KeyUsages::KeyEncipherment,
			"keyAgreement" => KeyUsages::KeyAgreement,
			"keyCertSign" => KeyUsages::KeyCertSign,
			"cRLSign" => KeyUsages::CRLSign,
			"nonRepudiation" => KeyUsages::NonRepudiation,
			_ => KeyUsages::empty(),
		};
	}
	bits
}

fn extended_key_usage_oid(name: &str) -> Option<ObjectIdentifier> {
	Some(match name {
		"serverAuth" => oid("1.3.6.1.5.5.7.3.1"),
		"clientAuth" => oid("1.3.6.1.5.5.7.3.2"),
		"codeSigning" => oid("1.3.6.1.5.5.7.3.3"),
		"emailProtection" => oid("1.3.6.1.5.5.7.3.4"),
		"ocspSigning" => oid("1.3.6.1.5.5.7.3.9"),
		_ => return None,
	})
}

/// Everything `build_and_sign` needs beyond the already-rendered
/// `CertificateSpec`: the issuer's name, the requester's SPKI, and the
/// signing key to use.
pub struct SigningRequest<'a> {
	pub issuer_name: &'a Name,
	pub subject_cn: &'a str,
	pub sans: &'a [Identifier],
	pub key_usages: &'a [Box<str>],
	pub extended_key_usages: &'a [Box<str>],
	pub not_before: Timestamp,
	pub not_after: Timestamp,
	pub serial: Serial,
	pub subject_public_key_der: &'a [u8],
}

/// Builds the TBS certificate, signs it through `kms`, and returns the
/// assembled DER (spec §4.7 steps 6-7).
pub async fn build_and_sign(
	req: SigningRequest<'_>,
	kms: &dyn KmsAdapter,
	key_uri: &KeyUri,
) -> ClResult<Vec<u8>> {
	let algorithm = kms.algorithm(key_uri).await?;
	let signature_alg_id = signature_algorithm_identifier(algorithm);

	let subject = Name::from_str(&format!("CN={}", req.subject_cn))
		.map_err(|_| Error::bad_request("subject CN is not a valid DistinguishedName"))?;
	let spki = SubjectPublicKeyInfoOwned::from_der(req.subject_public_key_der)
		.map_err(|_| Error::bad_request("CSR public key is not valid SPKI DER"))?;

	let validity = Validity {
		not_before: Time::try_from(std::time::UNIX_EPOCH + std::time::Duration::from_secs(req.not_before.0.max(0) as u64))
			.map_err(|_| Error::Internal("notBefore out of ASN.1 Time range".into()))?,
		not_after: Time::try_from(std::time::UNIX_EPOCH + std::time::Duration::from_secs(req.not_after.0.max(0) as u64))
			.map_err(|_| Error::Internal("notAfter out of ASN.1 Time range".into()))?,
	};

	let mut extensions = Vec::new();
	extensions.push(encode_extension(
		"2.5.29.19",
		false,
		&BasicConstraints { ca: false, path_len_constraint: None },
	)?);

	let ku_bits = key_usage_bits(req.key_usages);
	if !ku_bits.is_empty() {
		extensions.push(encode_extension("2.5.29.15", true, &KeyUsage(ku_bits))?);
	}

	let eku_oids: Vec<ObjectIdentifier> =
		req.extended_key_usages.iter().filter_map(|name| extended_key_usage_oid(name)).collect();
	if !eku_oids.is_empty() {
		extensions.push(encode_extension("2.5.29.37", false, &ExtendedKeyUsage(eku_oids))?);
	}

	if !req.sans.is_empty() {
		let names = req.sans.iter().map(general_name_for).collect::<ClResult<Vec<_>>>()?;
		extensions.push(encode_extension("2.5.29.17", false, &SubjectAltName(names))?);
	}

	let tbs = TbsCertificate {
		version: Version::V3,
		serial_number: SerialNumber::new(&req.serial.to_be_bytes())
			.map_err(|_| Error::Internal("serial does not fit ASN.1 INTEGER encoding".into()))?,
		signature: signature_alg_id.clone(),
		issuer: req.issuer_name.clone(),
		validity,
		subject,
		subject_public_key_info: spki,
		issuer_unique_id: None,
		subject_unique_id: None,
		extensions: Some(extensions),
	};

	let tbs_der = tbs.to_der().map_err(|e| Error::Internal(format!("TBS encoding failed: {e}")))?;
	let digest = digest_for(algorithm, &tbs_der);
	let raw_signature = kms.sign(key_uri, &digest).await?;

	let certificate = Certificate {
		tbs_certificate: tbs,
		signature_algorithm: signature_alg_id,
		signature: BitString::from_bytes(&raw_signature)
			.map_err(|_| Error::Internal("signature does not fit BIT STRING encoding".into()))?,
	};

	certificate.to_der().map_err(|e| Error::Internal(format!("certificate encoding failed: {e}")))
}

fn encode_extension<T: Encode>(oid_str: &str, critical: bool, value: &T) -> ClResult<Extension> {
	let bytes = value.to_der().map_err(|e| Error::Internal(format!("extension encoding failed: {e}")))?;
	Ok(Extension {
		extn_id: oid(oid_str),
		critical,
		extn_value: OctetString::new(bytes).map_err(|e| Error::Internal(format!("{e}")))?,
	})
}

// vim: ts=4
