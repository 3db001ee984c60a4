//! The issuance pipeline (spec §4.7). `Authority::sign` is the nine-step
//! algorithm the spec names; `renew` and `revoke` are its two siblings.
//! Every audit-relevant outcome is logged as a `tracing` event under
//! `target: "castellan::audit"` rather than a bespoke log format, matching
//! the teacher's use of `tracing` for everything observable.

use std::str::FromStr;
use std::sync::Arc;

use x509_parser::prelude::FromDer;
use x509_parser::certification_request::X509CertificationRequest;

use castellan_types::db_adapter::{Bucket, DbAdapter};
use castellan_types::kms_adapter::{KeyUri, KmsAdapter};
use castellan_types::model::{CertificateRecord, Identifier, IdentifierType, RevocationReason, RevocationRecord};
use castellan_types::prelude::*;
use castellan_types::storage::VersionedRecord;

use crate::certbuild::{self, SigningRequest};
use crate::policy;
use crate::provisioner::{Provisioner, ProvisionerProof};
use crate::registry::ProvisionerRegistry;
use crate::template::{CsrTemplateInput, TemplateEngine};

/// At most one CAS retry on a serial collision (spec §4.7 step 6:
/// "astronomically rare; at most one retry").
const MAX_SERIAL_RETRIES: usize = 2;

#[derive(Debug)]
pub struct Authority {
	db: Arc<dyn DbAdapter>,
	kms: Arc<dyn KmsAdapter>,
	registry: Arc<ProvisionerRegistry>,
	templates: TemplateEngine,
	ca_key_uri: KeyUri,
	ca_name: x509_cert::name::Name,
	ca_serial: Serial,
}

impl Authority {
	pub fn new(
		db: Arc<dyn DbAdapter>,
		kms: Arc<dyn KmsAdapter>,
		registry: Arc<ProvisionerRegistry>,
		ca_subject_cn: &str,
		ca_key_uri: KeyUri,
		ca_serial: Serial,
	) -> ClResult<Self> {
		let ca_name = x509_cert::name::Name::from_str(&format!("CN={ca_subject_cn}"))
			.map_err(|_| Error::Internal("CA subject CN is not a valid DistinguishedName".into()))?;
		Ok(Self { db, kms, registry, templates: TemplateEngine::new(), ca_key_uri, ca_name, ca_serial })
	}

	fn parse_csr(&self, csr_pem: &str) -> ClResult<(Vec<u8>, Option<Box<str>>, Vec<Identifier>)> {
		let pem = pem::parse(csr_pem).map_err(|_| Error::bad_request("CSR is not valid PEM"))?;
		let (_, csr) = X509CertificationRequest::from_der(pem.contents())
			.map_err(|_| Error::acme(AcmeErrorKind::BadCsr, "CSR could not be parsed"))?;

		csr.verify_signature().map_err(|_| {
			Error::acme(AcmeErrorKind::BadCsr, "CSR signature does not match its embedded public key")
		})?;

		let spki_der = csr.certification_request_info.subject_pki.raw.to_vec();

		let requested_cn = csr
			.certification_request_info
			.subject
			.iter_common_name()
			.next()
			.and_then(|cn| cn.as_str().ok())
			.map(|s| s.into());

		// CSR-embedded SANs (the `1.2.840.113549.1.9.14` extensionRequest
		// attribute) are out of scope here deliberately: spec §4.2 has the
		// template, not the CSR, be the source of truth for SANs, so a
		// client can't request anything a template/policy wouldn't allow.
		Ok((spki_der, requested_cn, Vec::new()))
	}

	/// Spec §4.7 `Sign`: the nine-step issuance algorithm.
	pub async fn sign(
		&self,
		csr_pem: &str,
		provisioner_id: &str,
		proof: ProvisionerProof<'_>,
		acme_account_id: Option<&str>,
	) -> ClResult<CertificateRecord> {
		// Step 1: identify the provisioner.
		let provisioner = self
			.registry
			.get(provisioner_id)
			.ok_or_else(|| Error::bad_request("unknown provisioner"))?;

		// Step 2: authorize.
		let sign_options = provisioner.authorize_sign(self.db.as_ref(), proof).await?;

		// Step 3: render the candidate certificate spec.
		let (spki_der, requested_cn, requested_sans) = self.parse_csr(csr_pem)?;
		let csr_input = CsrTemplateInput {
			public_key_der: spki_der.clone(),
			requested_cn,
			requested_sans,
		};
		let template_name = provisioner
			.options()
			.template_name
			.clone()
			.ok_or_else(|| Error::Internal("provisioner has no template configured".into()))?;
		let template_body = self.load_template(&template_name).await?;
		let mut spec = self.templates.render(
			&template_body,
			&sign_options.claims,
			&sign_options.template_data,
			&csr_input,
		)?;

		// Step 4: clamp to provisioner claims.
		let claims = provisioner.claims();
		if claims.disable_issuance {
			return Err(Error::Forbidden("provisioner has issuance disabled".into()));
		}
		let requested_lifetime = spec.not_after.0 - spec.not_before.0;
		if requested_lifetime > claims.max_lifetime_secs {
			spec.not_after = spec.not_before.add_seconds(claims.max_lifetime_secs);
		}
		if requested_lifetime <= 0 {
			return Err(Error::acme(AcmeErrorKind::Malformed, "certificate lifetime must be positive"));
		}

		// Step 5: policy allow/deny.
		if let Err(violation) = policy::check_identifiers(&provisioner.options().policy, &spec.sans) {
			return Err(Error::acme(
				AcmeErrorKind::RejectedIdentifier,
				format!("identifier {} rejected by policy rule {}", violation.identifier.value, violation.rule),
			));
		}

		// Steps 6-7: allocate a serial, marshal, sign.
		let (serial, der) = self.allocate_and_sign(&spec, &spki_der).await?;

		// Step 8: persist and audit.
		let record = CertificateRecord {
			serial,
			der,
			issuer_serial: self.ca_serial,
			issued_at: Timestamp::now(),
			provisioner_id: provisioner_id.into(),
			acme_account_id: acme_account_id.map(Into::into),
			revocation: None,
		};
		self.persist_new(&record).await?;

		tracing::info!(
			target: "castellan::audit",
			serial = %record.serial,
			provisioner_id = provisioner_id,
			acme_account_id = acme_account_id.unwrap_or(""),
			subject_cn = %spec.subject_cn,
			san_count = spec.sans.len(),
			"certificate issued"
		);

		Ok(record)
	}

	/// Spec §4.7 `Renew`: subject and SANs preserved, lifetime re-clamped,
	/// a fresh serial allocated.
	pub async fn renew(
		&self,
		current: &CertificateRecord,
		provisioner_id: &str,
	) -> ClResult<CertificateRecord> {
		if current.is_revoked() {
			return Err(Error::Forbidden("certificate is revoked".into()));
		}
		let provisioner = self
			.registry
			.get(provisioner_id)
			.ok_or_else(|| Error::bad_request("unknown provisioner"))?;
		provisioner.authorize_renew(current).await?;

		let (_, cert) = x509_parser::certificate::X509Certificate::from_der(&current.der)
			.map_err(|_| Error::Internal("stored certificate is malformed".into()))?;
		let subject_cn =
			cert.subject().iter_common_name().next().and_then(|cn| cn.as_str().ok()).unwrap_or("");
		let spki_der = cert.public_key().raw.to_vec();
		let sans = extract_sans(&cert);

		let claims = provisioner.claims();
		let not_before = Timestamp::now();
		let not_after = not_before.add_seconds(claims.default_lifetime_secs.min(claims.max_lifetime_secs));

		let spec = crate::template::CertificateSpec {
			subject_cn: subject_cn.into(),
			sans,
			key_usages: vec!["digitalSignature".into()],
			extended_key_usages: vec!["serverAuth".into()],
			not_before,
			not_after,
		};

		let (serial, der) = self.allocate_and_sign(&spec, &spki_der).await?;
		let record = CertificateRecord {
			serial,
			der,
			issuer_serial: self.ca_serial,
			issued_at: Timestamp::now(),
			provisioner_id: provisioner_id.into(),
			acme_account_id: current.acme_account_id.clone(),
			revocation: None,
		};
		self.persist_new(&record).await?;

		tracing::info!(
			target: "castellan::audit",
			old_serial = %current.serial,
			new_serial = %record.serial,
			provisioner_id = provisioner_id,
			"certificate renewed"
		);

		Ok(record)
	}

	/// Spec §4.7 `Revoke`: CAS-inserts a revocation record, then bumps the
	/// CRL-regeneration debounce flag the scheduler picks up (spec §5 "may
	/// be lazy with a short debounce").
	pub async fn revoke(&self, serial: Serial, reason: RevocationReason) -> ClResult<()> {
		let key = serial.to_string();
		let bytes = self.db.get(Bucket::Certs, &key).await?;
		let mut record: VersionedRecord<CertificateRecord> = VersionedRecord::decode(&bytes)?;
		if record.value.revocation.is_some() {
			return Err(Error::acme(AcmeErrorKind::AlreadyRevoked, "certificate is already revoked"));
		}

		let old_bytes = bytes.clone();
		record.value.revocation =
			Some(RevocationRecord { reason, revoked_at: Timestamp::now(), crl_number: 0 });
		let new_bytes = VersionedRecord::new(record.value).encode()?;
		self.db.cmp_and_swap(Bucket::Certs, &key, Some(old_bytes), Some(new_bytes)).await?;

		self.db.put(Bucket::Crl, "dirty", b"1".to_vec()).await?;

		tracing::info!(target: "castellan::audit", serial = %serial, ?reason, "certificate revoked");
		Ok(())
	}

	pub fn ca_name(&self) -> &x509_cert::name::Name {
		&self.ca_name
	}

	pub fn ca_key_uri(&self) -> &KeyUri {
		&self.ca_key_uri
	}

	async fn load_template(&self, name: &str) -> ClResult<String> {
		let bytes = self.db.get(Bucket::Provisioners, &format!("template/{name}")).await?;
		String::from_utf8(bytes).map_err(|_| Error::Internal("template is not valid UTF-8".into()))
	}

	async fn allocate_and_sign(
		&self,
		spec: &crate::template::CertificateSpec,
		subject_public_key_der: &[u8],
	) -> ClResult<(Serial, Vec<u8>)> {
		for attempt in 0..=MAX_SERIAL_RETRIES {
			let serial = Serial::random();
			let key = serial.to_string();

			let der = certbuild::build_and_sign(
				SigningRequest {
					issuer_name: &self.ca_name,
					subject_cn: &spec.subject_cn,
					sans: &spec.sans,
					key_usages: &spec.key_usages,
					extended_key_usages: &spec.extended_key_usages,
					not_before: spec.not_before,
					not_after: spec.not_after,
					serial,
					subject_public_key_der,
				},
				self.kms.as_ref(),
				&self.ca_key_uri,
			)
			.await?;

			match self.db.cmp_and_swap(Bucket::Certs, &key, None, None).await {
				Ok(()) => return Ok((serial, der)),
				Err(Error::Conflict(_)) if attempt < MAX_SERIAL_RETRIES => continue,
				Err(Error::Conflict(_)) => {
					return Err(Error::Internal("serial allocation exhausted its retries".into()))
				}
				Err(other) => return Err(other),
			}
		}
		unreachable!("loop always returns or errors")
	}

	async fn persist_new(&self, record: &CertificateRecord) -> ClResult<()> {
		let key = record.serial.to_string();
		let bytes = VersionedRecord::new(record.clone()).encode()?;
		// The reservation CAS in `allocate_and_sign` already proved `key`
		// was absent; this CAS just writes the real record into that slot.
		self.db.cmp_and_swap(Bucket::Certs, &key, None, Some(bytes)).await
	}
}

fn extract_sans(cert: &x509_parser::certificate::X509Certificate) -> Vec<Identifier> {
	use x509_parser::extensions::GeneralName as ParsedGeneralName;

	let Ok(Some(san_ext)) = cert.subject_alternative_name() else { return Vec::new() };
	san_ext
		.value
		.general_names
		.iter()
		.filter_map(|name| match name {
			ParsedGeneralName::DNSName(s) => {
				Some(Identifier { kind: IdentifierType::Dns, value: (*s).into() })
			}
			ParsedGeneralName::RFC822Name(s) => {
				Some(Identifier { kind: IdentifierType::Email, value: (*s).into() })
			}
			ParsedGeneralName::URI(s) => Some(Identifier { kind: IdentifierType::Uri, value: (*s).into() }),
			ParsedGeneralName::IPAddress(bytes) => {
				std::net::IpAddr::try_from(*bytes).ok().map(|ip| Identifier {
					kind: IdentifierType::Ip,
					value: ip.to_string().into(),
				})
			}
			_ => None,
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use castellan_types::db_adapter::test_double::MemoryDb;
	use castellan_types::kms_adapter::test_double::MemoryKms;
	use castellan_types::kms_adapter::CreateKeyOptions;

	#[tokio::test]
	async fn revoke_is_rejected_for_an_unknown_serial() {
		let db = Arc::new(MemoryDb::new());
		let kms = Arc::new(MemoryKms::new());
		let registry = Arc::new(ProvisionerRegistry::new());
		let (_, ca_key) =
			kms.create_key(CreateKeyOptions { algorithm: castellan_types::kms_adapter::KeyAlgorithm::Ed25519, passphrase: None })
				.await
				.unwrap();

		let authority =
			Authority::new(db, kms, registry, "Test Root CA", ca_key, Serial::random()).unwrap();
		let result = authority.revoke(Serial::random(), RevocationReason::Unspecified).await;
		assert!(matches!(result, Err(Error::NotFound)));
	}
}

// vim: ts=4
