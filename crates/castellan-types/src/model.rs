//! Certificate and ACME resource data model (spec §3).

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::types::{Serial, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RevocationReason {
	Unspecified,
	KeyCompromise,
	CaCompromise,
	AffiliationChanged,
	Superseded,
	CessationOfOperation,
	CertificateHold,
	RemoveFromCrl,
	PrivilegeWithdrawn,
	AaCompromise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationRecord {
	pub reason: RevocationReason,
	pub revoked_at: Timestamp,
	pub crl_number: u64,
}

/// A single issued certificate (spec §3 "Certificate record").
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
	pub serial: Serial,
	pub der: Vec<u8>,
	pub issuer_serial: Serial,
	pub issued_at: Timestamp,
	pub provisioner_id: Box<str>,
	/// Set when the certificate was issued against an ACME order, so audit
	/// records and revocation-by-account-key can trace ownership.
	pub acme_account_id: Option<Box<str>>,
	pub revocation: Option<RevocationRecord>,
}

impl CertificateRecord {
	pub fn is_revoked(&self) -> bool {
		self.revocation.is_some()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
	Valid,
	Deactivated,
	Revoked,
}

/// ACME account (spec §3, RFC 8555 §7.1.2). `key_thumbprint` is the JWK
/// thumbprint (RFC 7638) of the account key and, together with
/// `provisioner_id`, forms the uniqueness key enforced via
/// `Bucket::AcmeAccountByKeyId`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeAccount {
	pub id: Box<str>,
	pub provisioner_id: Box<str>,
	pub key_thumbprint: Box<str>,
	/// The account public key as a JWK, stored verbatim so `kid`-addressed
	/// requests can be verified without reconstructing it.
	pub jwk: serde_json::Value,
	pub status: AccountStatus,
	pub contacts: Vec<Box<str>>,
	pub eab_key_id: Option<Box<str>>,
	pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
	Pending,
	Ready,
	Processing,
	Valid,
	Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentifierType {
	Dns,
	Ip,
	Email,
	Uri,
	Permanentidentifier,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
	#[serde(rename = "type")]
	pub kind: IdentifierType,
	pub value: Box<str>,
}

/// ACME order (spec §3). Status transitions are monotonic along
/// pending→ready→processing→valid, with invalid reachable from any
/// non-terminal state; `castellan-acme::state` is the only place that
/// mutates `status` and it always does so via `DbAdapter::cmp_and_swap`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeOrder {
	pub id: Box<str>,
	pub account_id: Box<str>,
	pub provisioner_id: Box<str>,
	pub status: OrderStatus,
	pub identifiers: Vec<Identifier>,
	pub authorization_ids: Vec<Box<str>>,
	pub not_before: Option<Timestamp>,
	pub not_after: Option<Timestamp>,
	pub expires: Timestamp,
	pub certificate_serial: Option<Box<str>>,
	pub error_detail: Option<Box<str>>,
}

impl AcmeOrder {
	/// Invariant from spec §8: `status = valid ⇔ ∃ certificate url`.
	pub fn has_certificate(&self) -> bool {
		self.certificate_serial.is_some()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
	Pending,
	Valid,
	Invalid,
	Expired,
	Revoked,
	Deactivated,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeAuthorization {
	pub id: Box<str>,
	pub order_id: Box<str>,
	pub identifier: Identifier,
	pub status: AuthorizationStatus,
	pub challenge_ids: Vec<Box<str>>,
	pub expires: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeType {
	Http01,
	Dns01,
	TlsAlpn01,
	DeviceAttest01,
	WireOidc01,
	WireDpop01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
	Pending,
	Processing,
	Valid,
	Invalid,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeChallenge {
	pub id: Box<str>,
	pub authz_id: Box<str>,
	#[serde(rename = "type")]
	pub kind: ChallengeType,
	pub token: Box<str>,
	pub status: ChallengeStatus,
	/// Opaque, challenge-type-specific evidence (e.g. the attestation
	/// statement hash for device-attest-01) kept for audit, never the raw
	/// secret the client sent.
	pub validation_record: Option<Box<str>>,
	pub error_detail: Option<Box<str>>,
}

/// External Account Binding key (spec §3). `bound_at` is set at most once
/// (spec §8 invariant); a second new-account attempt against the same key
/// fails with `externalAccountRequired`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EabKey {
	pub id: Box<str>,
	pub provisioner_id: Box<str>,
	pub reference: Option<Box<str>>,
	pub hmac_key: Vec<u8>,
	pub bound_account_id: Option<Box<str>>,
	pub created_at: Timestamp,
	pub bound_at: Option<Timestamp>,
}

impl EabKey {
	pub fn is_bound(&self) -> bool {
		self.bound_at.is_some()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn order_has_certificate_matches_status_valid_invariant() {
		let mut order = AcmeOrder {
			id: "o1".into(),
			account_id: "a1".into(),
			provisioner_id: "p1".into(),
			status: OrderStatus::Valid,
			identifiers: vec![],
			authorization_ids: vec![],
			not_before: None,
			not_after: None,
			expires: Timestamp::now(),
			certificate_serial: None,
			error_detail: None,
		};
		assert!(!order.has_certificate());
		order.certificate_serial = Some("abc".into());
		assert!(order.has_certificate());
	}

	#[test]
	fn eab_key_single_use() {
		let mut key = EabKey {
			id: "k1".into(),
			provisioner_id: "p1".into(),
			reference: Some("prod-1".into()),
			hmac_key: vec![1, 2, 3],
			bound_account_id: None,
			created_at: Timestamp::now(),
			bound_at: None,
		};
		assert!(!key.is_bound());
		key.bound_at = Some(Timestamp::now());
		key.bound_account_id = Some("acc-1".into());
		assert!(key.is_bound());
	}

	#[test]
	fn identifiers_sort_canonically() {
		let mut ids = vec![
			Identifier { kind: IdentifierType::Dns, value: "b.test".into() },
			Identifier { kind: IdentifierType::Dns, value: "a.test".into() },
		];
		ids.sort();
		assert_eq!(ids[0].value.as_ref(), "a.test");
	}
}

// vim: ts=4
