//! `/1.0/sign`, `/1.0/renew`, `/1.0/revoke` (spec §6 "internal API"): the
//! non-ACME, non-SCEP path into the issuance pipeline, for provisioners that
//! speak neither protocol (K8s service-account tokens, Nebula, plain
//! bearer-token automation). Every response is the internal `{type, detail,
//! status}` shape on error (`castellan_types::error::Error`'s own
//! `IntoResponse`), plain JSON on success — there is no problem+json layer
//! here, that's an ACME-only concern.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use castellan_core::App;
use castellan_pki::provisioner::ProvisionerProof;
use castellan_types::db_adapter::Bucket;
use castellan_types::model::{CertificateRecord, RevocationReason};
use castellan_types::prelude::*;
use castellan_types::storage::VersionedRecord;

fn proof_from_token(token: &str) -> ProvisionerProof<'_> {
	ProvisionerProof::CompactToken(token)
}

fn certificate_response(record: &CertificateRecord) -> CertificateResponse {
	CertificateResponse {
		serial: record.serial.to_string(),
		certificate_pem: pem::encode(&pem::Pem::new("CERTIFICATE", record.der.clone())),
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CertificateResponse {
	serial: String,
	certificate_pem: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
	provisioner_id: Box<str>,
	provisioner_token: Box<str>,
	csr: Box<str>,
}

/// `POST /1.0/sign` (spec §6): "JSON bodies with CSR (PEM), provisioner
/// token, optional lifetime hints" — lifetime hints are not implemented; the
/// provisioner's claims and the template alone determine lifetime (spec
/// §4.7 step 4), matching the ACME finalize path's own behavior.
pub async fn sign(State(app): State<App>, Json(req): Json<SignRequest>) -> Response {
	match app.authority.sign(&req.csr, &req.provisioner_id, proof_from_token(&req.provisioner_token), None).await {
		Ok(record) => (StatusCode::CREATED, Json(certificate_response(&record))).into_response(),
		Err(err) => err.into_response(),
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewRequest {
	provisioner_id: Box<str>,
	serial: Box<str>,
}

fn parse_serial(hex: &str) -> ClResult<Serial> {
	u128::from_str_radix(hex, 16).map(Serial).map_err(|_| Error::bad_request("serial is not valid hex"))
}

async fn load_certificate(app: &App, serial: Serial) -> ClResult<CertificateRecord> {
	let bytes = app.db.get(Bucket::Certs, &serial.to_string()).await?;
	Ok(VersionedRecord::<CertificateRecord>::decode(&bytes)?.value)
}

/// `POST /1.0/renew`. The wire request still names a provisioner token per
/// spec §6, but `Authority::renew` (spec §4.7) operates on the stored
/// record, preserving subject and SANs rather than accepting a fresh CSR —
/// so this endpoint takes the serial of the certificate being renewed
/// instead of a CSR. `Authority::renew` already looks up the provisioner
/// and calls `Provisioner::authorize_renew` itself, so `provisioner_token`
/// is accepted for symmetry with `sign`/`revoke` but not independently
/// checked here; `authorize_renew` takes the certificate record, not a
/// bearer proof, as its authorization input.
pub async fn renew(State(app): State<App>, Json(req): Json<RenewRequest>) -> Response {
	let serial = match parse_serial(&req.serial) {
		Ok(serial) => serial,
		Err(err) => return err.into_response(),
	};
	let current = match load_certificate(&app, serial).await {
		Ok(record) => record,
		Err(err) => return err.into_response(),
	};
	match app.authority.renew(&current, &req.provisioner_id).await {
		Ok(record) => (StatusCode::CREATED, Json(certificate_response(&record))).into_response(),
		Err(err) => err.into_response(),
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRequest {
	provisioner_id: Box<str>,
	provisioner_token: Box<str>,
	serial: Box<str>,
	reason: Option<RevocationReason>,
}

/// `POST /1.0/revoke` (spec §4.7 `Revoke`: "proof validated (account or
/// cert-key)"). `Authority::revoke` itself performs no proof check — every
/// caller (this handler, `castellan_acme::order::revoke_cert`) is
/// responsible for authorizing before calling it, so the check here is
/// `Provisioner::authorize_revoke` against the submitted token.
pub async fn revoke(State(app): State<App>, Json(req): Json<RevokeRequest>) -> Response {
	let serial = match parse_serial(&req.serial) {
		Ok(serial) => serial,
		Err(err) => return err.into_response(),
	};

	let provisioner = match app.registry.get(&req.provisioner_id) {
		Some(p) => p,
		None => return Error::bad_request("unknown provisioner").into_response(),
	};
	if let Err(err) = provisioner.authorize_revoke(app.db.as_ref(), proof_from_token(&req.provisioner_token)).await {
		return err.into_response();
	}

	match app.authority.revoke(serial, req.reason.unwrap_or(RevocationReason::Unspecified)).await {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(err) => err.into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use castellan_core::app::AppBuilder;
	use castellan_core::config::{CaConfig, Config, DbConfig, KmsConfig};
	use castellan_types::db_adapter::test_double::MemoryDb;
	use castellan_types::kms_adapter::test_double::MemoryKms;
	use std::sync::Arc;

	async fn test_app() -> App {
		AppBuilder {
			config: Config {
				ca: CaConfig {
					subject_cn: "Test CA".into(),
					key_uri: "test://root".into(),
					cert_pem: "-----BEGIN CERTIFICATE-----\nMA==\n-----END CERTIFICATE-----\n".into(),
				},
				db: DbConfig { path: "/tmp/castellan-rest-test".into() },
				kms: KmsConfig::Softkey { path: "/tmp/castellan-rest-test-keys".into(), passphrase_env: "X".into() },
				acme: Default::default(),
				scep: Default::default(),
				server: Default::default(),
				admin: Default::default(),
			},
			db: Arc::new(MemoryDb::new()),
			kms: Arc::new(MemoryKms::new()),
		}
		.build()
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn sign_rejects_an_unknown_provisioner() {
		let app = test_app().await;
		let req = SignRequest { provisioner_id: "nope".into(), provisioner_token: "tok".into(), csr: "garbage".into() };
		let response = sign(State(app), Json(req)).await;
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn renew_rejects_an_unknown_serial() {
		let app = test_app().await;
		let req = RenewRequest { provisioner_id: "p1".into(), serial: "00".into() };
		let response = renew(State(app), Json(req)).await;
		assert_eq!(response.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn revoke_rejects_a_non_hex_serial() {
		let app = test_app().await;
		let req = RevokeRequest {
			provisioner_id: "p1".into(),
			provisioner_token: "tok".into(),
			serial: "not-hex".into(),
			reason: None,
		};
		let response = revoke(State(app), Json(req)).await;
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn revoke_rejects_an_unknown_provisioner() {
		let app = test_app().await;
		let req = RevokeRequest {
			provisioner_id: "nope".into(),
			provisioner_token: "tok".into(),
			serial: "2a".into(),
			reason: Some(RevocationReason::KeyCompromise),
		};
		let response = revoke(State(app), Json(req)).await;
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}
}

// vim: ts=4
