//! `new-order`, order polling, and finalize (RFC 8555 §7.4, §7.1.3). All
//! three run behind `auth::middleware`, so the caller is always a verified
//! `AcmeAuth` account by the time a handler runs.

use std::collections::BTreeSet;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use castellan_core::extract::AcmeAuth;
use castellan_core::App;
use castellan_pki::provisioner::Provisioner as _;
use castellan_types::db_adapter::Bucket;
use castellan_types::model::{AcmeOrder, Identifier, IdentifierType, OrderStatus, RevocationReason};
use castellan_types::prelude::*;

use crate::auth::JwsPayload;
use crate::{authz, problem, store, urls};

/// Order lifetime before it expires unfinalized (spec §3 "expires").
const ORDER_TTL_SECS: i64 = 7 * 24 * 3600;
/// Authorization lifetime (spec §3 "authorizations expire").
const AUTHZ_TTL_SECS: i64 = 7 * 24 * 3600;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentifierPayload {
	#[serde(rename = "type")]
	kind: IdentifierType,
	value: Box<str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderPayload {
	identifiers: Vec<IdentifierPayload>,
	#[serde(default)]
	not_before: Option<String>,
	#[serde(default)]
	not_after: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentifierBody {
	#[serde(rename = "type")]
	kind: IdentifierType,
	value: Box<str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderBody {
	status: OrderStatus,
	identifiers: Vec<IdentifierBody>,
	authorizations: Vec<String>,
	finalize: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	certificate: Option<String>,
}

fn render_order(app: &App, provisioner_id: &str, order: &AcmeOrder) -> Response {
	let body = OrderBody {
		status: order.status,
		identifiers: order.identifiers.iter().map(|i| IdentifierBody { kind: i.kind, value: i.value.clone() }).collect(),
		authorizations: order.authorization_ids.iter().map(|id| urls::authz(app, provisioner_id, id)).collect(),
		finalize: urls::order_finalize(app, provisioner_id, &order.id),
		certificate: order
			.certificate_serial
			.as_ref()
			.map(|serial| urls::certificate(app, provisioner_id, serial)),
	};
	axum::Json(body).into_response()
}

/// `POST /acme/{provisioner}/new-order` (RFC 8555 §7.4).
pub async fn new_order(
	State(app): State<App>,
	Path(provisioner_id): Path<String>,
	AcmeAuth(account): AcmeAuth,
	JwsPayload(payload): JwsPayload,
) -> Response {
	match try_new_order(&app, &provisioner_id, account, payload).await {
		Ok(resp) => problem::with_fresh_nonce(&app, resp).await,
		Err(err) => problem::with_fresh_nonce(&app, problem::render(err)).await,
	}
}

async fn try_new_order(
	app: &App,
	provisioner_id: &str,
	account: castellan_types::model::AcmeAccount,
	payload: serde_json::Value,
) -> ClResult<Response> {
	let req: NewOrderPayload = serde_json::from_value(payload)
		.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "malformed new-order payload"))?;
	if req.identifiers.is_empty() {
		return Err(Error::acme(AcmeErrorKind::Malformed, "order must name at least one identifier"));
	}

	let mut identifiers: Vec<Identifier> =
		req.identifiers.into_iter().map(|i| Identifier { kind: i.kind, value: i.value }).collect();
	identifiers.sort();
	identifiers.dedup();

	let is_wire_provisioner = app.registry.get(provisioner_id).map(|p| p.kind_name() == "wire").unwrap_or(false);
	let expires = Timestamp::from_now(ORDER_TTL_SECS);
	let authz_expires = Timestamp::from_now(AUTHZ_TTL_SECS);
	let order_id = ResourceId::generate().0;

	let mut authorization_ids = Vec::with_capacity(identifiers.len());
	for identifier in &identifiers {
		let (authz, challenges) = authz::build(&order_id, identifier.clone(), authz_expires, is_wire_provisioner);
		authorization_ids.push(authz.id.clone());
		authz::persist_new(app.db.as_ref(), &authz, &challenges).await?;
	}

	let order = AcmeOrder {
		id: order_id,
		account_id: account.id.clone(),
		provisioner_id: provisioner_id.into(),
		status: OrderStatus::Pending,
		identifiers,
		authorization_ids,
		not_before: None,
		not_after: None,
		expires,
		certificate_serial: None,
		error_detail: None,
	};
	store::put_order(app.db.as_ref(), &order).await?;

	let location = urls::order(app, provisioner_id, &order.id);
	let mut resp = render_order(app, provisioner_id, &order);
	*resp.status_mut() = StatusCode::CREATED;
	if let Ok(value) = axum::http::HeaderValue::from_str(&location) {
		resp.headers_mut().insert(axum::http::header::LOCATION, value);
	}
	Ok(resp)
}

/// `POST-as-GET /acme/{provisioner}/order/{id}` (RFC 8555 §7.4).
pub async fn get(
	State(app): State<App>,
	Path((provisioner_id, order_id)): Path<(String, String)>,
	AcmeAuth(account): AcmeAuth,
) -> Response {
	let resp = match fetch_owned_order(&app, &account.id, &order_id).await {
		Ok(order) => render_order(&app, &provisioner_id, &order),
		Err(err) => problem::render(err),
	};
	problem::with_fresh_nonce(&app, resp).await
}

async fn fetch_owned_order(app: &App, account_id: &str, order_id: &str) -> ClResult<AcmeOrder> {
	let order = store::get_order(app.db.as_ref(), order_id).await?;
	if order.account_id.as_ref() != account_id {
		return Err(Error::acme(AcmeErrorKind::Unauthorized, "order does not belong to this account"));
	}
	Ok(order)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizePayload {
	csr: String,
}

/// `POST /acme/{provisioner}/order/{id}/finalize` (RFC 8555 §7.4). Spec
/// precondition: order is `ready`, CSR identifier set equals the order's
/// identifier set exactly, CSR is self-signed by its own public key (the
/// latter is re-checked inside `Authority::sign`). First finalize wins; a
/// retried POST while `processing` just returns the current order.
pub async fn finalize(
	State(app): State<App>,
	Path((provisioner_id, order_id)): Path<(String, String)>,
	AcmeAuth(account): AcmeAuth,
	JwsPayload(payload): JwsPayload,
) -> Response {
	match try_finalize(&app, &provisioner_id, &order_id, account, payload).await {
		Ok(resp) => problem::with_fresh_nonce(&app, resp).await,
		Err(err) => problem::with_fresh_nonce(&app, problem::render(err)).await,
	}
}

async fn try_finalize(
	app: &App,
	provisioner_id: &str,
	order_id: &str,
	account: castellan_types::model::AcmeAccount,
	payload: serde_json::Value,
) -> ClResult<Response> {
	let order = fetch_owned_order(app, &account.id, order_id).await?;

	if matches!(order.status, OrderStatus::Processing | OrderStatus::Valid | OrderStatus::Invalid) {
		return Ok(render_order(app, provisioner_id, &order));
	}
	if order.status != OrderStatus::Ready {
		return Err(Error::acme(AcmeErrorKind::OrderNotReady, "order is not ready for finalization"));
	}

	let req: FinalizePayload = serde_json::from_value(payload)
		.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "finalize payload must carry a csr"))?;
	let csr_der = crate::jws::b64_decode(&req.csr)
		.map_err(|_| Error::acme(AcmeErrorKind::BadCsr, "csr is not valid base64url"))?;
	let csr_identifiers = parse_csr_identifiers(&csr_der)?;
	let csr_set: BTreeSet<Identifier> = csr_identifiers.into_iter().collect();
	let order_set: BTreeSet<Identifier> = order.identifiers.iter().cloned().collect();
	if csr_set != order_set {
		return Err(Error::acme(AcmeErrorKind::BadCsr, "CSR identifiers do not match the order's identifiers"));
	}

	let mut processing = order.clone();
	processing.status = OrderStatus::Processing;
	store::cas_replace(app.db.as_ref(), Bucket::AcmeOrders, &order.id, &order, &processing).await?;

	let csr_pem = pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", csr_der));
	let outcome = app
		.authority
		.sign(&csr_pem, provisioner_id, castellan_pki::provisioner::ProvisionerProof::PreAuthorized, Some(&account.id))
		.await;

	let mut finished = processing.clone();
	match outcome {
		Ok(cert) => {
			finished.status = OrderStatus::Valid;
			finished.certificate_serial = Some(cert.serial.to_string().into());
		}
		Err(err) => {
			finished.status = OrderStatus::Invalid;
			finished.error_detail = Some(err.to_string().into());
		}
	}
	store::cas_replace(app.db.as_ref(), Bucket::AcmeOrders, &processing.id, &processing, &finished).await?;

	Ok(render_order(app, provisioner_id, &finished))
}

fn parse_csr_identifiers(csr_der: &[u8]) -> ClResult<Vec<Identifier>> {
	let (_, csr) = X509CertificationRequest::from_der(csr_der)
		.map_err(|_| Error::acme(AcmeErrorKind::BadCsr, "CSR could not be parsed"))?;

	let Some(extensions) = csr.requested_extensions() else { return Ok(Vec::new()) };
	let mut out = Vec::new();
	for ext in extensions {
		if let ParsedExtension::SubjectAlternativeName(san) = ext {
			for name in &san.general_names {
				match name {
					GeneralName::DNSName(s) => out.push(Identifier { kind: IdentifierType::Dns, value: (*s).into() }),
					GeneralName::RFC822Name(s) => {
						out.push(Identifier { kind: IdentifierType::Email, value: (*s).into() })
					}
					GeneralName::URI(s) => out.push(Identifier { kind: IdentifierType::Uri, value: (*s).into() }),
					GeneralName::IPAddress(bytes) => {
						if let Ok(ip) = std::net::IpAddr::try_from(*bytes) {
							out.push(Identifier { kind: IdentifierType::Ip, value: ip.to_string().into() });
						}
					}
					_ => {}
				}
			}
		}
	}
	Ok(out)
}

/// `GET /acme/{provisioner}/cert/{serial}` (RFC 8555 §7.4.2).
pub async fn certificate(
	State(app): State<App>,
	Path((_provisioner_id, serial)): Path<(String, String)>,
	AcmeAuth(account): AcmeAuth,
) -> Response {
	let resp = match fetch_certificate_pem(&app, &account.id, &serial).await {
		Ok(pem) => {
			let mut resp = (StatusCode::OK, pem).into_response();
			resp.headers_mut().insert(
				axum::http::header::CONTENT_TYPE,
				axum::http::HeaderValue::from_static("application/pem-certificate-chain"),
			);
			resp
		}
		Err(err) => problem::render(err),
	};
	problem::with_fresh_nonce(&app, resp).await
}

async fn fetch_certificate_pem(app: &App, account_id: &str, serial: &str) -> ClResult<String> {
	let bytes = app.db.get(Bucket::Certs, serial).await.map_err(|err| match err {
		Error::NotFound => Error::acme(AcmeErrorKind::Malformed, "no such certificate"),
		other => other,
	})?;
	let record: castellan_types::storage::VersionedRecord<castellan_types::model::CertificateRecord> =
		castellan_types::storage::VersionedRecord::decode(&bytes)?;
	if record.value.acme_account_id.as_deref() != Some(account_id) {
		return Err(Error::acme(AcmeErrorKind::Unauthorized, "certificate does not belong to this account"));
	}
	Ok(pem::encode(&pem::Pem::new("CERTIFICATE", record.value.der)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeCertPayload {
	certificate: String,
	reason: Option<u8>,
}

/// `POST /acme/{provisioner}/revoke-cert` (RFC 8555 §7.6: "the request is
/// signed with... the account key pair... or... the key pair of the
/// certificate"). Unlike every other route in this crate, `/revoke-cert` is
/// mounted unauthenticated (see `lib::router`) and verifies its own JWS here
/// instead of going through `auth::middleware`, because a certificate-key
/// revocation carries no account to look up — the middleware's `kid`-only
/// model can't express it.
pub async fn revoke_cert(State(app): State<App>, req: axum::extract::Request) -> Response {
	match try_revoke_cert(&app, req).await {
		Ok(resp) => problem::with_fresh_nonce(&app, resp).await,
		Err(err) => problem::with_fresh_nonce(&app, problem::render(err)).await,
	}
}

/// Duplicates the URL/nonce checks `auth::middleware::try_authenticate`
/// does for every other route, then branches on whether the JWS carries a
/// `kid` (account-key path, same as every other authenticated route) or a
/// bare `jwk` (certificate-key path: the signature is checked against the
/// public key embedded in the certificate being revoked, not a stored
/// account key, so proof of possession of the cert's private key is itself
/// the authorization).
async fn try_revoke_cert(app: &App, req: axum::extract::Request) -> ClResult<Response> {
	use axum::extract::FromRequestParts;
	use std::collections::HashMap;

	let (mut parts, body) = req.into_parts();
	let uri = parts.uri.clone();
	let params: Path<HashMap<String, String>> =
		Path::from_request_parts(&mut parts, &()).await.unwrap_or(Path(HashMap::new()));
	let provisioner_id = params.0.get("provisioner_id").cloned().unwrap_or_default();

	let bytes = axum::body::to_bytes(body, 1024 * 1024)
		.await
		.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "could not read request body"))?;
	let jws = crate::jws::FlattenedJws::parse(&bytes)?;
	let header = jws.protected_header()?;

	let expected_url = crate::auth::canonical_url(app, &uri);
	if header.url != expected_url {
		return Err(Error::acme(AcmeErrorKind::Unauthorized, "JWS url header does not match the request URL"));
	}
	crate::nonce::consume(app, &header.nonce).await?;

	let payload = jws.payload_json()?;
	let req: RevokeCertPayload = serde_json::from_value(payload)
		.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "revoke-cert payload must carry a certificate"))?;
	let der = crate::jws::b64_decode(&req.certificate)
		.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "certificate is not valid base64url"))?;
	let (_, cert) = x509_parser::certificate::X509Certificate::from_der(&der)
		.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "certificate could not be parsed"))?;
	let serial_value = serial_from_der_bytes(cert.raw_serial())?;
	let serial = serial_value.to_string();

	let bytes = app.db.get(Bucket::Certs, &serial).await.map_err(|err| match err {
		Error::NotFound => Error::acme(AcmeErrorKind::Malformed, "no such certificate"),
		other => other,
	})?;
	let record: castellan_types::storage::VersionedRecord<castellan_types::model::CertificateRecord> =
		castellan_types::storage::VersionedRecord::decode(&bytes)?;

	match header.kid.as_deref() {
		Some(kid) => {
			let account = crate::auth::resolve_account(app, kid).await?;
			let expected_kid = urls::account(app, &provisioner_id, &account.id);
			if kid != expected_kid {
				return Err(Error::acme(AcmeErrorKind::Unauthorized, "kid does not match its provisioner"));
			}
			jws.verify(&header.alg, &account.jwk)?;
			if record.value.acme_account_id.as_deref() != Some(account.id.as_ref()) {
				return Err(Error::acme(AcmeErrorKind::Unauthorized, "certificate does not belong to this account"));
			}
		}
		None => jws.verify_with_certificate(&header.alg, &cert)?,
	}

	let reason = revocation_reason_from_crl_code(req.reason.unwrap_or(0))?;
	app.authority.revoke(serial_value, reason).await?;

	Ok(StatusCode::OK.into_response())
}

/// `Serial` is a 128-bit integer rendered into the DER `INTEGER` as its
/// minimal big-endian encoding (spec §3: "serial numbers... 128-bit");
/// reversing that for a client-submitted certificate just left-pads.
fn serial_from_der_bytes(bytes: &[u8]) -> ClResult<Serial> {
	if bytes.len() > 16 {
		return Err(Error::acme(AcmeErrorKind::Malformed, "certificate serial is wider than 128 bits"));
	}
	let mut padded = [0u8; 16];
	padded[16 - bytes.len()..].copy_from_slice(bytes);
	Ok(Serial(u128::from_be_bytes(padded)))
}

/// RFC 5280 §5.3.1 CRLReason codes, as carried in RFC 8555 §7.6's `reason`
/// field. `7` (`reserved`) is intentionally absent.
fn revocation_reason_from_crl_code(code: u8) -> ClResult<RevocationReason> {
	Ok(match code {
		0 => RevocationReason::Unspecified,
		1 => RevocationReason::KeyCompromise,
		2 => RevocationReason::CaCompromise,
		3 => RevocationReason::AffiliationChanged,
		4 => RevocationReason::Superseded,
		5 => RevocationReason::CessationOfOperation,
		6 => RevocationReason::CertificateHold,
		8 => RevocationReason::RemoveFromCrl,
		9 => RevocationReason::PrivilegeWithdrawn,
		10 => RevocationReason::AaCompromise,
		_ => return Err(Error::acme(AcmeErrorKind::BadRevocationReason, "unrecognized revocation reason code")),
	})
}

// vim: ts=4
