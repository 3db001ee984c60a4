//! External Account Binding (spec §4.5 "EAB", RFC 8555 §7.3.4): the inner-JWS
//! verification new-account binds against, plus the `/admin/acme/eab` CRUD
//! surface that provisions HMAC keys out of band.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use castellan_core::App;
use castellan_types::db_adapter::Bucket;
use castellan_types::model::EabKey;
use castellan_types::prelude::*;

use crate::jws::FlattenedJws;
use crate::store;

/// EAB reference length bound (spec §3 "reference... <=256 chars").
const MAX_REFERENCE_LEN: usize = 256;

#[derive(Deserialize)]
struct EabHeader {
	alg: String,
	kid: String,
	url: String,
}

fn decode_header(jws: &FlattenedJws) -> ClResult<EabHeader> {
	let bytes = B64
		.decode(&jws.protected)
		.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "EAB protected header is not valid base64url"))?;
	serde_json::from_slice(&bytes)
		.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "EAB protected header is not valid JSON"))
}

/// Validates the `externalAccountBinding` JWS embedded in a new-account
/// request and marks the referenced key bound, single-use (spec: "on
/// success, the EAB record's `boundAt` is CAS-set to now; a second attempt
/// with the same EAB key fails with `externalAccountRequired`").
pub async fn verify_and_bind(
	app: &App,
	provisioner_id: &str,
	expected_url: &str,
	account_jwk: &serde_json::Value,
	account_id: &str,
	eab: &FlattenedJws,
) -> ClResult<Box<str>> {
	let header = decode_header(eab)?;
	if header.alg != "HS256" {
		return Err(Error::acme(AcmeErrorKind::BadSignatureAlgorithm, "EAB signature must use HS256"));
	}
	if header.url != expected_url {
		return Err(Error::acme(AcmeErrorKind::Malformed, "EAB url header does not match the request URL"));
	}

	let inner_jwk = eab.payload_json()?;
	if inner_jwk != *account_jwk {
		return Err(Error::acme(AcmeErrorKind::Malformed, "EAB payload does not match the account key"));
	}

	let key = store::get_eab_key_by_reference(app.db.as_ref(), provisioner_id, &header.kid)
		.await?
		.ok_or_else(|| Error::acme(AcmeErrorKind::ExternalAccountRequired, "unknown EAB key"))?;
	if key.is_bound() {
		return Err(Error::acme(AcmeErrorKind::ExternalAccountRequired, "EAB key has already been used"));
	}

	eab.verify_hmac(&key.hmac_key)?;

	let mut bound = key.clone();
	bound.bound_at = Some(Timestamp::now());
	bound.bound_account_id = Some(account_id.into());
	store::cas_replace(app.db.as_ref(), Bucket::AcmeEabKeys, &key.id, &key, &bound)
		.await
		.map_err(|err| match err {
			Error::Conflict(_) => Error::acme(AcmeErrorKind::ExternalAccountRequired, "EAB key has already been used"),
			other => other,
		})?;

	Ok(key.id)
}

fn check_admin_token(app: &App, headers: &HeaderMap) -> ClResult<()> {
	let expected = std::env::var(app.config.admin.token_env.as_ref())
		.map_err(|_| Error::Internal("admin token environment variable is not set".into()))?;
	let presented = headers
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.ok_or_else(|| Error::Unauthorized("missing admin bearer token".into()))?;
	if presented.len() != expected.len() || !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
		return Err(Error::Unauthorized("invalid admin bearer token".into()));
	}
	Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEabRequest {
	provisioner_id: Box<str>,
	reference: Option<Box<str>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EabKeyResponse {
	id: Box<str>,
	provisioner_id: Box<str>,
	reference: Option<Box<str>>,
	/// Only ever returned once, at creation (spec: a bearer must receive the
	/// HMAC key out of band; the server never re-displays it).
	hmac_key: Option<String>,
	bound: bool,
}

impl From<EabKey> for EabKeyResponse {
	fn from(key: EabKey) -> Self {
		Self {
			id: key.id,
			provisioner_id: key.provisioner_id,
			reference: key.reference,
			hmac_key: None,
			bound: key.bound_at.is_some(),
		}
	}
}

/// `POST /admin/acme/eab`: provisions a fresh 256-bit HMAC key.
pub async fn create(State(app): State<App>, headers: HeaderMap, body: axum::Json<CreateEabRequest>) -> Response {
	match try_create(&app, &headers, body.0).await {
		Ok(resp) => resp,
		Err(err) => err.into_response(),
	}
}

async fn try_create(app: &App, headers: &HeaderMap, req: CreateEabRequest) -> ClResult<Response> {
	check_admin_token(app, headers)?;
	if let Some(reference) = &req.reference {
		if reference.len() > MAX_REFERENCE_LEN {
			return Err(Error::bad_request("reference must be at most 256 characters"));
		}
		if store::get_eab_key_by_reference(app.db.as_ref(), &req.provisioner_id, reference).await?.is_some() {
			return Err(Error::Conflict("reference is already in use for this provisioner".into()));
		}
	}

	let mut hmac_key = vec![0u8; 32];
	rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut hmac_key);

	let key = EabKey {
		id: ResourceId::generate().0,
		provisioner_id: req.provisioner_id.clone(),
		reference: req.reference.clone(),
		hmac_key: hmac_key.clone(),
		bound_account_id: None,
		created_at: Timestamp::now(),
		bound_at: None,
	};

	if let Some(reference) = &req.reference {
		app.db
			.cmp_and_swap(
				Bucket::AcmeEabKeyByReference,
				&format!("{}/{reference}", req.provisioner_id),
				None,
				Some(key.id.as_bytes().to_vec()),
			)
			.await
			.map_err(|err| match err {
				Error::Conflict(_) => Error::Conflict("reference is already in use for this provisioner".into()),
				other => other,
			})?;
	}
	store::put(app.db.as_ref(), Bucket::AcmeEabKeys, &key.id, &key).await?;

	let mut resp = EabKeyResponse::from(key);
	resp.hmac_key = Some(B64.encode(&hmac_key));
	Ok((StatusCode::CREATED, axum::Json(resp)).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEabQuery {
	provisioner_id: Box<str>,
}

/// `GET /admin/acme/eab?provisionerId=...`.
pub async fn list(
	State(app): State<App>,
	headers: HeaderMap,
	axum::extract::Query(query): axum::extract::Query<ListEabQuery>,
) -> Response {
	match try_list(&app, &headers, &query.provisioner_id).await {
		Ok(resp) => resp,
		Err(err) => err.into_response(),
	}
}

async fn try_list(app: &App, headers: &HeaderMap, provisioner_id: &str) -> ClResult<Response> {
	check_admin_token(app, headers)?;
	let rows = app.db.list(Bucket::AcmeEabKeys).await?;
	let mut out = Vec::new();
	for (_, bytes) in rows {
		let record: castellan_types::storage::VersionedRecord<EabKey> =
			castellan_types::storage::VersionedRecord::decode(&bytes)?;
		if record.value.provisioner_id.as_ref() == provisioner_id {
			out.push(EabKeyResponse::from(record.value));
		}
	}
	Ok(axum::Json(out).into_response())
}

/// `DELETE /admin/acme/eab/{id}`.
pub async fn delete(State(app): State<App>, headers: HeaderMap, Path(id): Path<String>) -> Response {
	match try_delete(&app, &headers, &id).await {
		Ok(resp) => resp,
		Err(err) => err.into_response(),
	}
}

async fn try_delete(app: &App, headers: &HeaderMap, id: &str) -> ClResult<Response> {
	check_admin_token(app, headers)?;
	let key = store::get_eab_key(app.db.as_ref(), id).await?;
	app.db.del(Bucket::AcmeEabKeys, id).await?;
	if let Some(reference) = &key.reference {
		let _ = app.db.del(Bucket::AcmeEabKeyByReference, &format!("{}/{reference}", key.provisioner_id)).await;
	}
	Ok(StatusCode::NO_CONTENT.into_response())
}

// vim: ts=4
