//! RFC 8894 SCEP enrollment surface (spec §4.5 supplement): one namespace
//! per provisioner, `/scep/{provisioner_id}`, mirroring the ACME surface's
//! per-provisioner routing in `castellan_acme::router`. SCEP has no JWS
//! envelope of its own — `GetCACert`/`GetCACaps` are bare GETs and
//! `PKIOperation` carries its own CMS-signed, CMS-encrypted body, so this
//! crate has no `auth` module to speak of; authorization happens inside
//! `scep::pki_operation`, via the CSR's `challengePassword` for a fresh
//! enrollment or the requester's own certificate signature for a renewal.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod crypto;
pub mod pkcs7;
pub mod scep;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine as _;
use serde::Deserialize;

use castellan_core::App;
use castellan_types::prelude::*;

#[derive(Deserialize)]
struct OperationQuery {
	operation: Box<str>,
	message: Option<Box<str>>,
}

/// `GET /scep/{provisioner}?operation=GetCACert|GetCACaps|PKIOperation`: the
/// one endpoint RFC 8894 §3.1 funnels every read-only and base64-carried
/// request through. A `PKIOperation` large enough to need a body goes
/// through `post` instead (RFC 8894 §4.1 "MAY... as an HTTP POST").
async fn get_operation(
	State(app): State<App>,
	Path(provisioner_id): Path<String>,
	Query(query): Query<OperationQuery>,
) -> Response {
	match query.operation.as_ref() {
		"GetCACert" => get_ca_cert(&app),
		"GetCACaps" => get_ca_caps(),
		"PKIOperation" => {
			let message = match query.message {
				Some(m) => m,
				None => return text_error(StatusCode::BAD_REQUEST, "missing message parameter"),
			};
			let body = match base64::engine::general_purpose::STANDARD.decode(message.as_bytes()) {
				Ok(b) => b,
				Err(_) => return text_error(StatusCode::BAD_REQUEST, "message is not valid base64"),
			};
			pki_operation(&app, &provisioner_id, &body).await
		}
		_ => text_error(StatusCode::BAD_REQUEST, "unrecognized operation"),
	}
}

/// `POST /scep/{provisioner}?operation=PKIOperation`: the body is the raw
/// CMS `ContentInfo` DER, no base64 layer (RFC 8894 §4.1.2).
async fn post_pki_operation(State(app): State<App>, Path(provisioner_id): Path<String>, body: Bytes) -> Response {
	pki_operation(&app, &provisioner_id, &body).await
}

fn with_content_type(mut resp: Response, content_type: &'static str) -> Response {
	resp.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
	resp
}

fn get_ca_cert(app: &App) -> Response {
	with_content_type((StatusCode::OK, app.ca_cert_der.clone()).into_response(), "application/x-x509-ca-cert")
}

/// RFC 8894 §3.5.2: a plaintext, newline-separated capability list. This CA
/// advertises the stronger AES-256/SHA-256 pairing `castellan_scep::crypto`
/// actually uses, plus `Renewal` (spec §4.5 SCEP re-enrollment reuses the
/// same `PKIOperation` path) and `POSTPKIOperation`, since the POST route
/// below is unconditional rather than capability-gated.
fn get_ca_caps() -> Response {
	let body = "AES-256-CBC\nSHA-256\nRenewal\nPOSTPKIOperation";
	with_content_type((StatusCode::OK, body).into_response(), "text/plain")
}

async fn pki_operation(app: &App, provisioner_id: &str, body: &[u8]) -> Response {
	if app.registry.get(provisioner_id).is_none() {
		return text_error(StatusCode::NOT_FOUND, "unknown provisioner");
	}
	match scep::pki_operation(
		&app.authority,
		app.db.as_ref(),
		app.kms.as_ref(),
		&app.ca_key_uri,
		&app.ca_cert_der,
		provisioner_id,
		body,
	)
	.await
	{
		Ok(der) => with_content_type((StatusCode::OK, der).into_response(), "application/x-pki-message"),
		Err(err) => {
			tracing::warn!(provisioner = provisioner_id, error = ?err, "SCEP PKIOperation failed");
			text_error(StatusCode::BAD_REQUEST, "PKIOperation could not be processed")
		}
	}
}

fn text_error(status: StatusCode, detail: &'static str) -> Response {
	with_content_type((status, detail).into_response(), "text/plain")
}

/// `/scep/{provisioner_id}` (spec §4.5 supplement), gated behind
/// `config.scep.enabled` by whatever mounts this router — unlike
/// `castellan_acme::router` there is no per-route auth middleware, since
/// every SCEP request authenticates itself.
pub fn router(_app: &App) -> Router<App> {
	Router::new().route("/{provisioner_id}", get(get_operation).post(post_pki_operation))
}

// vim: ts=4
