//! RFC 7807 problem+json rendering for the ACME surface (spec §6 "problem+json
//! on error") plus the `Replay-Nonce`/`Link` headers every ACME response
//! carries, success or failure alike.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use castellan_core::App;
use castellan_types::prelude::*;

#[derive(Serialize)]
struct ProblemBody {
	#[serde(rename = "type")]
	kind: String,
	detail: String,
}

/// Renders `err` as `application/problem+json` (spec §7 "ACME uses RFC 7807
/// problem documents with URN `urn:ietf:params:acme:error:<kind>`"). Errors
/// outside the ACME registry (a `NotFound`, a bare `Internal`) still get a
/// URN under the same namespace so clients never see a bare
/// `{type,detail,status}` shape on this surface.
pub fn render(err: Error) -> Response {
	let (status, urn_suffix, detail) = match &err {
		Error::Acme(kind, detail) => (kind.status(), kind.urn_suffix(), detail.clone()),
		Error::NotFound => (StatusCode::NOT_FOUND, "malformed", "resource not found".to_string()),
		Error::BadRequest(m) => (StatusCode::BAD_REQUEST, "malformed", m.clone()),
		Error::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", m.clone()),
		Error::Forbidden(m) => (StatusCode::FORBIDDEN, "unauthorized", m.clone()),
		Error::Conflict(m) => (StatusCode::CONFLICT, "malformed", m.clone()),
		Error::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "serverInternal", "temporarily unavailable".into()),
		Error::Internal(m) => {
			tracing::warn!(error = %m, "internal error on ACME surface");
			(StatusCode::INTERNAL_SERVER_ERROR, "serverInternal", "internal server error".into())
		}
		Error::ScepFailInfo(_) => (StatusCode::BAD_REQUEST, "malformed", "not an ACME operation".into()),
		Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "serverInternal", "internal server error".into()),
	};

	let body = ProblemBody { kind: format!("urn:ietf:params:acme:error:{urn_suffix}"), detail };
	let mut resp = (status, axum::Json(body)).into_response();
	resp.headers_mut().insert(
		header::CONTENT_TYPE,
		HeaderValue::from_static("application/problem+json"),
	);
	resp
}

/// Stamps a freshly-minted `Replay-Nonce` onto any response, error or
/// success — RFC 8555 §6.5.1 requires every response carry one.
pub async fn with_fresh_nonce(app: &App, mut resp: Response) -> Response {
	match crate::nonce::issue(app).await {
		Ok(nonce) => {
			if let Ok(value) = HeaderValue::from_str(&nonce) {
				resp.headers_mut().insert("Replay-Nonce", value);
			}
			resp
		}
		Err(err) => {
			tracing::warn!("failed to mint replay nonce: {err}");
			resp
		}
	}
}

// vim: ts=4
