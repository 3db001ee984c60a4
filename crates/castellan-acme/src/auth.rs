//! `kid`-based JWS authentication (spec §4.5 "for every other request the
//! `kid` header must point to the account URL"). Runs as axum middleware in
//! front of every route except `new-account`, `new-nonce`, and `directory`:
//! it reads the flattened JWS from the body, verifies nonce + `url` +
//! signature against the account's stored JWK, and hands the handler a
//! decoded payload plus the resolved account rather than making every
//! handler re-parse the JWS itself.

use axum::body::Body;
use axum::extract::{FromRequestParts, Path, Request, State};
use axum::http::Uri;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;

use castellan_core::{App, extract::AcmeAuth};
use castellan_types::model::AccountStatus;
use castellan_types::prelude::*;

use crate::jws::FlattenedJws;
use crate::{problem, store, urls};

/// The decoded JWS payload, attached to request extensions by the
/// middleware so handlers never need to see the outer JWS envelope.
#[derive(Clone, Debug)]
pub struct JwsPayload(pub serde_json::Value);

impl<S> FromRequestParts<S> for JwsPayload
where
	S: Send + Sync,
{
	type Rejection = Error;

	async fn from_request_parts(parts: &mut axum::http::request::Parts, _state: &S) -> Result<Self, Self::Rejection> {
		parts
			.extensions
			.get::<JwsPayload>()
			.cloned()
			.ok_or_else(|| Error::acme(AcmeErrorKind::Malformed, "no JWS payload on request"))
	}
}

pub(crate) fn canonical_url(app: &App, uri: &Uri) -> String {
	let root = app.config.acme.external_url.as_deref().unwrap_or("https://localhost").trim_end_matches('/');
	format!("{root}{}", uri.path())
}

pub async fn resolve_account(app: &App, kid: &str) -> ClResult<CastellanAccount> {
	let account_id = kid
		.rsplit('/')
		.next()
		.filter(|s| !s.is_empty())
		.ok_or_else(|| Error::acme(AcmeErrorKind::Malformed, "kid is not a valid account URL"))?;
	let account = store::get_account(app.db.as_ref(), account_id).await?;
	if account.status != AccountStatus::Valid {
		return Err(Error::acme(AcmeErrorKind::Unauthorized, "account is not valid"));
	}
	Ok(account)
}

/// Re-exported under a project-local name: the account model already lives
/// in `castellan_types::model::AcmeAccount`, this alias just keeps call
/// sites in this module readable.
pub type CastellanAccount = castellan_types::model::AcmeAccount;

/// Applied via `axum::middleware::from_fn_with_state` to every kid-authenticated
/// route. On success, inserts `AcmeAuth` (the verified account, consumed by
/// `castellan_core::extract::AcmeAuth`) and `JwsPayload` into the request
/// extensions and forwards a reconstructed request (the body having already
/// been drained to read the JWS).
pub async fn middleware(State(app): State<App>, req: Request, next: Next) -> Response {
	match try_authenticate(&app, req).await {
		Ok(req) => next.run(req).await,
		Err(err) => problem::with_fresh_nonce(&app, problem::render(err)).await,
	}
}

async fn try_authenticate(app: &App, req: Request) -> ClResult<Request> {
	let (mut parts, body) = req.into_parts();
	let uri = parts.uri.clone();
	// Route params are already in `parts.extensions` by the time this
	// middleware runs (it is mounted with `route_layer`, which wraps the
	// handler *after* routing has matched), so this reads them without
	// needing the request body.
	let params: Path<HashMap<String, String>> =
		Path::from_request_parts(&mut parts, &()).await.unwrap_or(Path(HashMap::new()));
	let provisioner_id = params.0.get("provisioner_id").cloned().unwrap_or_default();

	let bytes = axum::body::to_bytes(body, 1024 * 1024)
		.await
		.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "could not read request body"))?;
	let jws = FlattenedJws::parse(&bytes)?;
	let header = jws.protected_header()?;

	let expected_url = canonical_url(app, &uri);
	if header.url != expected_url {
		return Err(Error::acme(AcmeErrorKind::Unauthorized, "JWS url header does not match the request URL"));
	}
	crate::nonce::consume(app, &header.nonce).await?;

	let kid = header
		.kid
		.as_deref()
		.ok_or_else(|| Error::acme(AcmeErrorKind::Malformed, "request is missing a kid header"))?;
	let account = resolve_account(app, kid).await?;

	let expected_kid = urls::account(app, &provisioner_id, &account.id);
	if kid != expected_kid {
		return Err(Error::acme(AcmeErrorKind::Unauthorized, "kid does not match its provisioner"));
	}

	jws.verify(&header.alg, &account.jwk)?;
	let payload = jws.payload_json()?;

	parts.extensions.insert(AcmeAuth(account));
	parts.extensions.insert(JwsPayload(payload));
	Ok(Request::from_parts(parts, Body::from(bytes)))
}

// vim: ts=4
