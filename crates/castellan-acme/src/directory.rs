//! `GET /acme/{provisioner}/directory` (SPEC_FULL §8 supplement): advertises
//! every route plus `meta.externalAccountRequired`, the one field RFC 8555
//! §7.1.1 clients actually branch on.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use castellan_core::App;
use castellan_types::prelude::*;

use crate::{problem, urls};

#[derive(Serialize)]
struct Meta {
	#[serde(rename = "externalAccountRequired", skip_serializing_if = "std::ops::Not::not")]
	external_account_required: bool,
}

#[derive(Serialize)]
struct Directory {
	#[serde(rename = "newNonce")]
	new_nonce: String,
	#[serde(rename = "newAccount")]
	new_account: String,
	#[serde(rename = "newOrder")]
	new_order: String,
	#[serde(rename = "revokeCert")]
	revoke_cert: String,
	#[serde(rename = "keyChange")]
	key_change: String,
	meta: Meta,
}

pub async fn get(State(app): State<App>, Path(provisioner_id): Path<String>) -> Response {
	let external_account_required = app
		.registry
		.get(&provisioner_id)
		.map(|p| p.options().require_eab)
		.unwrap_or(false);

	let body = Directory {
		new_nonce: urls::new_nonce(&app, &provisioner_id),
		new_account: urls::new_account(&app, &provisioner_id),
		new_order: urls::new_order(&app, &provisioner_id),
		revoke_cert: urls::revoke_cert(&app, &provisioner_id),
		key_change: urls::key_change(&app, &provisioner_id),
		meta: Meta { external_account_required },
	};
	let resp = axum::Json(body).into_response();
	problem::with_fresh_nonce(&app, resp).await
}

/// `HEAD`/`GET /acme/{provisioner}/new-nonce` (RFC 8555 §7.2): the only
/// route whose entire job is to mint a `Replay-Nonce`.
pub async fn new_nonce(State(app): State<App>, Path(_provisioner_id): Path<String>) -> Response {
	let resp = (axum::http::StatusCode::NO_CONTENT, ()).into_response();
	problem::with_fresh_nonce(&app, resp).await
}

// vim: ts=4
