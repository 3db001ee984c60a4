//! `new-account`, account update/deactivation, key-change, and order
//! listing (RFC 8555 §7.3, §7.3.5, §7.3.6). `new-account` is the one
//! account-surface route that runs ahead of `auth::middleware` — the
//! request carries a `jwk`, not a `kid`, since the account doesn't exist
//! yet — so it does its own JWS parse-and-verify here.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use castellan_core::extract::AcmeAuth;
use castellan_core::App;
use castellan_types::db_adapter::Bucket;
use castellan_types::model::{AccountStatus, AcmeAccount, AcmeOrder, AuthorizationStatus, OrderStatus};
use castellan_types::prelude::*;

use crate::auth::JwsPayload;
use crate::jws::FlattenedJws;
use crate::{eab, problem, store, urls};

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct NewAccountPayload {
	#[serde(default)]
	contact: Vec<Box<str>>,
	#[serde(default)]
	only_return_existing: bool,
	#[serde(default)]
	external_account_binding: Option<FlattenedJws>,
}

#[derive(Serialize)]
struct AccountBody {
	status: AccountStatus,
	contact: Vec<Box<str>>,
	orders: String,
}

fn render_account(app: &App, provisioner_id: &str, account: &AcmeAccount, created: bool) -> Response {
	let body = AccountBody {
		status: account.status,
		contact: account.contacts.clone(),
		orders: urls::account(app, provisioner_id, &account.id) + "/orders",
	};
	let location = urls::account(app, provisioner_id, &account.id);
	let status = if created { StatusCode::CREATED } else { StatusCode::OK };
	let mut resp = (status, axum::Json(body)).into_response();
	if let Ok(value) = axum::http::HeaderValue::from_str(&location) {
		resp.headers_mut().insert(axum::http::header::LOCATION, value);
	}
	resp
}

/// `POST /acme/{provisioner}/new-account` (RFC 8555 §7.3).
pub async fn new_account(
	State(app): State<App>,
	Path(provisioner_id): Path<String>,
	body: Bytes,
) -> Response {
	match try_new_account(&app, &provisioner_id, &body).await {
		Ok(resp) => problem::with_fresh_nonce(&app, resp).await,
		Err(err) => problem::with_fresh_nonce(&app, problem::render(err)).await,
	}
}

async fn try_new_account(app: &App, provisioner_id: &str, body: &[u8]) -> ClResult<Response> {
	let provisioner = app
		.registry
		.get(provisioner_id)
		.ok_or_else(|| Error::bad_request("unknown provisioner"))?;

	let jws = FlattenedJws::parse(body)?;
	let header = jws.protected_header()?;
	let expected_url = urls::new_account(app, provisioner_id);
	if header.url != expected_url {
		return Err(Error::acme(AcmeErrorKind::Unauthorized, "JWS url header does not match the request URL"));
	}
	crate::nonce::consume(app, &header.nonce).await?;

	let jwk = header
		.jwk
		.clone()
		.ok_or_else(|| Error::acme(AcmeErrorKind::Malformed, "new-account request must carry a jwk header"))?;
	if header.kid.is_some() {
		return Err(Error::acme(AcmeErrorKind::Malformed, "new-account request must not carry a kid header"));
	}
	jws.verify(&header.alg, &jwk)?;

	let thumbprint = crate::jws::thumbprint(&jwk)?;
	let payload: NewAccountPayload = match jws.payload_json()? {
		serde_json::Value::Null => NewAccountPayload::default(),
		value => serde_json::from_value(value)
			.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "malformed new-account payload"))?,
	};

	if let Some(existing) = store::get_account_by_key_id(app.db.as_ref(), provisioner_id, &thumbprint).await? {
		return Ok(render_account(app, provisioner_id, &existing, false));
	}

	if payload.only_return_existing {
		return Err(Error::acme(AcmeErrorKind::AccountDoesNotExist, "no account exists for this key"));
	}

	let id: Box<str> = ResourceId::generate().0;
	let mut eab_key_id = None;
	if provisioner.options().require_eab {
		let eab_jws = payload.external_account_binding.ok_or_else(|| {
			Error::acme(AcmeErrorKind::ExternalAccountRequired, "this provisioner requires external account binding")
		})?;
		eab_key_id = Some(eab::verify_and_bind(app, provisioner_id, &expected_url, &jwk, &id, &eab_jws).await?);
	}

	let account = AcmeAccount {
		id: id.clone(),
		provisioner_id: provisioner_id.into(),
		key_thumbprint: thumbprint.clone().into(),
		jwk,
		status: AccountStatus::Valid,
		contacts: payload.contact,
		eab_key_id,
		created_at: Timestamp::now(),
	};

	app.db
		.cmp_and_swap(
			Bucket::AcmeAccountByKeyId,
			&format!("{provisioner_id}/{thumbprint}"),
			None,
			Some(account.id.as_bytes().to_vec()),
		)
		.await
		.map_err(|err| match err {
			Error::Conflict(_) => Error::acme(AcmeErrorKind::Malformed, "an account already exists for this key"),
			other => other,
		})?;
	store::put_account(app.db.as_ref(), &account).await?;

	Ok(render_account(app, provisioner_id, &account, true))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AccountUpdatePayload {
	#[serde(default)]
	contact: Option<Vec<Box<str>>>,
	#[serde(default)]
	status: Option<AccountStatus>,
}

/// `POST /acme/{provisioner}/account/{id}` (RFC 8555 §7.3.2, §7.3.6): contact
/// update or deactivation. Runs behind `auth::middleware`, so `AcmeAuth` is
/// already the verified, current account record.
pub async fn update(
	State(app): State<App>,
	Path((provisioner_id, _account_id)): Path<(String, String)>,
	AcmeAuth(account): AcmeAuth,
	JwsPayload(payload): JwsPayload,
) -> Response {
	match try_update(&app, &provisioner_id, account, payload).await {
		Ok(resp) => problem::with_fresh_nonce(&app, resp).await,
		Err(err) => problem::with_fresh_nonce(&app, problem::render(err)).await,
	}
}

async fn try_update(
	app: &App,
	provisioner_id: &str,
	account: AcmeAccount,
	payload: serde_json::Value,
) -> ClResult<Response> {
	let update: AccountUpdatePayload = match payload {
		serde_json::Value::Null => AccountUpdatePayload::default(),
		value => serde_json::from_value(value)
			.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "malformed account-update payload"))?,
	};

	if let Some(AccountStatus::Deactivated) = update.status {
		let mut deactivated = account.clone();
		deactivated.status = AccountStatus::Deactivated;
		store::cas_replace(app.db.as_ref(), Bucket::AcmeAccounts, &account.id, &account, &deactivated).await?;
		cascade_deactivate(app, &account.id).await?;
		return Ok(render_account(app, provisioner_id, &deactivated, false));
	}

	if let Some(contact) = update.contact {
		let mut updated = account.clone();
		updated.contacts = contact;
		store::cas_replace(app.db.as_ref(), Bucket::AcmeAccounts, &account.id, &account, &updated).await?;
		return Ok(render_account(app, provisioner_id, &updated, false));
	}

	Ok(render_account(app, provisioner_id, &account, false))
}

/// spec §8 "Deactivation: ... all of that account's pending orders/authzs
/// become invalid." Scans `Bucket::AcmeOrders` the same way `orders` does,
/// then CAS-transitions each of the account's non-terminal orders (and
/// their authorizations) to `invalid`. A CAS conflict on one record is
/// logged and skipped rather than aborting the cascade — a retried
/// deactivation of an already-mostly-cascaded account still converges.
async fn cascade_deactivate(app: &App, account_id: &str) -> ClResult<()> {
	let rows = app.db.list(Bucket::AcmeOrders).await?;
	for (_, bytes) in rows {
		let order: castellan_types::storage::VersionedRecord<AcmeOrder> =
			match castellan_types::storage::VersionedRecord::decode(&bytes) {
				Ok(v) => v,
				Err(_) => continue,
			};
		let order = order.value;
		if order.account_id.as_ref() != account_id {
			continue;
		}

		for authz_id in &order.authorization_ids {
			let authz = match store::get_authz(app.db.as_ref(), authz_id).await {
				Ok(a) => a,
				Err(_) => continue,
			};
			if matches!(authz.status, AuthorizationStatus::Pending | AuthorizationStatus::Valid) {
				let mut invalidated = authz.clone();
				invalidated.status = AuthorizationStatus::Invalid;
				if let Err(err) =
					store::cas_replace(app.db.as_ref(), Bucket::AcmeAuthzs, authz_id, &authz, &invalidated).await
				{
					tracing::warn!(%authz_id, %err, "could not invalidate authorization during account deactivation");
				}
			}
		}

		if matches!(order.status, OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing) {
			let mut invalidated = order.clone();
			invalidated.status = OrderStatus::Invalid;
			if let Err(err) =
				store::cas_replace(app.db.as_ref(), Bucket::AcmeOrders, &order.id, &order, &invalidated).await
			{
				tracing::warn!(order_id = %order.id, %err, "could not invalidate order during account deactivation");
			}
		}
	}
	Ok(())
}

#[derive(Deserialize)]
struct KeyChangePayload {
	protected: String,
	payload: String,
	signature: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyChangeInnerPayload {
	account: String,
	#[serde(rename = "oldKey")]
	old_key: serde_json::Value,
}

/// `POST /acme/{provisioner}/key-change` (RFC 8555 §7.3.5): the outer JWS
/// (verified by `auth::middleware` against the *old* key, which is still
/// `kid`-addressable at this point) wraps an inner JWS signed by the *new*
/// key whose payload names the account URL and echoes the old key, so both
/// keys attest to the swap before the index is repointed.
pub async fn key_change(
	State(app): State<App>,
	Path(provisioner_id): Path<String>,
	AcmeAuth(account): AcmeAuth,
	JwsPayload(outer_payload): JwsPayload,
) -> Response {
	match try_key_change(&app, &provisioner_id, account, outer_payload).await {
		Ok(resp) => problem::with_fresh_nonce(&app, resp).await,
		Err(err) => problem::with_fresh_nonce(&app, problem::render(err)).await,
	}
}

async fn try_key_change(
	app: &App,
	provisioner_id: &str,
	account: AcmeAccount,
	outer_payload: serde_json::Value,
) -> ClResult<Response> {
	let inner: KeyChangePayload = serde_json::from_value(outer_payload)
		.map_err(|_| Error::acme(AcmeErrorKind::Malformed, "key-change payload must carry an inner JWS"))?;
	let inner_jws = FlattenedJws { protected: inner.protected, payload: inner.payload, signature: inner.signature };
	let inner_header = inner_jws.protected_header()?;
	let expected_url = urls::key_change(app, provisioner_id);
	if inner_header.url != expected_url {
		return Err(Error::acme(AcmeErrorKind::Malformed, "inner JWS url does not match the request URL"));
	}
	let new_jwk = inner_header
		.jwk
		.ok_or_else(|| Error::acme(AcmeErrorKind::Malformed, "inner JWS must carry the new jwk"))?;
	inner_jws.verify(&inner_header.alg, &new_jwk)?;

	let inner_payload: KeyChangeInnerPayload = inner_jws
		.payload_json()
		.and_then(|v| serde_json::from_value(v).map_err(|_| Error::acme(AcmeErrorKind::Malformed, "malformed inner key-change payload")))?;
	if inner_payload.account != urls::account(app, provisioner_id, &account.id) {
		return Err(Error::acme(AcmeErrorKind::Malformed, "inner payload account does not match kid"));
	}
	if inner_payload.old_key != account.jwk {
		return Err(Error::acme(AcmeErrorKind::Malformed, "inner payload oldKey does not match the account's current key"));
	}

	let new_thumbprint = crate::jws::thumbprint(&new_jwk)?;
	if store::get_account_by_key_id(app.db.as_ref(), provisioner_id, &new_thumbprint).await?.is_some() {
		return Err(Error::acme(AcmeErrorKind::Malformed, "new key is already in use by another account"));
	}

	let mut swapped = account.clone();
	swapped.jwk = new_jwk;
	swapped.key_thumbprint = new_thumbprint.clone().into();

	app.db
		.cmp_and_swap(
			Bucket::AcmeAccountByKeyId,
			&format!("{provisioner_id}/{new_thumbprint}"),
			None,
			Some(account.id.as_bytes().to_vec()),
		)
		.await
		.map_err(|err| match err {
			Error::Conflict(_) => Error::acme(AcmeErrorKind::Malformed, "new key is already in use by another account"),
			other => other,
		})?;
	store::cas_replace(app.db.as_ref(), Bucket::AcmeAccounts, &account.id, &account, &swapped).await?;
	let _ = app
		.db
		.del(Bucket::AcmeAccountByKeyId, &format!("{provisioner_id}/{}", account.key_thumbprint))
		.await;

	Ok((StatusCode::OK, ()).into_response())
}

#[derive(Serialize)]
struct OrdersBody {
	orders: Vec<String>,
}

/// `POST-as-GET /acme/{provisioner}/account/{id}/orders` (RFC 8555 §7.1.2.1).
pub async fn orders(
	State(app): State<App>,
	Path((provisioner_id, _account_id)): Path<(String, String)>,
	AcmeAuth(account): AcmeAuth,
) -> Response {
	let rows = match app.db.list(Bucket::AcmeOrders).await {
		Ok(rows) => rows,
		Err(err) => return problem::with_fresh_nonce(&app, problem::render(err)).await,
	};

	let mut urls_out = Vec::new();
	for (_, bytes) in rows {
		let order: castellan_types::storage::VersionedRecord<castellan_types::model::AcmeOrder> =
			match castellan_types::storage::VersionedRecord::decode(&bytes) {
				Ok(v) => v,
				Err(_) => continue,
			};
		if order.value.account_id == account.id {
			urls_out.push(urls::order(&app, &provisioner_id, &order.value.id));
		}
	}

	let resp = axum::Json(OrdersBody { orders: urls_out }).into_response();
	problem::with_fresh_nonce(&app, resp).await
}

// vim: ts=4
