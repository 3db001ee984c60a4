//! Authorization creation and retrieval (RFC 8555 §7.1.4, §7.5). An
//! authorization's validity is derived, not stored: "valid" iff at least
//! one of its challenges reached `valid` (spec §3 "Authorization").

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use castellan_core::extract::AcmeAuth;
use castellan_core::App;
use castellan_types::db_adapter::{Bucket, DbAdapter};
use castellan_types::model::{
	AcmeAuthorization, AcmeChallenge, AuthorizationStatus, ChallengeStatus, ChallengeType, Identifier, IdentifierType,
};
use castellan_types::prelude::*;

use crate::{problem, store, urls};

/// Which challenge types an authorization offers, based on the identifier
/// kind and whether the owning provisioner is a Wire provisioner (spec
/// §4.5: wire-oidc-01/wire-dpop-01 are Wire-specific; device-attest-01 is
/// offered for `permanentIdentifier` authorizations).
pub fn challenge_kinds_for(identifier: &Identifier, is_wire_provisioner: bool) -> Vec<ChallengeType> {
	match identifier.kind {
		IdentifierType::Dns | IdentifierType::Ip => {
			let mut kinds = vec![ChallengeType::Http01, ChallengeType::Dns01, ChallengeType::TlsAlpn01];
			if is_wire_provisioner {
				kinds.push(ChallengeType::WireOidc01);
				kinds.push(ChallengeType::WireDpop01);
			}
			kinds
		}
		IdentifierType::Permanentidentifier => vec![ChallengeType::DeviceAttest01],
		IdentifierType::Email | IdentifierType::Uri => Vec::new(),
	}
}

/// Builds a fresh, `pending` authorization plus its candidate challenges
/// for one order identifier. Caller persists both via `persist_new`.
pub fn build(order_id: &str, identifier: Identifier, expires: Timestamp, is_wire_provisioner: bool) -> (AcmeAuthorization, Vec<AcmeChallenge>) {
	let authz_id = ResourceId::generate().0;
	let challenges: Vec<AcmeChallenge> = challenge_kinds_for(&identifier, is_wire_provisioner)
		.into_iter()
		.map(|kind| AcmeChallenge {
			id: ResourceId::generate().0,
			authz_id: authz_id.clone(),
			kind,
			token: ResourceId::generate().0,
			status: ChallengeStatus::Pending,
			validation_record: None,
			error_detail: None,
		})
		.collect();

	let authz = AcmeAuthorization {
		id: authz_id,
		order_id: order_id.into(),
		identifier,
		status: AuthorizationStatus::Pending,
		challenge_ids: challenges.iter().map(|c| c.id.clone()).collect(),
		expires,
	};
	(authz, challenges)
}

pub async fn persist_new(db: &dyn DbAdapter, authz: &AcmeAuthorization, challenges: &[AcmeChallenge]) -> ClResult<()> {
	for challenge in challenges {
		store::put_challenge(db, challenge).await?;
	}
	store::put_authz(db, authz).await?;
	Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeBody {
	#[serde(rename = "type")]
	kind: ChallengeType,
	url: String,
	status: ChallengeStatus,
	token: Box<str>,
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
struct AuthzBody {
	identifier: IdentifierBody,
	status: AuthorizationStatus,
	expires: String,
	challenges: Vec<ChallengeBody>,
}

async fn render_authz(app: &App, provisioner_id: &str, authz: &AcmeAuthorization) -> ClResult<Response> {
	let mut challenges = Vec::with_capacity(authz.challenge_ids.len());
	for id in &authz.challenge_ids {
		let challenge = store::get_challenge(app.db.as_ref(), id).await?;
		challenges.push(ChallengeBody {
			kind: challenge.kind,
			url: urls::challenge(app, provisioner_id, &challenge.id),
			status: challenge.status,
			token: challenge.token,
		});
	}
	let body = AuthzBody {
		identifier: IdentifierBody { kind: authz.identifier.kind, value: authz.identifier.value.clone() },
		status: authz.status,
		expires: authz.expires.to_rfc3339(),
		challenges,
	};
	Ok(axum::Json(body).into_response())
}

/// `POST-as-GET /acme/{provisioner}/authz/{id}` (RFC 8555 §7.5).
pub async fn get(
	State(app): State<App>,
	Path((provisioner_id, authz_id)): Path<(String, String)>,
	AcmeAuth(account): AcmeAuth,
) -> Response {
	let resp = match fetch_owned(&app, &account, &authz_id).await {
		Ok(authz) => render_authz(&app, &provisioner_id, &authz).await.unwrap_or_else(problem::render),
		Err(err) => problem::render(err),
	};
	problem::with_fresh_nonce(&app, resp).await
}

async fn fetch_owned(
	app: &App,
	account: &castellan_types::model::AcmeAccount,
	authz_id: &str,
) -> ClResult<AcmeAuthorization> {
	let authz = store::get_authz(app.db.as_ref(), authz_id).await?;
	let order = store::get_order(app.db.as_ref(), &authz.order_id).await?;
	if order.account_id != account.id {
		return Err(Error::acme(AcmeErrorKind::Unauthorized, "authorization does not belong to this account"));
	}
	Ok(authz)
}

/// Recomputes `order.status` from its authorizations (spec §3: pending →
/// ready once every authorization is valid). Called after a challenge
/// validates; idempotent and safe to call redundantly.
pub async fn promote_order_if_ready(db: &dyn DbAdapter, order_id: &str) -> ClResult<()> {
	let order = store::get_order(db, order_id).await?;
	if order.status != castellan_types::model::OrderStatus::Pending {
		return Ok(());
	}
	let mut all_valid = true;
	for authz_id in &order.authorization_ids {
		let authz = store::get_authz(db, authz_id).await?;
		if authz.status != AuthorizationStatus::Valid {
			all_valid = false;
			break;
		}
	}
	if !all_valid {
		return Ok(());
	}
	let mut ready = order.clone();
	ready.status = castellan_types::model::OrderStatus::Ready;
	match store::cas_replace(db, Bucket::AcmeOrders, &order.id, &order, &ready).await {
		Ok(()) | Err(Error::Conflict(_)) => Ok(()),
		Err(other) => Err(other),
	}
}

// vim: ts=4
