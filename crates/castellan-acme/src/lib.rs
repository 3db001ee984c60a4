//! RFC 8555 ACME server surface (spec §4.5). Every provisioner gets its own
//! namespace, `/acme/{provisioner_id}/...`, so one CA instance can run
//! several independently-configured ACME endpoints (spec §3 Provisioner is
//! the unit of policy). `router` assembles the full surface; everything
//! behind a verified account goes through `auth::middleware` via
//! `route_layer`, which runs after routing so path params are already
//! populated.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod auth;
pub mod authz;
pub mod challenge;
pub mod directory;
pub mod eab;
pub mod jws;
pub mod nonce;
pub mod order;
pub mod problem;
pub mod store;
pub mod urls;

use axum::Router;
use axum::routing::{delete, get, post};

use castellan_core::App;

/// `/acme/{provisioner_id}/*`: directory, new-nonce, and new-account run
/// unauthenticated (the first two carry no JWS at all; new-account is
/// signed with a bare `jwk`, not yet a `kid`). `revoke-cert` also runs
/// outside `route_layer` — RFC 8555 §7.6 allows it to be signed by the
/// certificate's own key instead of an account key, so it verifies its own
/// JWS in `order::revoke_cert` rather than going through the `kid`-only
/// `auth::middleware`. Everything else requires a verified `kid`-addressed
/// JWS, enforced by `route_layer`.
pub fn router(app: &App) -> Router<App> {
	let authenticated = Router::new()
		.route("/account/{account_id}", post(account::update))
		.route("/account/{account_id}/orders", get(account::orders))
		.route("/new-order", post(order::new_order))
		.route("/order/{order_id}", post(order::get))
		.route("/order/{order_id}/finalize", post(order::finalize))
		.route("/authz/{authz_id}", post(authz::get))
		.route("/challenge/{challenge_id}", post(challenge::get))
		.route("/challenge/{challenge_id}/validate", post(challenge::validate))
		.route("/key-change", post(account::key_change))
		.route("/cert/{serial}", get(order::certificate))
		.route_layer(axum::middleware::from_fn_with_state(app.clone(), auth::middleware));

	let public = Router::new()
		.route("/directory", get(directory::get))
		.route("/new-nonce", get(directory::new_nonce).head(directory::new_nonce))
		.route("/new-account", post(account::new_account))
		.route("/revoke-cert", post(order::revoke_cert));

	Router::new().nest("/acme/{provisioner_id}", public.merge(authenticated))
}

/// `/admin/acme/eab`: gated by `eab::check_admin_token` (a bearer secret
/// from the environment), not by the account-JWS middleware above — there
/// is no ACME account yet when a key is being provisioned.
pub fn admin_router() -> Router<App> {
	Router::new()
		.route("/admin/acme/eab", post(eab::create).get(eab::list))
		.route("/admin/acme/eab/{id}", delete(eab::delete))
}

// vim: ts=4
