//! Resource URL construction (spec §4.5, §6 "Link" headers). The external
//! base URL is explicit configuration (`config.acme.external_url`) rather
//! than inferred from the `Host` header, so a CA behind a reverse proxy with
//! a different public name still mints correct `Location`/`url` values.

use castellan_core::App;

pub fn base(app: &App, provisioner_id: &str) -> String {
	let root = app
		.config
		.acme
		.external_url
		.as_deref()
		.unwrap_or("https://localhost")
		.trim_end_matches('/');
	format!("{root}/acme/{provisioner_id}")
}

pub fn directory(app: &App, provisioner_id: &str) -> String {
	format!("{}/directory", base(app, provisioner_id))
}

pub fn new_nonce(app: &App, provisioner_id: &str) -> String {
	format!("{}/new-nonce", base(app, provisioner_id))
}

pub fn new_account(app: &App, provisioner_id: &str) -> String {
	format!("{}/new-account", base(app, provisioner_id))
}

pub fn new_order(app: &App, provisioner_id: &str) -> String {
	format!("{}/new-order", base(app, provisioner_id))
}

pub fn revoke_cert(app: &App, provisioner_id: &str) -> String {
	format!("{}/revoke-cert", base(app, provisioner_id))
}

pub fn key_change(app: &App, provisioner_id: &str) -> String {
	format!("{}/key-change", base(app, provisioner_id))
}

pub fn account(app: &App, provisioner_id: &str, account_id: &str) -> String {
	format!("{}/account/{account_id}", base(app, provisioner_id))
}

pub fn order(app: &App, provisioner_id: &str, order_id: &str) -> String {
	format!("{}/order/{order_id}", base(app, provisioner_id))
}

pub fn order_finalize(app: &App, provisioner_id: &str, order_id: &str) -> String {
	format!("{}/order/{order_id}/finalize", base(app, provisioner_id))
}

pub fn authz(app: &App, provisioner_id: &str, authz_id: &str) -> String {
	format!("{}/authz/{authz_id}", base(app, provisioner_id))
}

pub fn challenge(app: &App, provisioner_id: &str, challenge_id: &str) -> String {
	format!("{}/challenge/{challenge_id}", base(app, provisioner_id))
}

pub fn certificate(app: &App, provisioner_id: &str, serial: &str) -> String {
	format!("{}/cert/{serial}", base(app, provisioner_id))
}

// vim: ts=4
