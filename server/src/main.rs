//! CLI entry point (spec §6: "the CA process takes a config file path and a
//! signing-password source; no other flags affect the core"). Builds the
//! shared `App`, registers the two cron tasks, assembles the `/1.0`,
//! `/acme`, and `/scep` routers, and serves plain HTTP — TLS termination is
//! a deployment concern (spec §13 Non-goals), so there is no `rustls`
//! listener here, unlike the teacher's `axum-server` TLS setup.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

mod rest;

use std::path::PathBuf;
use std::sync::Arc;

use axum::middleware::{self, Next};
use axum::extract::Request;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use castellan_core::app::AppBuilder;
use castellan_core::config::Config;
use castellan_core::extract::RequestId;
use castellan_core::tasks::CrlRegenTask;
use castellan_db_adapter_sled::SledDbAdapter;
use castellan_kms_adapter_softkey::SoftkeyKmsAdapter;
use castellan_types::prelude::*;

/// "no other flags affect the core": `config` is the only required
/// argument, and `passphrase_env` only overrides *where* the signing
/// passphrase is read from, not what the core does with it — the default
/// already comes from `KmsConfig::Softkey::passphrase_env` in the config
/// file, so this flag exists purely for operators who need to point the
/// same config at a different secret-injection mechanism at deploy time.
#[derive(Debug, Parser)]
#[command(name = "castellan", about = "Online X.509 certificate authority")]
struct Cli {
	/// Path to the TOML configuration file.
	config: PathBuf,

	/// Environment variable to read the signing key passphrase from,
	/// overriding `kms.passphraseEnv` in the config file.
	#[arg(long)]
	passphrase_env: Option<Box<str>>,
}

#[tokio::main]
async fn main() -> ClResult<()> {
	tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

	let cli = Cli::parse();
	let config = Config::load(&cli.config)?;

	let db = Arc::new(SledDbAdapter::open(&config.db.path)?);

	let castellan_core::config::KmsConfig::Softkey { path: kms_path, passphrase_env } = &config.kms;
	let passphrase_env = cli.passphrase_env.as_deref().unwrap_or(passphrase_env.as_ref());
	let passphrase = std::env::var(passphrase_env).ok().map(String::into_bytes);
	let kms_db = Arc::new(SledDbAdapter::open(kms_path)?);
	let kms = Arc::new(SoftkeyKmsAdapter::new(kms_db, passphrase));

	let scep_enabled = config.scep.enabled;
	let listen_addr = config.server.listen_addr.clone();

	let app = AppBuilder { config, db, kms }.build().await?;

	app.scheduler.register(Arc::new(CrlRegenTask), "*/1 * * * *").await?;
	app.scheduler.register(Arc::new(castellan_acme::nonce::NonceSweepTask), "0 3 * * *").await?;
	app.scheduler.start(app.clone());

	let mut router: Router<castellan_core::app::App> = Router::new()
		.route("/1.0/sign", post(rest::sign))
		.route("/1.0/renew", post(rest::renew))
		.route("/1.0/revoke", post(rest::revoke))
		.merge(castellan_acme::router(&app))
		.merge(castellan_acme::admin_router());

	if scep_enabled {
		router = router.nest("/scep", castellan_scep::router(&app));
	}

	let router = router
		.layer(middleware::from_fn(request_id_middleware))
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::very_permissive())
		.with_state(app);

	let listener = tokio::net::TcpListener::bind(listen_addr.as_ref())
		.await
		.map_err(|e| Error::Internal(format!("could not bind {listen_addr}: {e}")))?;
	tracing::info!(addr = %listen_addr, "castellan listening");

	axum::serve(listener, router)
		.with_graceful_shutdown(shutdown_signal())
		.await
		.map_err(|e| Error::Internal(format!("server error: {e}")))
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	tracing::info!("shutdown signal received");
}

/// Stamps every request with an opaque ID before tracing sees it, the same
/// role the teacher's `request_id_middleware` plays in `routes.rs`.
async fn request_id_middleware(mut req: Request, next: Next) -> Response {
	let id = ResourceId::generate();
	req.extensions_mut().insert(RequestId(id.to_string().into()));
	next.run(req).await
}

// vim: ts=4
