//! The CRL regeneration cron job (spec §4.7 `Revoke`: "CRL is regenerated...
//! may be lazy with a short debounce"). Lives here rather than in
//! `castellan-pki` because `Task<App>` needs the `App` type, and
//! `castellan-pki` deliberately has no dependency on this crate.

use async_trait::async_trait;
use std::time::Duration;

use castellan_pki::crl;
use castellan_types::prelude::*;

use crate::app::App;
use crate::scheduler::Task;

/// Registered on a short cadence (e.g. every minute); `crl::is_dirty` makes
/// most ticks a no-op, so the debounce is really just "check the flag often,
/// regenerate rarely".
#[derive(Debug, Default)]
pub struct CrlRegenTask;

#[async_trait]
impl Task<App> for CrlRegenTask {
	fn name(&self) -> &'static str {
		"crl-regen"
	}

	async fn run(&self, app: &App) -> ClResult<()> {
		if !crl::is_dirty(app.db.as_ref()).await? {
			return Ok(());
		}
		crl::regenerate(app.db.as_ref(), app.kms.as_ref(), app.authority.ca_name(), app.authority.ca_key_uri()).await?;
		tracing::info!(target: "castellan::audit", "CRL regenerated");
		Ok(())
	}
}

/// How often `CrlRegenTask` should be registered to run. Exposed as a
/// constant rather than baked into a cron string so `server::main` can read
/// it when building the schedule expression.
pub const CRL_REGEN_DEBOUNCE: Duration = Duration::from_secs(crl::REGEN_DEBOUNCE_SECS as u64);

// vim: ts=4
