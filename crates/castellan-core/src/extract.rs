//! Axum extractors shared across the `/1.0`, `/acme`, and `/scep` routers.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use castellan_types::model::AcmeAccount;
use castellan_types::prelude::*;

/// The ACME account bound to the current request, populated by
/// `castellan-acme`'s JWS verification middleware before the handler runs
/// (spec §4.5 "JWS binding": `kid` resolves to the account record). A
/// handler that declares `AcmeAuth` in its signature cannot run without a
/// verified account; there is no fallback path.
#[derive(Debug, Clone)]
pub struct AcmeAuth(pub AcmeAccount);

impl<S> FromRequestParts<S> for AcmeAuth
where
	S: Send + Sync,
{
	type Rejection = Error;

	async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
		parts
			.extensions
			.get::<AcmeAuth>()
			.cloned()
			.ok_or_else(|| Error::acme(AcmeErrorKind::Unauthorized, "no verified account on request"))
	}
}

/// Request ID attached by tracing middleware, surfaced to handlers that
/// need to echo it into an error detail or audit event.
#[derive(Clone, Debug)]
pub struct RequestId(pub Box<str>);

#[derive(Clone, Debug)]
pub struct OptionalRequestId(pub Option<Box<str>>);

impl<S> FromRequestParts<S> for OptionalRequestId
where
	S: Send + Sync,
{
	type Rejection = Error;

	async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
		Ok(OptionalRequestId(parts.extensions.get::<RequestId>().map(|r| r.0.clone())))
	}
}

// vim: ts=4
