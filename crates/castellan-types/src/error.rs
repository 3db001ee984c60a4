//! The one error type shared by every layer of the CA, from adapters up
//! through the HTTP handlers. Kinds are closed (spec: "error kinds, not
//! type names") so callers match exhaustively instead of downcasting.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::warn;

pub type ClResult<T> = std::result::Result<T, Error>;

/// RFC 8555 §6.7 error registry. Carried as a distinct variant (rather than
/// folded into `AcmeErrorKind` strings scattered through handlers) so the
/// problem+json renderer in `castellan-acme::problem` has one place to read
/// the URN suffix from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeErrorKind {
	AccountDoesNotExist,
	AlreadyRevoked,
	BadCsr,
	BadNonce,
	BadPublicKey,
	BadRevocationReason,
	BadSignatureAlgorithm,
	CaaForbidden,
	CompoundError,
	ConnectionFailed,
	Dns,
	ExternalAccountRequired,
	IncorrectResponse,
	InvalidContact,
	Malformed,
	OrderNotReady,
	RateLimited,
	RejectedIdentifier,
	ServerInternal,
	Unauthorized,
	UnsupportedContact,
	UnsupportedIdentifier,
	UserActionRequired,
}

impl AcmeErrorKind {
	/// The `urn:ietf:params:acme:error:<kind>` suffix.
	pub fn urn_suffix(self) -> &'static str {
		match self {
			Self::AccountDoesNotExist => "accountDoesNotExist",
			Self::AlreadyRevoked => "alreadyRevoked",
			Self::BadCsr => "badCSR",
			Self::BadNonce => "badNonce",
			Self::BadPublicKey => "badPublicKey",
			Self::BadRevocationReason => "badRevocationReason",
			Self::BadSignatureAlgorithm => "badSignatureAlgorithm",
			Self::CaaForbidden => "caa",
			Self::CompoundError => "compound",
			Self::ConnectionFailed => "connection",
			Self::Dns => "dns",
			Self::ExternalAccountRequired => "externalAccountRequired",
			Self::IncorrectResponse => "incorrectResponse",
			Self::InvalidContact => "invalidContact",
			Self::Malformed => "malformed",
			Self::OrderNotReady => "orderNotReady",
			Self::RateLimited => "rateLimited",
			Self::RejectedIdentifier => "rejectedIdentifier",
			Self::ServerInternal => "serverInternal",
			Self::Unauthorized => "unauthorized",
			Self::UnsupportedContact => "unsupportedContact",
			Self::UnsupportedIdentifier => "unsupportedIdentifier",
			Self::UserActionRequired => "userActionRequired",
		}
	}

	pub fn status(self) -> StatusCode {
		match self {
			Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
			Self::UserActionRequired => StatusCode::FORBIDDEN,
			Self::ServerInternal => StatusCode::INTERNAL_SERVER_ERROR,
			_ => StatusCode::BAD_REQUEST,
		}
	}
}

#[derive(Debug)]
pub enum Error {
	// Core kinds (spec §7)
	BadRequest(String),
	Unauthorized(String),
	Forbidden(String),
	NotFound,
	Conflict(String),
	Transient(String),
	Internal(String),

	/// A failure that must surface through the ACME problem+json shape
	/// with a specific registry kind, e.g. `orderNotReady` or `badCSR`.
	Acme(AcmeErrorKind, String),

	/// SCEP `CertRep` failInfo, carried as its RFC 8894 integer code.
	ScepFailInfo(ScepFailInfo),

	Io(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScepFailInfo {
	BadAlg,
	BadMessageCheck,
	BadRequest,
	BadTime,
	BadCertId,
}

impl ScepFailInfo {
	pub fn code(self) -> u8 {
		match self {
			Self::BadAlg => 0,
			Self::BadMessageCheck => 1,
			Self::BadRequest => 2,
			Self::BadTime => 3,
			Self::BadCertId => 4,
		}
	}
}

impl Error {
	pub fn bad_request(msg: impl Into<String>) -> Self {
		Self::BadRequest(msg.into())
	}

	pub fn acme(kind: AcmeErrorKind, detail: impl Into<String>) -> Self {
		Self::Acme(kind, detail.into())
	}

	/// Maps a kind onto the internal `{type, detail, status}` HTTP status,
	/// used for `/1.0/*` and `/admin/*` — the non-ACME surfaces.
	fn status(&self) -> StatusCode {
		match self {
			Self::BadRequest(_) => StatusCode::BAD_REQUEST,
			Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			Self::Forbidden(_) => StatusCode::FORBIDDEN,
			Self::NotFound => StatusCode::NOT_FOUND,
			Self::Conflict(_) => StatusCode::CONFLICT,
			Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
			Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
			Self::Acme(kind, _) => kind.status(),
			Self::ScepFailInfo(_) => StatusCode::BAD_REQUEST,
			Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	fn type_tag(&self) -> &'static str {
		match self {
			Self::BadRequest(_) => "badRequest",
			Self::Unauthorized(_) => "unauthorized",
			Self::Forbidden(_) => "forbidden",
			Self::NotFound => "notFound",
			Self::Conflict(_) => "conflict",
			Self::Transient(_) => "transient",
			Self::Internal(_) => "internal",
			Self::Acme(kind, _) => kind.urn_suffix(),
			Self::ScepFailInfo(_) => "scepFailInfo",
			Self::Io(_) => "internal",
		}
	}

	/// Detail text safe to hand to a client: never carries token claims,
	/// HMAC keys, or private material (spec §7 "no secret data in errors").
	fn public_detail(&self) -> String {
		match self {
			Self::BadRequest(m) | Self::Unauthorized(m) | Self::Forbidden(m) | Self::Conflict(m)
			| Self::Transient(m) | Self::Acme(_, m) => m.clone(),
			Self::NotFound => "resource not found".into(),
			Self::Internal(_) | Self::Io(_) => "internal server error".into(),
			Self::ScepFailInfo(_) => "SCEP operation failed".into(),
		}
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl std::error::Error for Error {}

#[derive(Serialize)]
struct InternalErrorBody {
	#[serde(rename = "type")]
	kind: String,
	detail: String,
	status: u16,
}

impl IntoResponse for Error {
	/// Renders the internal `{type, detail, status}` shape (spec §6). ACME
	/// handlers wrap this error in `castellan_acme::problem` instead of
	/// returning it directly, since a problem+json response also needs a
	/// fresh `Replay-Nonce` header that only the ACME router's nonce store
	/// can mint.
	fn into_response(self) -> axum::response::Response {
		let status = self.status();
		if matches!(self, Error::Internal(_)) {
			if let Error::Internal(ref msg) = self {
				warn!(error = %msg, "internal error");
			}
		}
		let body = InternalErrorBody {
			kind: self.type_tag().to_string(),
			detail: self.public_detail(),
			status: status.as_u16(),
		};
		(status, Json(body)).into_response()
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		warn!(error = %err, "io error");
		Self::Io(err)
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		warn!(error = %err, "json error");
		Self::BadRequest("malformed JSON".into())
	}
}

impl From<std::time::SystemTimeError> for Error {
	fn from(err: std::time::SystemTimeError) -> Self {
		warn!(error = %err, "system time error");
		Self::Internal("system clock error".into())
	}
}

/// Helper macro for locking a `parking_lot`/`std` mutex with automatic
/// conversion of poisoning into `Error::Internal`.
#[macro_export]
macro_rules! lock {
	($mutex:expr) => {
		$mutex
			.lock()
			.map_err(|_| $crate::error::Error::Internal("mutex poisoned".into()))
	};
	($mutex:expr, $context:expr) => {
		$mutex
			.lock()
			.map_err(|_| $crate::error::Error::Internal(format!("mutex poisoned: {}", $context)))
	};
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn acme_kind_maps_to_expected_urn_suffix() {
		assert_eq!(AcmeErrorKind::BadNonce.urn_suffix(), "badNonce");
		assert_eq!(AcmeErrorKind::OrderNotReady.urn_suffix(), "orderNotReady");
		assert_eq!(AcmeErrorKind::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
	}

	#[test]
	fn internal_errors_never_leak_detail() {
		let err = Error::Internal("db handle at 10.0.0.5 leaked password hunter2".into());
		assert_eq!(err.public_detail(), "internal server error");
	}

	#[test]
	fn bad_request_detail_passes_through() {
		let err = Error::bad_request("CSR missing signature");
		assert_eq!(err.public_detail(), "CSR missing signature");
		assert_eq!(err.status(), StatusCode::BAD_REQUEST);
	}
}

// vim: ts=4
