//! Certificate template rendering (spec §4.2). A template is a handlebars
//! text template whose render output is parsed as the JSON certificate
//! spec the rest of the issuance pipeline consumes. Grounded on the
//! teacher's `cloudillo-email::template` engine: one `Handlebars` instance
//! with strict mode on (undefined variables are a render error, not a
//! silently empty string) and a curated helper set instead of the full
//! handlebars-helpers crate.

use handlebars::{
	Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderErrorReason,
};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use castellan_types::model::Identifier;
use castellan_types::prelude::*;

/// The CSR fields a template can read: already-parsed, never raw DER, so a
/// template never needs to know anything about ASN.1.
#[derive(Debug, Clone, Serialize)]
pub struct CsrTemplateInput {
	pub public_key_der: Vec<u8>,
	pub requested_cn: Option<Box<str>>,
	pub requested_sans: Vec<Identifier>,
}

/// The JSON document a rendered template must produce (spec §4.2 "Output").
#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
	pub subject_cn: Box<str>,
	pub sans: Vec<Identifier>,
	pub key_usages: Vec<Box<str>>,
	pub extended_key_usages: Vec<Box<str>>,
	pub not_before: Timestamp,
	pub not_after: Timestamp,
}

pub struct TemplateEngine {
	handlebars: Handlebars<'static>,
}

impl std::fmt::Debug for TemplateEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TemplateEngine").finish()
	}
}

impl Default for TemplateEngine {
	fn default() -> Self {
		Self::new()
	}
}

impl TemplateEngine {
	pub fn new() -> Self {
		let mut handlebars = Handlebars::new();
		handlebars.set_strict_mode(true);
		handlebars.register_helper("base64", Box::new(base64_helper));
		handlebars.register_helper("base64url", Box::new(base64url_helper));
		handlebars.register_helper("hex", Box::new(hex_helper));
		handlebars.register_helper("jsonEscape", Box::new(json_escape_helper));
		handlebars.register_helper("uuid", Box::new(uuid_helper));
		handlebars.register_helper("timeNow", Box::new(time_now_helper));
		handlebars.register_helper("timeAdd", Box::new(time_add_helper));
		handlebars.register_helper("sanitizeSan", Box::new(sanitize_san_helper));
		handlebars.register_helper("fail", Box::new(fail_helper));
		Self { handlebars }
	}

	/// Renders `template` against the union of provisioner claims, the
	/// provisioner's configured template data, and the CSR, then parses the
	/// output as a `CertificateSpec`. Deterministic given identical inputs
	/// (spec §4.2 "Rendering is deterministic").
	pub fn render(
		&self,
		template: &str,
		claims: &serde_json::Value,
		template_data: &serde_json::Map<String, serde_json::Value>,
		csr: &CsrTemplateInput,
	) -> ClResult<CertificateSpec> {
		let mut data = serde_json::Map::new();
		data.insert("claims".to_string(), claims.clone());
		data.insert("templateData".to_string(), serde_json::Value::Object(template_data.clone()));
		data.insert(
			"csr".to_string(),
			serde_json::to_value(csr)
				.map_err(|e| Error::Internal(format!("csr serialization failed: {e}")))?,
		);

		let rendered = self
			.handlebars
			.render_template(template, &serde_json::Value::Object(data))
			.map_err(|e| Error::bad_request(format!("template render failed: {e}")))?;

		serde_json::from_str(&rendered)
			.map_err(|e| Error::bad_request(format!("rendered template is not a valid cert spec: {e}")))
	}
}

fn base64_helper(
	h: &Helper,
	_: &Handlebars,
	_: &Context,
	_: &mut RenderContext,
	out: &mut dyn Output,
) -> HelperResult {
	use base64::Engine as _;
	let value = required_str(h, 0)?;
	out.write(&base64::engine::general_purpose::STANDARD.encode(value))?;
	Ok(())
}

fn base64url_helper(
	h: &Helper,
	_: &Handlebars,
	_: &Context,
	_: &mut RenderContext,
	out: &mut dyn Output,
) -> HelperResult {
	use base64::Engine as _;
	let value = required_str(h, 0)?;
	out.write(&base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(value))?;
	Ok(())
}

fn hex_helper(
	h: &Helper,
	_: &Handlebars,
	_: &Context,
	_: &mut RenderContext,
	out: &mut dyn Output,
) -> HelperResult {
	let value = required_str(h, 0)?;
	out.write(&hex::encode(value))?;
	Ok(())
}

fn json_escape_helper(
	h: &Helper,
	_: &Handlebars,
	_: &Context,
	_: &mut RenderContext,
	out: &mut dyn Output,
) -> HelperResult {
	let value = required_str(h, 0)?;
	let escaped = serde_json::to_string(value)
		.map_err(|e| RenderErrorReason::Other(e.to_string()))?;
	// serde_json::to_string on a &str includes the surrounding quotes;
	// the helper only escapes, it doesn't quote.
	out.write(escaped.trim_matches('"'))?;
	Ok(())
}

fn uuid_helper(
	_: &Helper,
	_: &Handlebars,
	_: &Context,
	_: &mut RenderContext,
	out: &mut dyn Output,
) -> HelperResult {
	out.write(&uuid::Uuid::new_v4().to_string())?;
	Ok(())
}

fn time_now_helper(
	_: &Helper,
	_: &Handlebars,
	_: &Context,
	_: &mut RenderContext,
	out: &mut dyn Output,
) -> HelperResult {
	out.write(&Timestamp::now().0.to_string())?;
	Ok(())
}

fn time_add_helper(
	h: &Helper,
	_: &Handlebars,
	_: &Context,
	_: &mut RenderContext,
	out: &mut dyn Output,
) -> HelperResult {
	let base = h
		.param(0)
		.and_then(|p| p.value().as_i64())
		.ok_or_else(|| RenderErrorReason::ParamNotFoundForIndex("timeAdd", 0))?;
	let delta = h
		.param(1)
		.and_then(|p| p.value().as_i64())
		.ok_or_else(|| RenderErrorReason::ParamNotFoundForIndex("timeAdd", 1))?;
	out.write(&(base + delta).to_string())?;
	Ok(())
}

/// Strips characters a DNS/URI SAN must not contain, per spec §4.2's
/// hostname-sanitizer requirement. Keeps ASCII alphanumerics, `-`, `.`,
/// and `*` (for wildcard SANs); everything else is dropped rather than
/// percent-encoded, since a sanitized SAN is meant to be safe, not
/// reversible.
fn sanitize_san_helper(
	h: &Helper,
	_: &Handlebars,
	_: &Context,
	_: &mut RenderContext,
	out: &mut dyn Output,
) -> HelperResult {
	let value = required_str(h, 0)?;
	let sanitized: String = value
		.chars()
		.filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '*'))
		.collect();
	out.write(&sanitized)?;
	Ok(())
}

fn fail_helper(
	h: &Helper,
	_: &Handlebars,
	_: &Context,
	_: &mut RenderContext,
	_out: &mut dyn Output,
) -> HelperResult {
	let message = h.param(0).and_then(|p| p.value().as_str()).unwrap_or("template aborted");
	Err(RenderErrorReason::Other(message.to_string()).into())
}

fn required_str<'a>(h: &'a Helper, index: usize) -> Result<&'a str, handlebars::RenderError> {
	h.param(index)
		.and_then(|p| p.value().as_str())
		.ok_or_else(|| RenderErrorReason::ParamNotFoundForIndex("helper", index).into())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn engine() -> TemplateEngine {
		TemplateEngine::new()
	}

	fn csr() -> CsrTemplateInput {
		CsrTemplateInput {
			public_key_der: vec![1, 2, 3],
			requested_cn: Some("a.test".into()),
			requested_sans: vec![],
		}
	}

	#[test]
	fn renders_deterministic_spec_for_identical_inputs() {
		let engine = engine();
		let template = r#"{
			"subjectCn": "{{csr.requestedCn}}",
			"sans": [],
			"keyUsages": ["digitalSignature"],
			"extendedKeyUsages": ["serverAuth"],
			"notBefore": {{timeNow}},
			"notAfter": {{timeAdd (timeNow) 86400}}
		}"#;
		let claims = serde_json::json!({});
		let data = serde_json::Map::new();

		let a = engine.render(template, &claims, &data, &csr()).unwrap();
		let b = engine.render(template, &claims, &data, &csr()).unwrap();
		assert_eq!(a.subject_cn, b.subject_cn);
		assert_eq!(a.subject_cn.as_ref(), "a.test");
	}

	#[test]
	fn fail_helper_aborts_rendering() {
		let engine = engine();
		let template = r#"{{fail "denied by template"}}"#;
		let result = engine.render(template, &serde_json::json!({}), &serde_json::Map::new(), &csr());
		assert!(result.is_err());
	}

	#[test]
	fn sanitize_san_strips_unsafe_characters() {
		let engine = engine();
		let template = r#"{
			"subjectCn": "{{sanitizeSan "evil<script>.test"}}",
			"sans": [],
			"keyUsages": [],
			"extendedKeyUsages": [],
			"notBefore": 0,
			"notAfter": 1
		}"#;
		let spec =
			engine.render(template, &serde_json::json!({}), &serde_json::Map::new(), &csr()).unwrap();
		assert_eq!(spec.subject_cn.as_ref(), "evilscript.test");
	}
}

// vim: ts=4
