//! Policy evaluation (spec §4.2). Deny-lists are checked first; any match
//! rejects. Then allow-lists: a non-empty allow-list requires a match, an
//! empty one permits everything for that identifier kind. Every SAN is
//! checked independently against its own kind's rules (spec: "Cross-identifier:
//! every SAN must individually pass its kind's rules").

use castellan_types::model::{Identifier, IdentifierType};
use castellan_types::provisioner::PolicyConfig;

/// Structured rejection (SPEC_FULL §5 supplement over a bare bool), so the
/// issuance pipeline's step 5 error and ACME's `rejectedIdentifier` problem
/// can both cite the exact value and rule that rejected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
	pub identifier: Identifier,
	pub rule: &'static str,
}

pub fn check_identifiers(config: &PolicyConfig, identifiers: &[Identifier]) -> Result<(), PolicyViolation> {
	for identifier in identifiers {
		check_one(config, identifier)?;
	}
	Ok(())
}

fn check_one(config: &PolicyConfig, identifier: &Identifier) -> Result<(), PolicyViolation> {
	let rule = match identifier.kind {
		IdentifierType::Dns => &config.dns,
		IdentifierType::Ip => &config.ip,
		IdentifierType::Email => &config.email,
		IdentifierType::Uri => &config.uri,
		IdentifierType::Permanentidentifier => &config.principal,
	};

	if matches_any(rule.deny.iter(), &identifier.value, identifier.kind) {
		return Err(PolicyViolation { identifier: identifier.clone(), rule: "deny" });
	}
	if !rule.allow.is_empty() && !matches_any(rule.allow.iter(), &identifier.value, identifier.kind) {
		return Err(PolicyViolation { identifier: identifier.clone(), rule: "allow" });
	}
	Ok(())
}

fn matches_any<'a>(
	patterns: impl Iterator<Item = &'a Box<str>>,
	value: &str,
	kind: IdentifierType,
) -> bool {
	patterns.any(|pattern| matches_pattern(pattern, value, kind))
}

fn matches_pattern(pattern: &str, value: &str, kind: IdentifierType) -> bool {
	match kind {
		IdentifierType::Dns => matches_dns_pattern(pattern, value),
		IdentifierType::Email => matches_email_pattern(pattern, value),
		IdentifierType::Ip => matches_cidr_pattern(pattern, value),
		IdentifierType::Uri | IdentifierType::Permanentidentifier => pattern == value,
	}
}

/// A leading `*.` matches exactly one label (spec §4.2 "wildcard semantics").
fn matches_dns_pattern(pattern: &str, value: &str) -> bool {
	if let Some(suffix) = pattern.strip_prefix("*.") {
		match value.split_once('.') {
			Some((_label, rest)) => rest == suffix,
			None => false,
		}
	} else {
		pattern.eq_ignore_ascii_case(value)
	}
}

/// `user@domain` with domain wildcards: a pattern of `*@domain` matches any
/// local part at that domain.
fn matches_email_pattern(pattern: &str, value: &str) -> bool {
	if let Some(domain) = pattern.strip_prefix("*@") {
		value.rsplit_once('@').map(|(_, d)| d.eq_ignore_ascii_case(domain)).unwrap_or(false)
	} else {
		pattern.eq_ignore_ascii_case(value)
	}
}

/// Minimal CIDR containment check for IPv4/IPv6, sufficient for the policy
/// allow/deny lists: no route aggregation, just "is this address within
/// this block".
fn matches_cidr_pattern(pattern: &str, value: &str) -> bool {
	let Ok(value_ip) = value.parse::<std::net::IpAddr>() else { return false };
	let Some((network_str, prefix_str)) = pattern.split_once('/') else {
		return pattern == value;
	};
	let Ok(network_ip) = network_str.parse::<std::net::IpAddr>() else { return false };
	let Ok(prefix_len) = prefix_str.parse::<u32>() else { return false };

	match (network_ip, value_ip) {
		(std::net::IpAddr::V4(net), std::net::IpAddr::V4(addr)) => {
			let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
			(u32::from(net) & mask) == (u32::from(addr) & mask)
		}
		(std::net::IpAddr::V6(net), std::net::IpAddr::V6(addr)) => {
			let mask = if prefix_len == 0 { 0u128 } else { u128::MAX << (128 - prefix_len) };
			(u128::from(net) & mask) == (u128::from(addr) & mask)
		}
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn id(kind: IdentifierType, value: &str) -> Identifier {
		Identifier { kind, value: value.into() }
	}

	#[test]
	fn deny_wins_over_allow() {
		let mut config = PolicyConfig::default();
		config.dns.allow.push("*.corp.test".into());
		config.dns.deny.push("admin.corp.test".into());

		let err = check_identifiers(&config, &[id(IdentifierType::Dns, "admin.corp.test")]);
		assert!(err.is_err());
	}

	#[test]
	fn empty_allow_list_permits_all() {
		let config = PolicyConfig::default();
		assert!(check_identifiers(&config, &[id(IdentifierType::Dns, "anything.test")]).is_ok());
	}

	#[test]
	fn wildcard_matches_exactly_one_label() {
		let mut config = PolicyConfig::default();
		config.dns.allow.push("*.corp.test".into());

		assert!(check_identifiers(&config, &[id(IdentifierType::Dns, "admin.corp.test")]).is_ok());
		assert!(check_identifiers(&config, &[id(IdentifierType::Dns, "a.b.corp.test")]).is_err());
	}

	#[test]
	fn cidr_allow_list_matches_containment() {
		let mut config = PolicyConfig::default();
		config.ip.allow.push("10.0.0.0/8".into());

		assert!(check_identifiers(&config, &[id(IdentifierType::Ip, "10.1.2.3")]).is_ok());
		assert!(check_identifiers(&config, &[id(IdentifierType::Ip, "192.168.1.1")]).is_err());
	}

	#[test]
	fn every_san_checked_independently() {
		let mut config = PolicyConfig::default();
		config.dns.deny.push("bad.test".into());

		let err = check_identifiers(
			&config,
			&[id(IdentifierType::Dns, "good.test"), id(IdentifierType::Dns, "bad.test")],
		);
		assert_eq!(err.unwrap_err().identifier.value.as_ref(), "bad.test");
	}
}

// vim: ts=4
