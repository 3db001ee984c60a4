//! Common scalar types used throughout the Castellan platform.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Unix-epoch second timestamp, serialized as an integer everywhere except
/// the ACME JSON surface, which wants RFC 3339 (see `serialize_rfc3339`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
	pub fn now() -> Timestamp {
		let secs = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs();
		Timestamp(secs as i64)
	}

	pub fn from_now(delta_secs: i64) -> Timestamp {
		Timestamp(Timestamp::now().0 + delta_secs)
	}

	pub fn add_seconds(&self, seconds: i64) -> Timestamp {
		Timestamp(self.0 + seconds)
	}

	pub fn is_past(&self) -> bool {
		*self < Timestamp::now()
	}

	pub fn to_rfc3339(self) -> String {
		chrono::DateTime::from_timestamp(self.0, 0)
			.unwrap_or_default()
			.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
	}
}

impl fmt::Display for Timestamp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl Serialize for Timestamp {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_i64(self.0)
	}
}

impl<'de> Deserialize<'de> for Timestamp {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		Ok(Timestamp(i64::deserialize(deserializer)?))
	}
}

pub fn serialize_rfc3339<S: serde::Serializer>(ts: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
	s.serialize_str(&ts.to_rfc3339())
}

pub fn serialize_rfc3339_opt<S: serde::Serializer>(
	ts: &Option<Timestamp>,
	s: S,
) -> Result<S::Ok, S::Error> {
	match ts {
		Some(ts) => s.serialize_some(&ts.to_rfc3339()),
		None => s.serialize_none(),
	}
}

/// Opaque, unguessable resource identifier (spec: "all ACME resource
/// identifiers are opaque, unguessable tokens >= 128 bits"). Wraps a
/// base64url-encoded random value; never parsed for structure.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub Box<str>);

impl ResourceId {
	/// Generate a new opaque ID with >= 128 bits of entropy.
	pub fn generate() -> Self {
		use base64::Engine as _;
		let mut bytes = [0u8; 18]; // 144 bits
		getrandom(&mut bytes);
		ResourceId(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes).into())
	}
}

impl fmt::Display for ResourceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl AsRef<str> for ResourceId {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

/// Thin wrapper so the one place we touch an RNG for ID generation is
/// auditable and swappable without pulling `rand` into every crate that
/// needs a `ResourceId`.
fn getrandom(buf: &mut [u8]) {
	use std::cell::RefCell;

	thread_local! {
		static STATE: RefCell<u64> = RefCell::new(seed());
	}

	fn seed() -> u64 {
		let nanos = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.unwrap_or_default()
			.as_nanos() as u64;
		nanos ^ (std::process::id() as u64).rotate_left(32)
	}

	STATE.with(|state| {
		let mut x = *state.borrow();
		for byte in buf.iter_mut() {
			// xorshift64*: fine for ID entropy, not used for key material.
			x ^= x << 13;
			x ^= x >> 7;
			x ^= x << 17;
			*byte = (x & 0xff) as u8;
		}
		*state.borrow_mut() = x;
	});
}

/// A 128-bit serial number, hex-encoded in its `Display`/`Serialize` form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Serial(pub u128);

impl Serial {
	pub fn random() -> Self {
		let mut bytes = [0u8; 16];
		getrandom(&mut bytes);
		// Clear the top bit so the DER INTEGER encoding never needs a
		// leading zero byte to stay non-negative.
		bytes[0] &= 0x7f;
		Serial(u128::from_be_bytes(bytes))
	}

	pub fn to_be_bytes(self) -> [u8; 16] {
		self.0.to_be_bytes()
	}
}

impl fmt::Display for Serial {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:032x}", self.0)
	}
}

impl Serialize for Serial {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for Serial {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		u128::from_str_radix(&s, 16).map(Serial).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resource_id_has_enough_entropy_and_round_trips_json() {
		let a = ResourceId::generate();
		let b = ResourceId::generate();
		assert_ne!(a, b);
		assert!(a.0.len() >= 20); // 144 bits base64url, no padding

		let json = serde_json::to_string(&a).unwrap();
		let back: ResourceId = serde_json::from_str(&json).unwrap();
		assert_eq!(a, back);
	}

	#[test]
	fn serial_round_trips_hex() {
		let s = Serial::random();
		let text = s.to_string();
		assert_eq!(text.len(), 32);
		let json = serde_json::to_string(&s).unwrap();
		let back: Serial = serde_json::from_str(&json).unwrap();
		assert_eq!(s, back);
	}

	#[test]
	fn timestamp_add_seconds_and_is_past() {
		let now = Timestamp::now();
		let future = now.add_seconds(3600);
		assert!(future > now);
		assert!(!future.is_past());

		let past = Timestamp(0);
		assert!(past.is_past());
	}
}

// vim: ts=4
