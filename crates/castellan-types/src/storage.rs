//! Versioning envelope for everything written through a `DbAdapter` (spec
//! §6: "all bucket values are versioned by a leading byte; migrations
//! append-only"). Adapters never see the wire format for a record, only the
//! bytes this module produces — so a sled-backed adapter and a future cloud
//! KV adapter agree on what "a certificate record" looks like on disk.

use serde::{Deserialize, Serialize};

use crate::error::{ClResult, Error};

/// Current on-disk schema version for every bucket. Bump when a record's
/// shape changes in a way `serde`'s defaulting can't absorb, and add a
/// migration arm to `VersionedRecord::decode` rather than rewriting history.
pub const CURRENT_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord<T> {
	pub version: u8,
	pub value: T,
}

impl<T> VersionedRecord<T> {
	pub fn new(value: T) -> Self {
		Self { version: CURRENT_VERSION, value }
	}
}

impl<T: Serialize> VersionedRecord<T> {
	pub fn encode(&self) -> ClResult<Vec<u8>> {
		let mut buf = vec![self.version];
		serde_json::to_writer(&mut buf, &self.value)?;
		Ok(buf)
	}
}

impl<T: for<'de> Deserialize<'de>> VersionedRecord<T> {
	pub fn decode(bytes: &[u8]) -> ClResult<Self> {
		let (version, payload) =
			bytes.split_first().ok_or_else(|| Error::Internal("empty record".into()))?;
		match version {
			1 => {
				let value = serde_json::from_slice(payload)?;
				Ok(Self { version: 1, value })
			}
			other => Err(Error::Internal(format!("unknown record version {other}"))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde::{Deserialize, Serialize};

	#[derive(Debug, Serialize, Deserialize, PartialEq)]
	struct Demo {
		name: String,
	}

	#[test]
	fn encode_decode_round_trips() {
		let record = VersionedRecord::new(Demo { name: "a.test".into() });
		let bytes = record.encode().unwrap();
		assert_eq!(bytes[0], CURRENT_VERSION);
		let back: VersionedRecord<Demo> = VersionedRecord::decode(&bytes).unwrap();
		assert_eq!(back.value, record.value);
	}

	#[test]
	fn decode_rejects_unknown_version() {
		let bytes = vec![99u8, b'{', b'}'];
		let err = VersionedRecord::<Demo>::decode(&bytes);
		assert!(err.is_err());
	}
}

// vim: ts=4
