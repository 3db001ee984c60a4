//! Common imports for every crate in the workspace, mirroring the teacher's
//! `prelude` module — `use castellan_types::prelude::*;` at the top of a
//! file instead of threading the same dozen imports through every module.

pub use crate::error::{AcmeErrorKind, ClResult, Error, ScepFailInfo};
pub use crate::types::{ResourceId, Serial, Timestamp};

pub use tracing::{debug, error, info, trace, warn};
