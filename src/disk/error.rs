//! Disk-local error handling. All disk errors fold into [`crate::error::Error`]
//! so that torrent actors and the engine observe a single taxonomy (spec.md
//! §7); this module exists only so internal `disk::` code can `use
//! super::error::*` the way the rest of the engine imports its error types.

pub(crate) use crate::error::{Error, IoError, Result};
