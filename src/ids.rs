//! Typed, sortable identifiers.
//!
//! Every entity id has the shape `<prefix>_<ULID>`, e.g.
//! `j_01ARZ3NDEKTSV4RRFFQ69G5FAV`. The ULID body sorts by creation time, and
//! all bodies in one process come from a single monotonic generator so two
//! ids minted inside the same millisecond still compare in call order.

use parking_lot::Mutex;
use std::sync::OnceLock;
use thiserror::Error;
use ulid::Generator;

pub const JOB_PREFIX: &str = "j";
pub const AGENT_PREFIX: &str = "ag";
pub const PROCESSED_MESSAGE_PREFIX: &str = "pm";
pub const ASSIGNMENT_PREFIX: &str = "asg";
pub const ENVELOPE_PREFIX: &str = "msg";
pub const CONNECTION_PREFIX: &str = "conn";

/// Length of a Crockford base32 ULID body.
pub const ULID_LEN: usize = 26;

static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id prefix must not be empty")]
    EmptyPrefix,
    #[error("id prefix `{prefix}` must match [a-z0-9]+")]
    InvalidPrefix { prefix: String },
    #[error("monotonic ULID space exhausted for the current millisecond")]
    Exhausted,
    #[error("malformed id `{id}`: {reason}")]
    Malformed { id: String, reason: &'static str },
}

/// Generate a new `<prefix>_<ULID>` identifier.
///
/// The prefix is trimmed and lower-cased. An empty prefix is a caller bug and
/// is rejected rather than silently replaced.
pub fn new_id(prefix: &str) -> Result<String, IdError> {
    let prefix = normalize_prefix(prefix)?;
    let body = {
        let mut generator = GENERATOR
            .get_or_init(|| Mutex::new(Generator::new()))
            .lock();
        generator.generate().map_err(|_| IdError::Exhausted)?
    };
    Ok(format!("{prefix}_{body}"))
}

fn normalize_prefix(prefix: &str) -> Result<String, IdError> {
    let prefix = prefix.trim().to_ascii_lowercase();
    if prefix.is_empty() {
        return Err(IdError::EmptyPrefix);
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(IdError::InvalidPrefix { prefix });
    }
    Ok(prefix)
}

/// Check that `id` is a well-formed identifier carrying `expected_prefix`.
pub fn validate_id(expected_prefix: &str, id: &str) -> Result<(), IdError> {
    let malformed = |reason| IdError::Malformed {
        id: id.to_string(),
        reason,
    };
    let (prefix, body) = id.split_once('_').ok_or_else(|| malformed("missing `_`"))?;
    if prefix != expected_prefix {
        return Err(malformed("unexpected prefix"));
    }
    if body.len() != ULID_LEN {
        return Err(malformed("body must be 26 characters"));
    }
    if !body.chars().all(is_crockford_char) {
        return Err(malformed("body is not Crockford base32"));
    }
    Ok(())
}

fn is_crockford_char(c: char) -> bool {
    c.is_ascii_digit() || (c.is_ascii_uppercase() && !matches!(c, 'I' | 'L' | 'O' | 'U'))
}
