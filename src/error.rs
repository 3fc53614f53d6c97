use thiserror::Error;

use crate::ids::IdError;

/// Error conditions callers are expected to branch on.
///
/// Everything else travels as a plain `anyhow::Error` with context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed or missing input. Never retried, never logged as a fault.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    /// Assigning a job that already has an active agent.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Socket write or store timeout. Retried by the delivery layer.
    #[error("transient delivery failure: {0}")]
    TransientDelivery(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}

impl From<IdError> for CoreError {
    fn from(err: IdError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Older persisted error rows carried plain text instead of a typed variant.
const LEGACY_NOT_FOUND_MARKERS: &[&str] = &["not found", "no rows in result set"];

/// True when `err` means "the thing is missing" rather than "the lookup failed".
pub fn is_not_found(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(core) = cause.downcast_ref::<CoreError>() {
            return matches!(core, CoreError::NotFound { .. });
        }
        if let Some(rusqlite::Error::QueryReturnedNoRows) = cause.downcast_ref::<rusqlite::Error>()
        {
            return true;
        }
    }
    let text = err.to_string().to_ascii_lowercase();
    LEGACY_NOT_FOUND_MARKERS
        .iter()
        .any(|marker| text.contains(marker))
}

pub fn is_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<CoreError>()
            .is_some_and(|core| matches!(core, CoreError::Conflict(_)))
    })
}

pub fn is_validation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<CoreError>()
            .is_some_and(|core| matches!(core, CoreError::Validation(_)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn typed_not_found_is_detected_through_context() {
        let err: anyhow::Result<()> =
            Err(CoreError::not_found("job", "j_1").into());
        let err = err.context("loading job").unwrap_err();
        assert!(is_not_found(&err));
        assert!(!is_conflict(&err));
    }

    #[test]
    fn sqlite_no_rows_counts_as_not_found() {
        let err = anyhow::Error::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(is_not_found(&err));
    }

    #[test]
    fn legacy_text_falls_back_to_string_match() {
        let err = anyhow::anyhow!("sql: no rows in result set");
        assert!(is_not_found(&err));
        let err = anyhow::anyhow!("Agent 'x' Not Found");
        assert!(is_not_found(&err));
    }

    #[test]
    fn typed_conflict_is_not_treated_as_missing() {
        let err = anyhow::Error::from(CoreError::conflict("job j_1 not found in pool"));
        assert!(is_conflict(&err));
        assert!(!is_not_found(&err));
    }

    #[test]
    fn other_failures_are_not_missing() {
        let err = anyhow::anyhow!("disk I/O error");
        assert!(!is_not_found(&err));
        assert!(!is_validation(&err));
    }
}
