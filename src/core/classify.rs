//! Step failure classification.
//!
//! Every failure a step action reports is sorted into one of three
//! classes by the backend error code (and, for unknown codes, the HTTP
//! status). Message text is never inspected.

use serde::{Deserialize, Serialize};

use crate::adapters::ResourceError;

/// How the orchestrator reacts to a step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Resource already present; the step counts as done
    AlreadyExists,

    /// Backend busy or briefly unavailable; retry the step
    Transient,

    /// Anything else; abort the plan
    Fatal,
}

const ALREADY_EXISTS_CODES: &[&str] = &[
    "BucketAlreadyOwnedByYou",
    "ResourceInUseException",
    "ResourceConflictException",
    "ConflictException",
    "EntityAlreadyExists",
    "TopicAlreadyExists",
];

const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ProvisionedThroughputExceededException",
    "SlowDown",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "RequestTimeout",
];

const TRANSIENT_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Classify a backend error
pub fn classify(error: &ResourceError) -> Classification {
    let code = error.code.as_str();

    if ALREADY_EXISTS_CODES.contains(&code) {
        return Classification::AlreadyExists;
    }

    if TRANSIENT_CODES.contains(&code) {
        return Classification::Transient;
    }

    // Known codes win over status; only unrecognised codes fall back to it
    if is_known_code(code) {
        return Classification::Fatal;
    }

    match error.http_status {
        Some(status) if TRANSIENT_STATUSES.contains(&status) => Classification::Transient,
        _ => Classification::Fatal,
    }
}

fn is_known_code(code: &str) -> bool {
    const FATAL_CODES: &[&str] = &[
        "BucketAlreadyExists",
        "AccessDenied",
        "AccessDeniedException",
        "ValidationException",
        "InvalidParameterValue",
        "InvalidParameterValueException",
        "BadRequestException",
        "NotFoundException",
        "ResourceNotFoundException",
        "QueueAlreadyExists",
        crate::adapters::codes::MISSING_DEPENDENCY,
        crate::adapters::codes::CODE_UNAVAILABLE,
    ];
    FATAL_CODES.contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_bucket_is_already_exists() {
        let err = ResourceError::new("BucketAlreadyOwnedByYou", "whatever the text says");
        assert_eq!(classify(&err), Classification::AlreadyExists);
    }

    #[test]
    fn test_bucket_owned_by_someone_else_is_fatal() {
        let err = ResourceError::new("BucketAlreadyExists", "taken").with_status(409);
        assert_eq!(classify(&err), Classification::Fatal);
    }

    #[test]
    fn test_message_text_is_ignored() {
        let err = ResourceError::new("AccessDenied", "BucketAlreadyOwnedByYou");
        assert_eq!(classify(&err), Classification::Fatal);
    }

    #[test]
    fn test_throttling_is_transient() {
        for code in ["ThrottlingException", "SlowDown", "ServiceUnavailable"] {
            assert_eq!(
                classify(&ResourceError::new(code, "")),
                Classification::Transient,
                "{code}"
            );
        }
    }

    #[test]
    fn test_unknown_code_uses_status() {
        let busy = ResourceError::new("Whatever", "").with_status(503);
        assert_eq!(classify(&busy), Classification::Transient);

        let bad = ResourceError::new("Whatever", "").with_status(400);
        assert_eq!(classify(&bad), Classification::Fatal);

        let bare = ResourceError::new("Whatever", "");
        assert_eq!(classify(&bare), Classification::Fatal);
    }

    #[test]
    fn test_known_fatal_code_ignores_status() {
        let err = ResourceError::new("ValidationException", "").with_status(503);
        assert_eq!(classify(&err), Classification::Fatal);
    }
}
