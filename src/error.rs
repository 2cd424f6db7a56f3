use thiserror::Error;

/// Failures surfaced by the query engine and its collaborators.
///
/// A record that finds no partner during a join is not an error; it is
/// returned un-enriched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The remote service rejected or could not complete a call.
    #[error("{operation} failed: {message}")]
    RemoteCallFailed { operation: String, message: String },

    /// A precondition did not hold (repository state, bad expression, empty result).
    #[error("{reason}")]
    ValidationFailed { reason: String },
}

impl QueryError {
    pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteCallFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = QueryError::remote("getDetail", "NotFound: no such item");
        assert_eq!(err.to_string(), "getDetail failed: NotFound: no such item");

        let err = QueryError::validation("must be inside a repository");
        assert_eq!(err.to_string(), "must be inside a repository");
    }
}
