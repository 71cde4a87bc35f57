/// Shared error type used across all Homelab Hub crates.
///
/// Lower layers construct the typed variant that describes what went wrong;
/// the HTTP surface owns the mapping to status codes and `{code, message}`
/// bodies. Secrets never appear in messages.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("server '{0}' is inactive (agent removed). Uninstall the agent.")]
    InactiveServer(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("command rejected: {0}")]
    WhitelistViolation(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("command timed out after {0}s")]
    CommandTimeout(u64),

    #[error("SSH unavailable: {0}")]
    SshUnavailable(String),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for the common lookup-miss case.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Uppercase-snake code string surfaced in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Unauthenticated => "UNAUTHENTICATED",
            Error::InactiveServer(_) => "FORBIDDEN",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::WhitelistViolation(_) => "WHITELIST_VIOLATION",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::CommandTimeout(_) => "COMMAND_TIMEOUT",
            Error::SshUnavailable(_) => "SSH_UNAVAILABLE",
            Error::Database(_) | Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_formats_kind_and_id() {
        let err = Error::not_found("server", "omv-mediaserver");
        assert_eq!(err.to_string(), "server not found: omv-mediaserver");
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn inactive_server_message_tells_agent_to_uninstall() {
        let err = Error::InactiveServer("beta".into());
        assert!(err.to_string().contains("Uninstall the agent"));
    }
}
