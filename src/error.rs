//! Error taxonomy shared by the ingestion and query pipelines.
//!
//! Every failure that leaves a pipeline is one of four classes:
//!
//! | Variant | Fault | HTTP | Code |
//! |---------|-------|------|------|
//! | [`PipelineError::NotFound`] | client | 404 | `not_found` |
//! | [`PipelineError::ClientData`] | client | 400 | `bad_request` |
//! | [`PipelineError::ExternalService`] | server | 502 / 504 | `external_service` |
//! | [`PipelineError::Internal`] | server | 500 | `internal` |
//!
//! Plumbing code works with `anyhow`; errors are classified into this
//! enum at the boundary where a pipeline calls out to a collaborator.

use std::fmt;

use thiserror::Error;

/// External collaborators a pipeline talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Storage,
    Extraction,
    Embedding,
    VectorIndex,
    Chat,
    Metadata,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Service::Storage => "storage",
            Service::Extraction => "extraction",
            Service::Embedding => "embedding",
            Service::VectorIndex => "vector index",
            Service::Chat => "chat",
            Service::Metadata => "metadata store",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A referenced document or session does not exist.
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// The client supplied content or parameters that cannot be processed.
    #[error("{message}")]
    ClientData { message: String },

    /// A call to an external collaborator failed or timed out.
    #[error("{service} service error: {message}")]
    ExternalService {
        service: Service,
        message: String,
        retryable: bool,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn client_data(message: impl Into<String>) -> Self {
        Self::ClientData {
            message: message.into(),
        }
    }

    pub fn external(service: Service, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service,
            message: message.into(),
            retryable: false,
        }
    }

    /// A failure worth retrying later: timeouts, cancellations, outages.
    pub fn transient(service: Service, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify an `anyhow` error raised by an external collaborator.
    pub fn from_service(service: Service, err: anyhow::Error) -> Self {
        Self::external(service, format!("{:#}", err))
    }

    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::ClientData { .. } => "bad_request",
            Self::ExternalService { .. } => "external_service",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn is_client_fault(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::ClientData { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalService { retryable: true, .. })
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::external(Service::Metadata, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_error_class() {
        assert_eq!(PipelineError::not_found("document", "d1").code(), "not_found");
        assert_eq!(PipelineError::client_data("empty").code(), "bad_request");
        assert_eq!(
            PipelineError::external(Service::Chat, "boom").code(),
            "external_service"
        );
        assert_eq!(PipelineError::internal("x").code(), "internal");
    }

    #[test]
    fn only_not_found_and_client_data_are_client_faults() {
        assert!(PipelineError::not_found("session", "s").is_client_fault());
        assert!(PipelineError::client_data("bad").is_client_fault());
        assert!(!PipelineError::external(Service::Storage, "down").is_client_fault());
        assert!(!PipelineError::internal("bug").is_client_fault());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(PipelineError::transient(Service::Embedding, "timed out").is_retryable());
        assert!(!PipelineError::external(Service::Embedding, "401").is_retryable());
    }

    #[test]
    fn display_names_the_missing_entity() {
        let err = PipelineError::not_found("document", "abc");
        assert_eq!(err.to_string(), "document not found: abc");
    }
}
