//! Deadline and cancellation wrapper for external calls.
//!
//! Every call a pipeline makes to a collaborator (blob store, extractor,
//! embedding service, vector index, chat model) goes through [`bounded`],
//! which races the call against a timeout and the request's
//! [`CancellationToken`]. Both outcomes surface as retryable
//! [`PipelineError::ExternalService`] errors.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Service};

/// Run `fut` with a deadline, classifying its `anyhow` error as a
/// failure of `service`.
pub async fn bounded<T, F>(
    service: Service,
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            Err(PipelineError::transient(service, "request cancelled"))
        }
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PipelineError::from_service(service, e)),
            Err(_) => Err(PipelineError::transient(
                service,
                format!("timed out after {}s", limit.as_secs_f32()),
            )),
        },
    }
}

/// Like [`bounded`] but for futures that already yield a [`PipelineError`].
pub async fn bounded_typed<T, F>(
    service: Service,
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            Err(PipelineError::transient(service, "request cancelled"))
        }
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(PipelineError::transient(
                service,
                format!("timed out after {}s", limit.as_secs_f32()),
            )),
        },
    }
}
