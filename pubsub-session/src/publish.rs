//! Publish path: one-shot sends resolved through a [`PublishHandle`].

use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PublishError;
use crate::transport::{PublishRequest, Transport};
use crate::types::Timetoken;

pub(crate) struct Publisher {
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
    timeout: Duration,
    max_size: usize,
}

impl Publisher {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
        timeout: Duration,
        max_size: usize,
    ) -> Self {
        Self {
            transport,
            shutdown,
            timeout,
            max_size,
        }
    }

    /// Starts sending `request` on its own task.
    pub(crate) fn publish(self: &Arc<Self>, request: PublishRequest) -> PublishHandle {
        let request = Arc::new(request);
        if request.payload.len() > self.max_size {
            let error = PublishError::PayloadTooLarge {
                size: request.payload.len(),
                limit: self.max_size,
            };
            return self.rejected(request, error);
        }
        self.spawn(request)
    }

    /// A handle that resolves to `error` without touching the transport.
    pub(crate) fn rejected(
        self: &Arc<Self>,
        request: Arc<PublishRequest>,
        error: PublishError,
    ) -> PublishHandle {
        tracing::debug!(channel = %request.channel, "Publish rejected locally: {error}");
        PublishHandle {
            publisher: Arc::clone(self),
            request,
            outcome: Outcome::Rejected(error),
        }
    }

    fn spawn(self: &Arc<Self>, request: Arc<PublishRequest>) -> PublishHandle {
        let task = tokio::spawn(send(Arc::clone(self), Arc::clone(&request)));
        PublishHandle {
            publisher: Arc::clone(self),
            request,
            outcome: Outcome::Pending(task),
        }
    }
}

async fn send(
    publisher: Arc<Publisher>,
    request: Arc<PublishRequest>,
) -> Result<Timetoken, PublishError> {
    let attempt = tokio::time::timeout(publisher.timeout, publisher.transport.send(&request));
    let result = tokio::select! {
        biased;
        _ = publisher.shutdown.cancelled() => Err(PublishError::Cancelled),
        result = attempt => result.unwrap_or(Err(PublishError::Timeout)),
    };
    match &result {
        Ok(timetoken) => {
            tracing::trace!(channel = %request.channel, %timetoken, "Published");
        }
        Err(e) => {
            tracing::debug!(channel = %request.channel, "Publish failed: {e}");
        }
    }
    result
}

enum Outcome {
    Pending(JoinHandle<Result<Timetoken, PublishError>>),
    Rejected(PublishError),
}

/// An in-flight publish. Await it for the broker-assigned timetoken.
///
/// Dropping the handle does not cancel the publish; client shutdown does,
/// and the handle then resolves to [`PublishError::Cancelled`].
pub struct PublishHandle {
    publisher: Arc<Publisher>,
    request: Arc<PublishRequest>,
    outcome: Outcome,
}

impl PublishHandle {
    pub fn request(&self) -> &PublishRequest {
        &self.request
    }
}

impl fmt::Debug for PublishHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishHandle")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl IntoFuture for PublishHandle {
    type Output = Result<Timetoken, PublishFailure>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        let PublishHandle {
            publisher,
            request,
            outcome,
        } = self;
        Box::pin(async move {
            let result = match outcome {
                Outcome::Rejected(error) => Err(error),
                Outcome::Pending(task) => match task.await {
                    Ok(result) => result,
                    Err(e) if e.is_cancelled() => Err(PublishError::Cancelled),
                    Err(e) => Err(PublishError::Network(format!("publish task failed: {e}"))),
                },
            };
            result.map_err(|error| PublishFailure {
                error,
                request,
                publisher,
            })
        })
    }
}

/// A failed publish, carrying the request so it can be resent.
#[derive(thiserror::Error)]
#[error("publish to `{}` failed: {error}", .request.channel)]
pub struct PublishFailure {
    #[source]
    error: PublishError,
    request: Arc<PublishRequest>,
    publisher: Arc<Publisher>,
}

impl PublishFailure {
    pub fn error(&self) -> &PublishError {
        &self.error
    }

    pub fn request(&self) -> &PublishRequest {
        &self.request
    }

    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }

    /// Resends the identical request. `None` unless the failure is retryable.
    pub fn retry(&self) -> Option<PublishHandle> {
        if !self.error.is_retryable() {
            return None;
        }
        tracing::debug!(channel = %self.request.channel, "Retrying publish");
        Some(self.publisher.spawn(Arc::clone(&self.request)))
    }

    pub fn into_error(self) -> PublishError {
        self.error
    }
}

impl fmt::Debug for PublishFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishFailure")
            .field("error", &self.error)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}
