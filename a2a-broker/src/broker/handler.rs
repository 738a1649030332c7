use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Message;

/// Outcome of a single failed delivery attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("handler panicked")]
    Panicked,

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent {0} is inactive")]
    AgentInactive(String),

    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), DeliveryError>;
}

pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DeliveryError>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<(), DeliveryError> {
        (self.f)(message.clone()).await
    }
}

/// Wraps an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DeliveryError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// One entry in a topic's ordered handler list.
#[derive(Clone)]
pub struct Subscriber {
    pub id: String,
    pub topic: String,
    /// Agent this handler delivers to; broadcasts skip it while the agent is inactive.
    pub owner: Option<String>,
    pub handler: Arc<dyn MessageHandler>,
}
