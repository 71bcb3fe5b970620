use crate::{delivery::Delivery, JetStreamResult};
use std::future::Future;

/// Receives the deliveries of a handler driven subscription, one at a time
/// and in arrival order.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_message(&self, delivery: Delivery) -> JetStreamResult<()>;
}

#[async_trait::async_trait]
impl<T, F> MessageHandler for T
where
    F: Future<Output = JetStreamResult<()>> + Send,
    T: FnOnce(Delivery) -> F + Send + Sync,
    T: 'static,
    T: Clone,
{
    async fn handle_message(&self, delivery: Delivery) -> JetStreamResult<()> {
        let fun = self.clone();
        fun(delivery).await
    }
}
