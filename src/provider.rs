use crate::chat::{Request, Response};
use crate::error::ChatError;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events of one streamed completion, in upstream order. The channel closing
/// is the end-of-stream signal.
pub type ResponseStream = mpsc::Receiver<Response>;

pub const STREAM_BUFFER: usize = 64;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, req: Request) -> Result<Response, ChatError>;

    /// Starts a streamed completion whose producer stops as soon as `cancel` fires.
    async fn complete_stream(
        &self,
        req: Request,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, ChatError>;

    fn max_context_length(&self, model: &str) -> i64;
}

/// Hands one event to the consumer unless cancellation wins the race.
///
/// Returns `false` when the producer must stop: either the token fired or the
/// receiver is gone. A chunk that loses to cancellation is dropped.
pub async fn forward_event(
    tx: &mpsc::Sender<Response>,
    cancel: &CancellationToken,
    event: Response,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}
