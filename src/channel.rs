//! Session updates as a `Stream` instead of callbacks.

use std::future::Future;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ClientError;
use crate::protocol::{MessageEnd, StreamEvent};
use crate::session::{CancelHandle, SessionOutcome, StreamHandler, StreamSession};

#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Event(StreamEvent),
    Chunk(String),
    MessageEnd(MessageEnd),
    Error(ClientError),
    DecodeWarning(ClientError),
    Complete,
}

pub type EventStream = UnboundedReceiverStream<SessionUpdate>;

/// Forwards every callback into a channel, in order.
///
/// Dropping the receiving [`EventStream`] cancels the session it feeds once
/// the session is driven by [`run_until_dropped`]; otherwise only on the next
/// failed send.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<SessionUpdate>,
    cancel: CancelHandle,
}

impl ChannelHandler {
    pub fn new(cancel: CancelHandle) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, cancel }, UnboundedReceiverStream::new(rx))
    }

    /// Resolves once the receiving [`EventStream`] is gone.
    pub fn receiver_dropped(&self) -> impl Future<Output = ()> + Send + use<> {
        let tx = self.tx.clone();
        async move { tx.closed().await }
    }

    fn forward(&mut self, update: SessionUpdate) {
        if self.tx.send(update).is_err() && !self.cancel.is_cancelled() {
            tracing::debug!("update receiver dropped, cancelling session");
            self.cancel.cancel();
        }
    }
}

impl StreamHandler for ChannelHandler {
    fn on_chunk(&mut self, text: &str) {
        self.forward(SessionUpdate::Chunk(text.to_string()));
    }

    fn on_event(&mut self, event: &StreamEvent) {
        self.forward(SessionUpdate::Event(event.clone()));
    }

    fn on_message_end(&mut self, end: &MessageEnd) {
        self.forward(SessionUpdate::MessageEnd(end.clone()));
    }

    fn on_error(&mut self, error: &ClientError) {
        self.forward(SessionUpdate::Error(error.clone()));
    }

    fn on_complete(&mut self) {
        self.forward(SessionUpdate::Complete);
    }

    fn on_decode_warning(&mut self, warning: &ClientError) {
        self.forward(SessionUpdate::DecodeWarning(warning.clone()));
    }
}

/// Runs `session` to its end, cancelling it as soon as `receiver_dropped`
/// resolves, even while the next read is stalled.
pub async fn run_until_dropped<H: StreamHandler>(
    session: StreamSession,
    handler: H,
    receiver_dropped: impl Future<Output = ()>,
) -> SessionOutcome {
    let cancel = session.cancel_handle();
    let run = session.run(handler);
    tokio::pin!(run);

    tokio::select! {
        outcome = &mut run => outcome,
        _ = receiver_dropped => {
            tracing::debug!("update receiver dropped, cancelling session");
            cancel.cancel();
            run.await
        }
    }
}
