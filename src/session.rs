//! One in-flight chat-message stream.
//!
//! A `StreamSession` owns the response body of a single send. It decodes
//! frames, classifies them into [`StreamEvent`]s, accumulates the answer and
//! reports to a [`StreamHandler`]. Sessions are consumed by [`StreamSession::run`]
//! and never reused.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::decoder::{Frame, FrameDecoder};
use crate::error::ClientError;
use crate::protocol::{MessageEnd, MessageMetadata, StreamEvent};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ClientError>> + Send>>;

/// Callbacks for one session. Every method defaults to a no-op.
///
/// Calls arrive in frame order on the task that drives the session.
pub trait StreamHandler {
    /// An answer fragment, never the accumulated text.
    fn on_chunk(&mut self, _text: &str) {}

    /// Every successfully parsed record, before any other callback for it.
    fn on_event(&mut self, _event: &StreamEvent) {}

    fn on_message_end(&mut self, _end: &MessageEnd) {}

    /// Failures after the stream started. Fires at most once per session.
    fn on_error(&mut self, _error: &ClientError) {}

    /// Fires once when the session ends in [`SessionState::Completed`].
    fn on_complete(&mut self) {}

    /// A frame that could not be parsed and was skipped.
    fn on_decode_warning(&mut self, _warning: &ClientError) {}
}

impl StreamHandler for () {}

impl<H: StreamHandler + ?Sized> StreamHandler for &mut H {
    fn on_chunk(&mut self, text: &str) {
        (**self).on_chunk(text)
    }

    fn on_event(&mut self, event: &StreamEvent) {
        (**self).on_event(event)
    }

    fn on_message_end(&mut self, end: &MessageEnd) {
        (**self).on_message_end(end)
    }

    fn on_error(&mut self, error: &ClientError) {
        (**self).on_error(error)
    }

    fn on_complete(&mut self) {
        (**self).on_complete()
    }

    fn on_decode_warning(&mut self, warning: &ClientError) {
        (**self).on_decode_warning(warning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self != SessionState::Active
    }
}

/// Stops local consumption of a session. Clones share the same flag.
///
/// This does not stop generation on the server; see `ChatClient::stop_task`.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub answer: String,
    pub task_id: Option<String>,
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub metadata: Option<MessageMetadata>,
    pub decode_warnings: usize,
    pub error: Option<ClientError>,
}

pub struct StreamSession {
    stream: Option<ByteStream>,
    decoder: FrameDecoder,
    state: SessionState,
    cancel: CancelHandle,
    answer: String,
    task_id: Option<String>,
    message_id: Option<String>,
    conversation_id: Option<String>,
    metadata: Option<MessageMetadata>,
    decode_warnings: usize,
    error: Option<ClientError>,
}

impl StreamSession {
    pub fn new<S, B, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: Into<Bytes>,
        E: Into<ClientError>,
    {
        let stream = stream.map(|item| item.map(Into::into).map_err(Into::into));
        Self::from_boxed(Box::pin(stream))
    }

    pub fn from_response(response: reqwest::Response) -> Self {
        Self::new(response.bytes_stream())
    }

    fn from_boxed(stream: ByteStream) -> Self {
        Self {
            stream: Some(stream),
            decoder: FrameDecoder::new(),
            state: SessionState::Active,
            cancel: CancelHandle::new(),
            answer: String::new(),
            task_id: None,
            message_id: None,
            conversation_id: None,
            metadata: None,
            decode_warnings: 0,
            error: None,
        }
    }

    /// Shares cancellation with an existing handle instead of a fresh one.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancels before or between runs and releases the body immediately.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if self.state == SessionState::Active {
            self.state = SessionState::Cancelled;
        }
        self.stream = None;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// Drives the stream to a terminal state.
    pub async fn run<H: StreamHandler>(mut self, mut handler: H) -> SessionOutcome {
        let Some(mut stream) = self.stream.take() else {
            return self.into_outcome();
        };
        debug!("stream session started");

        while self.state == SessionState::Active {
            let next = tokio::select! {
                biased;
                _ = self.cancel.token.cancelled() => {
                    self.state = SessionState::Cancelled;
                    break;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let frames = self.decoder.push(&chunk);
                    self.dispatch(frames, &mut handler);
                }
                Some(Err(err)) => self.fail(err, &mut handler),
                None => {
                    let frames = std::mem::take(&mut self.decoder).finish();
                    self.dispatch(frames, &mut handler);
                    self.complete(&mut handler);
                }
            }
        }

        // Releases the body; a cancelled or finished session reads no further.
        drop(stream);
        debug!(
            state = ?self.state,
            answer_len = self.answer.len(),
            task_id = self.task_id.as_deref().unwrap_or(""),
            "stream session finished"
        );
        self.into_outcome()
    }

    fn dispatch<H: StreamHandler>(&mut self, frames: Vec<Frame>, handler: &mut H) {
        for frame in frames {
            if self.observe_cancel() || self.state != SessionState::Active {
                return;
            }
            match frame {
                Frame::Done => self.complete(handler),
                Frame::Data(payload) => match StreamEvent::parse(&payload) {
                    Ok(event) => self.apply(event, handler),
                    Err(err) => {
                        warn!(error = %err, "skipping malformed stream frame");
                        self.decode_warnings += 1;
                        let warning = ClientError::StreamDecode {
                            payload,
                            reason: err.to_string(),
                        };
                        handler.on_decode_warning(&warning);
                    }
                },
            }
        }
    }

    fn apply<H: StreamHandler>(&mut self, event: StreamEvent, handler: &mut H) {
        if let Some(task_id) = event.task_id() {
            self.task_id = Some(task_id.to_string());
        }
        if let Some(conversation_id) = event.conversation_id() {
            self.conversation_id = Some(conversation_id.to_string());
        }
        if let Some(message_id) = event.message_id() {
            self.message_id = Some(message_id.to_string());
        }

        handler.on_event(&event);
        if self.observe_cancel() {
            return;
        }

        match event {
            StreamEvent::Message(delta) => {
                if let Some(fragment) = delta.answer {
                    self.answer.push_str(&fragment);
                    handler.on_chunk(&fragment);
                }
            }
            StreamEvent::MessageEnd(end) => {
                handler.on_message_end(&end);
                self.metadata = Some(end.metadata);
                self.complete(handler);
            }
            StreamEvent::Error(event) => {
                let err = ClientError::StreamProtocol {
                    code: event.code,
                    message: event
                        .message
                        .unwrap_or_else(|| "stream reported an error".to_string()),
                    status: event.status,
                };
                error!(error = %err, "server reported a stream error");
                handler.on_error(&err);
                self.error = Some(err);
                self.state = SessionState::Failed;
            }
            _ => {}
        }
    }

    fn complete<H: StreamHandler>(&mut self, handler: &mut H) {
        if self.state == SessionState::Active {
            self.state = SessionState::Completed;
            handler.on_complete();
        }
    }

    fn fail<H: StreamHandler>(&mut self, err: ClientError, handler: &mut H) {
        if self.state != SessionState::Active {
            return;
        }
        error!(error = %err, "stream transport failed");
        handler.on_error(&err);
        self.error = Some(err);
        self.state = SessionState::Failed;
    }

    fn observe_cancel(&mut self) -> bool {
        if self.cancel.is_cancelled() && self.state == SessionState::Active {
            self.state = SessionState::Cancelled;
        }
        self.state == SessionState::Cancelled
    }

    fn into_outcome(self) -> SessionOutcome {
        SessionOutcome {
            state: self.state,
            answer: self.answer,
            task_id: self.task_id,
            message_id: self.message_id,
            conversation_id: self.conversation_id,
            metadata: self.metadata,
            decode_warnings: self.decode_warnings,
            error: self.error,
        }
    }
}
