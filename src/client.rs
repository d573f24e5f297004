use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::multipart::{Form, Part};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandler, EventStream, run_until_dropped};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::pending::{PendingFile, PendingFiles};
use crate::protocol::{
    AppParameters, ChatMessagePayload, ChatRequest, Conversation, ConversationPage,
    ConversationQuery, FeedbackPayload, FileReference, MessageEnd, MessageMetadata, MessagePage,
    Rating, RenamePayload, ResponseMode, StreamEvent, UploadedFile, UserPayload,
};
use crate::session::{CancelHandle, SessionOutcome, SessionState, StreamHandler, StreamSession};
use crate::transport::{Transport, error_from_body};

const SETTLED_TASK_CAPACITY: usize = 64;

/// Result of one send, available once its session is terminal.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub task_id: Option<String>,
    pub state: SessionState,
    pub answer: String,
    /// Present only when the stream delivered `message_end`.
    pub metadata: Option<MessageMetadata>,
    pub error: Option<ClientError>,
    pub decode_warnings: usize,
}

impl SendOutcome {
    pub fn ended_with_message(&self) -> bool {
        self.state == SessionState::Completed && self.metadata.is_some()
    }

    pub fn suggested_questions(&self) -> &[String] {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.suggested_questions.as_slice())
            .unwrap_or_default()
    }
}

impl From<SessionOutcome> for SendOutcome {
    fn from(outcome: SessionOutcome) -> Self {
        Self {
            conversation_id: outcome.conversation_id,
            message_id: outcome.message_id,
            task_id: outcome.task_id,
            state: outcome.state,
            answer: outcome.answer,
            metadata: outcome.metadata,
            error: outcome.error,
            decode_warnings: outcome.decode_warnings,
        }
    }
}

// The last task id seen on any stream, plus tasks known to be finished on the
// server so a repeated stop is answered locally.
#[derive(Debug, Default)]
struct TaskLedger {
    current: Option<String>,
    settled: VecDeque<String>,
}

impl TaskLedger {
    fn observe(&mut self, task_id: &str) {
        if self.current.as_deref() != Some(task_id) {
            self.current = Some(task_id.to_string());
        }
    }

    fn settle(&mut self, task_id: &str) {
        if self.current.as_deref() == Some(task_id) {
            self.current = None;
        }
        if !self.is_settled(task_id) {
            if self.settled.len() == SETTLED_TASK_CAPACITY {
                self.settled.pop_front();
            }
            self.settled.push_back(task_id.to_string());
        }
    }

    fn is_settled(&self, task_id: &str) -> bool {
        self.settled.iter().any(|settled| settled == task_id)
    }
}

type SharedLedger = Arc<Mutex<TaskLedger>>;

fn with_ledger<T>(ledger: &SharedLedger, f: impl FnOnce(&mut TaskLedger) -> T) -> T {
    let mut guard = ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}

fn settle_outcome(ledger: &SharedLedger, outcome: &SessionOutcome) {
    // A cancelled session only stopped reading; the server may still be generating.
    if matches!(outcome.state, SessionState::Completed | SessionState::Failed) {
        if let Some(task_id) = &outcome.task_id {
            with_ledger(ledger, |ledger| ledger.settle(task_id));
        }
    }
}

/// Records task ids as they stream past, then delegates.
struct TaskTracker<H> {
    ledger: SharedLedger,
    inner: H,
}

impl<H: StreamHandler> StreamHandler for TaskTracker<H> {
    fn on_chunk(&mut self, text: &str) {
        self.inner.on_chunk(text);
    }

    fn on_event(&mut self, event: &StreamEvent) {
        if let Some(task_id) = event.task_id() {
            with_ledger(&self.ledger, |ledger| ledger.observe(task_id));
        }
        self.inner.on_event(event);
    }

    fn on_message_end(&mut self, end: &MessageEnd) {
        self.inner.on_message_end(end);
    }

    fn on_error(&mut self, error: &ClientError) {
        self.inner.on_error(error);
    }

    fn on_complete(&mut self) {
        self.inner.on_complete();
    }

    fn on_decode_warning(&mut self, warning: &ClientError) {
        self.inner.on_decode_warning(warning);
    }
}

/// Client for one Dify app. Clones share the HTTP connection pool and the
/// last-known task id.
#[derive(Clone)]
pub struct ChatClient {
    transport: Transport,
    user: String,
    tasks: SharedLedger,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let transport = Transport::new(&config)?;
        Ok(Self {
            transport,
            user: config.user,
            tasks: Arc::default(),
        })
    }

    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Starts a request for this client's user.
    pub fn request(&self, query: impl Into<String>) -> ChatRequest {
        ChatRequest::new(query, self.user.clone())
    }

    /// The task id most recently observed on a stream that has not finished.
    pub fn last_task_id(&self) -> Option<String> {
        with_ledger(&self.tasks, |ledger| ledger.current.clone())
    }

    /// Opens the stream without consuming it.
    pub async fn open_stream(&self, request: &ChatRequest) -> ClientResult<StreamSession> {
        let payload = ChatMessagePayload {
            request,
            response_mode: ResponseMode::Streaming,
        };
        debug!(
            conversation_id = request.conversation_id().unwrap_or(""),
            files = request.files().len(),
            "sending chat message"
        );

        let response = self
            .transport
            .send(
                self.transport
                    .post("chat-messages")
                    .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
                    .json(&payload),
            )
            .await?;

        Ok(StreamSession::from_response(response))
    }

    /// Sends a message and drives its stream to the end.
    ///
    /// Returns `Err` only when the stream never started. Failures after that
    /// go to `handler.on_error` and the partial answer is kept in the outcome.
    pub async fn send_message<H: StreamHandler>(
        &self,
        request: &ChatRequest,
        handler: H,
    ) -> ClientResult<SendOutcome> {
        self.send_message_with_cancel(request, handler, CancelHandle::new())
            .await
    }

    pub async fn send_message_with_cancel<H: StreamHandler>(
        &self,
        request: &ChatRequest,
        handler: H,
        cancel: CancelHandle,
    ) -> ClientResult<SendOutcome> {
        let session = self.open_stream(request).await?.with_cancel_handle(cancel);
        let tracker = TaskTracker {
            ledger: Arc::clone(&self.tasks),
            inner: handler,
        };

        let outcome = session.run(tracker).await;
        settle_outcome(&self.tasks, &outcome);
        Ok(outcome.into())
    }

    /// Sends a message and exposes its updates as a stream.
    ///
    /// Dropping the returned [`EventStream`] cancels local consumption, even
    /// while the server is silent.
    pub async fn stream_message(
        &self,
        request: &ChatRequest,
    ) -> ClientResult<(EventStream, CancelHandle, JoinHandle<SendOutcome>)> {
        let session = self.open_stream(request).await?;
        let cancel = session.cancel_handle();
        let (handler, updates) = ChannelHandler::new(cancel.clone());
        let receiver_dropped = handler.receiver_dropped();
        let ledger = Arc::clone(&self.tasks);

        let task = tokio::spawn(async move {
            let tracker = TaskTracker {
                ledger: Arc::clone(&ledger),
                inner: handler,
            };
            let outcome = run_until_dropped(session, tracker, receiver_dropped).await;
            settle_outcome(&ledger, &outcome);
            SendOutcome::from(outcome)
        });

        Ok((updates, cancel, task))
    }

    /// Asks the server to stop generating for `task_id`.
    ///
    /// Stopping a task this client has already seen finish succeeds without
    /// another request.
    pub async fn stop_task(&self, task_id: &str) -> ClientResult<()> {
        if with_ledger(&self.tasks, |ledger| ledger.is_settled(task_id)) {
            debug!(task_id, "task already finished, nothing to stop");
            return Ok(());
        }

        self.transport
            .send(
                self.transport
                    .post(&format!("chat-messages/{}/stop", task_id))
                    .json(&UserPayload { user: &self.user }),
            )
            .await?;

        with_ledger(&self.tasks, |ledger| ledger.settle(task_id));
        info!(task_id, "task stopped");
        Ok(())
    }

    /// Stops the last observed task. Returns the stopped id, if there was one.
    pub async fn stop_current(&self) -> ClientResult<Option<String>> {
        let Some(task_id) = self.last_task_id() else {
            return Ok(None);
        };
        self.stop_task(&task_id).await?;
        Ok(Some(task_id))
    }

    pub async fn upload_file(&self, path: impl AsRef<Path>) -> ClientResult<UploadedFile> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_guess::from_path(path).first_or_octet_stream().to_string();
        self.upload_bytes(name, bytes, &mime).await
    }

    pub async fn upload_bytes(
        &self,
        file_name: String,
        bytes: Vec<u8>,
        mime: &str,
    ) -> ClientResult<UploadedFile> {
        let part = Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str(mime)
            .map_err(|err| ClientError::Upload {
                status: None,
                message: format!("invalid mime type {}: {}", mime, err),
            })?;
        let form = Form::new().part("file", part).text("user", self.user.clone());

        let response = self
            .transport
            .send_raw(self.transport.post("files/upload").multipart(form))
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match error_from_body(status.as_u16(), &body) {
                ClientError::Http { message, .. } => message,
                other => other.to_string(),
            };
            warn!(file = %file_name, status = status.as_u16(), "upload rejected");
            return Err(ClientError::Upload {
                status: Some(status.as_u16()),
                message,
            });
        }

        let uploaded: UploadedFile = response.json().await?;
        debug!(file = %file_name, id = %uploaded.id, "file uploaded");
        Ok(uploaded)
    }

    /// Uploads every file that is not uploaded yet, concurrently.
    ///
    /// Each file's state is updated in place. On failure the first error is
    /// returned and the files that did upload keep their ids.
    pub async fn upload_pending(&self, files: &mut PendingFiles) -> ClientResult<Vec<FileReference>> {
        let uploads = files
            .iter_mut()
            .filter(|file| file.needs_upload())
            .map(|file| self.upload_pending_file(file));

        let results = futures::future::join_all(uploads).await;
        if let Some(err) = results.into_iter().find_map(Result::err) {
            return Err(err);
        }
        Ok(files.references())
    }

    async fn upload_pending_file(&self, file: &mut PendingFile) -> ClientResult<()> {
        file.mark_uploading();
        let result = match tokio::fs::read(file.path()).await {
            Ok(bytes) => {
                self.upload_bytes(file.name().to_string(), bytes, file.mime())
                    .await
            }
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(uploaded) => {
                file.mark_uploaded(uploaded.id);
                Ok(())
            }
            Err(err) => {
                file.mark_failed(err.to_string());
                Err(err)
            }
        }
    }

    pub async fn list_conversations(&self, query: &ConversationQuery) -> ClientResult<ConversationPage> {
        let response = self
            .transport
            .send(
                self.transport
                    .get("conversations")
                    .query(&query.to_params(&self.user)),
            )
            .await?;
        Ok(response.json().await?)
    }

    pub async fn rename_conversation(&self, conversation_id: &str, name: &str) -> ClientResult<Conversation> {
        self.rename(conversation_id, Some(name)).await
    }

    /// Lets the server generate a name from the conversation content.
    pub async fn auto_rename_conversation(&self, conversation_id: &str) -> ClientResult<Conversation> {
        self.rename(conversation_id, None).await
    }

    async fn rename(&self, conversation_id: &str, name: Option<&str>) -> ClientResult<Conversation> {
        let payload = RenamePayload {
            name,
            auto_generate: name.is_none(),
            user: &self.user,
        };
        let response = self
            .transport
            .send(
                self.transport
                    .post(&format!("conversations/{}/name", conversation_id))
                    .json(&payload),
            )
            .await?;
        Ok(response.json().await?)
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> ClientResult<()> {
        self.transport
            .send(
                self.transport
                    .delete(&format!("conversations/{}", conversation_id))
                    .json(&UserPayload { user: &self.user }),
            )
            .await?;
        Ok(())
    }

    /// History of one conversation, newest page first. `first_id` pages backwards.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        first_id: Option<&str>,
        limit: Option<u32>,
    ) -> ClientResult<MessagePage> {
        let mut params = vec![
            ("user", self.user.clone()),
            ("conversation_id", conversation_id.to_string()),
        ];
        if let Some(first_id) = first_id {
            params.push(("first_id", first_id.to_string()));
        }
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }

        let response = self
            .transport
            .send(self.transport.get("messages").query(&params))
            .await?;
        Ok(response.json().await?)
    }

    /// `rating: None` clears an earlier rating.
    pub async fn submit_feedback(
        &self,
        message_id: &str,
        rating: Option<Rating>,
        content: Option<&str>,
    ) -> ClientResult<()> {
        let payload = FeedbackPayload {
            rating,
            user: &self.user,
            content,
        };
        self.transport
            .send(
                self.transport
                    .post(&format!("messages/{}/feedbacks", message_id))
                    .json(&payload),
            )
            .await?;
        Ok(())
    }

    pub async fn get_parameters(&self) -> ClientResult<AppParameters> {
        let response = self
            .transport
            .send(
                self.transport
                    .get("parameters")
                    .query(&[("user", self.user.as_str())]),
            )
            .await?;
        Ok(response.json().await?)
    }
}
