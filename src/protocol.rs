use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Document,
    Audio,
    Video,
}

impl FileKind {
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            FileKind::Image
        } else if mime.starts_with("audio/") {
            FileKind::Audio
        } else if mime.starts_with("video/") {
            FileKind::Video
        } else {
            FileKind::Document
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    LocalFile,
    RemoteUrl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub transfer_method: TransferMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl FileReference {
    pub fn uploaded(kind: FileKind, file_id: impl Into<String>) -> Self {
        Self {
            kind,
            transfer_method: TransferMethod::LocalFile,
            upload_file_id: Some(file_id.into()),
            url: None,
        }
    }

    pub fn remote(kind: FileKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            transfer_method: TransferMethod::RemoteUrl,
            upload_file_id: None,
            url: Some(url.into()),
        }
    }
}

/// One chat turn to send. Immutable once built; the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    query: String,
    user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
    inputs: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    files: Vec<FileReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_generate_name: Option<bool>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user: user.into(),
            conversation_id: None,
            inputs: Map::new(),
            files: Vec::new(),
            auto_generate_name: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_file(mut self, file: FileReference) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_files(mut self, files: impl IntoIterator<Item = FileReference>) -> Self {
        self.files.extend(files);
        self
    }

    pub fn auto_generate_name(mut self, enabled: bool) -> Self {
        self.auto_generate_name = Some(enabled);
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn files(&self) -> &[FileReference] {
        &self.files
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ResponseMode {
    Streaming,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessagePayload<'a> {
    #[serde(flatten)]
    pub(crate) request: &'a ChatRequest,
    pub(crate) response_mode: ResponseMode,
}

#[derive(Debug, Serialize)]
pub(crate) struct UserPayload<'a> {
    pub(crate) user: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct RenamePayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<&'a str>,
    pub(crate) auto_generate: bool,
    pub(crate) user: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Like,
    Dislike,
}

#[derive(Debug, Serialize)]
pub(crate) struct FeedbackPayload<'a> {
    /// `null` clears an earlier rating.
    pub(crate) rating: Option<Rating>,
    pub(crate) user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) content: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationQuery {
    pub last_id: Option<String>,
    pub limit: Option<u32>,
    pub pinned: Option<bool>,
}

impl ConversationQuery {
    pub fn after(mut self, last_id: impl Into<String>) -> Self {
        self.last_id = Some(last_id.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = Some(pinned);
        self
    }

    pub(crate) fn to_params(&self, user: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![("user", user.to_string())];
        if let Some(last_id) = &self.last_id {
            params.push(("last_id", last_id.clone()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(pinned) = self.pinned {
            params.push(("pinned", pinned.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Page<T> {
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub type ConversationPage = Page<Conversation>;
pub type MessagePage = Page<Message>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub introduction: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message_files: Vec<Value>,
    #[serde(default)]
    pub feedback: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AppParameters {
    #[serde(default)]
    pub opening_statement: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub suggested_questions: Vec<String>,
    #[serde(default)]
    pub suggested_questions_after_answer: Option<Value>,
    #[serde(default)]
    pub file_upload: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_input_form: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppParameters {
    /// Opening suggestions with blank entries removed.
    pub fn opening_suggestions(&self) -> impl Iterator<Item = &str> {
        self.suggested_questions
            .iter()
            .map(String::as_str)
            .filter(|q| !q.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadedFile {
    #[serde(alias = "upload_file_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, deserialize_with = "null_as_default")]
    pub suggested_questions: Vec<String>,
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub retriever_resources: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnd {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Running,
    #[serde(alias = "succeeded")]
    Completed,
    Failed,
    Stopped,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    #[serde(default)]
    pub id: String,
    #[serde(default, alias = "title")]
    pub name: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub elapsed_time: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default, alias = "workflow", deserialize_with = "null_as_default")]
    pub data: WorkflowStep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A decoded record from the chat-message stream, tagged by its `event` field.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message(MessageDelta),
    MessageEnd(MessageEnd),
    WorkflowStarted(WorkflowEvent),
    NodeStarted(WorkflowEvent),
    NodeFinished(WorkflowEvent),
    WorkflowFinished(WorkflowEvent),
    Error(ErrorEvent),
    Ping,
    /// Any `event` this crate does not model, with the record untouched.
    Unknown { event: String, raw: Value },
}

impl StreamEvent {
    /// Classifies one JSON record. Fails only when the record is not an object
    /// or a known kind has fields of the wrong type.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = match &value {
            Value::Object(map) => map
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected a JSON object, found {}",
                    json_kind(other)
                )));
            }
        };

        let event = match kind.as_str() {
            "message" => StreamEvent::Message(serde_json::from_value(value)?),
            "message_end" => StreamEvent::MessageEnd(serde_json::from_value(value)?),
            "workflow_started" => StreamEvent::WorkflowStarted(serde_json::from_value(value)?),
            "node_started" => StreamEvent::NodeStarted(serde_json::from_value(value)?),
            "node_finished" => StreamEvent::NodeFinished(serde_json::from_value(value)?),
            "workflow_finished" => StreamEvent::WorkflowFinished(serde_json::from_value(value)?),
            "error" => StreamEvent::Error(serde_json::from_value(value)?),
            "ping" => StreamEvent::Ping,
            _ => StreamEvent::Unknown {
                event: kind,
                raw: value,
            },
        };
        Ok(event)
    }

    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        Self::from_value(serde_json::from_str(payload)?)
    }

    pub fn kind(&self) -> &str {
        match self {
            StreamEvent::Message(_) => "message",
            StreamEvent::MessageEnd(_) => "message_end",
            StreamEvent::WorkflowStarted(_) => "workflow_started",
            StreamEvent::NodeStarted(_) => "node_started",
            StreamEvent::NodeFinished(_) => "node_finished",
            StreamEvent::WorkflowFinished(_) => "workflow_finished",
            StreamEvent::Error(_) => "error",
            StreamEvent::Ping => "ping",
            StreamEvent::Unknown { event, .. } => event,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Message(e) => e.task_id.as_deref(),
            StreamEvent::MessageEnd(e) => e.task_id.as_deref(),
            StreamEvent::WorkflowStarted(e)
            | StreamEvent::NodeStarted(e)
            | StreamEvent::NodeFinished(e)
            | StreamEvent::WorkflowFinished(e) => e.task_id.as_deref(),
            StreamEvent::Error(e) => e.task_id.as_deref(),
            StreamEvent::Ping => None,
            StreamEvent::Unknown { raw, .. } => raw.get("task_id").and_then(Value::as_str),
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Message(e) => e.conversation_id.as_deref(),
            StreamEvent::MessageEnd(e) => e.conversation_id.as_deref(),
            StreamEvent::WorkflowStarted(e)
            | StreamEvent::NodeStarted(e)
            | StreamEvent::NodeFinished(e)
            | StreamEvent::WorkflowFinished(e) => e.conversation_id.as_deref(),
            StreamEvent::Error(_) | StreamEvent::Ping => None,
            StreamEvent::Unknown { raw, .. } => {
                raw.get("conversation_id").and_then(Value::as_str)
            }
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Message(e) => e.message_id.as_deref(),
            StreamEvent::MessageEnd(e) => e.message_id.as_deref(),
            StreamEvent::Error(e) => e.message_id.as_deref(),
            StreamEvent::Unknown { raw, .. } => raw.get("message_id").and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn workflow_step(&self) -> Option<&WorkflowStep> {
        match self {
            StreamEvent::WorkflowStarted(e)
            | StreamEvent::NodeStarted(e)
            | StreamEvent::NodeFinished(e)
            | StreamEvent::WorkflowFinished(e) => Some(&e.data),
            _ => None,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
