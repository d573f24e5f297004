use serde_json::{Map, Value};
use uuid::Uuid;

use crate::client::SendOutcome;
use crate::protocol::{ChatRequest, FileReference};

/// Who a conversation belongs to before and after the server names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationIdentity {
    /// Client-side placeholder until the first completed message.
    Pending(Uuid),
    Confirmed(String),
}

impl ConversationIdentity {
    pub fn pending() -> Self {
        ConversationIdentity::Pending(Uuid::new_v4())
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            ConversationIdentity::Confirmed(id) => Some(id),
            ConversationIdentity::Pending(_) => None,
        }
    }

    pub fn local_id(&self) -> Option<Uuid> {
        match self {
            ConversationIdentity::Pending(id) => Some(*id),
            ConversationIdentity::Confirmed(_) => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, ConversationIdentity::Confirmed(_))
    }

    /// Swaps a pending identity for the server's id. Returns false, leaving the
    /// identity untouched, if it was already confirmed.
    pub fn confirm(&mut self, server_id: impl Into<String>) -> bool {
        if self.is_confirmed() {
            return false;
        }
        *self = ConversationIdentity::Confirmed(server_id.into());
        true
    }
}

#[derive(Debug, Clone)]
struct Turn {
    query: String,
    files: Vec<FileReference>,
    inputs: Map<String, Value>,
}

/// Builds successive requests for one conversation and tracks its identity.
#[derive(Debug, Clone)]
pub struct ChatThread {
    user: String,
    identity: ConversationIdentity,
    inputs: Map<String, Value>,
    last_turn: Option<Turn>,
}

impl ChatThread {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            identity: ConversationIdentity::pending(),
            inputs: Map::new(),
            last_turn: None,
        }
    }

    /// Continues a conversation the server already knows.
    pub fn resume(user: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            identity: ConversationIdentity::Confirmed(conversation_id.into()),
            ..Self::new(user)
        }
    }

    /// Input-form values sent with every turn of this thread.
    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn identity(&self) -> &ConversationIdentity {
        &self.identity
    }

    pub fn request(&mut self, query: impl Into<String>) -> ChatRequest {
        self.request_with_files(query, Vec::new())
    }

    pub fn request_with_files(
        &mut self,
        query: impl Into<String>,
        files: Vec<FileReference>,
    ) -> ChatRequest {
        let turn = Turn {
            query: query.into(),
            files,
            inputs: self.inputs.clone(),
        };
        let request = self.build(&turn);
        self.last_turn = Some(turn);
        request
    }

    /// The previous turn again, for regenerating an answer.
    pub fn regenerate(&self) -> Option<ChatRequest> {
        self.last_turn.as_ref().map(|turn| self.build(turn))
    }

    /// Applies a finished send. Returns true when this swapped the identity
    /// from pending to confirmed.
    pub fn record(&mut self, outcome: &SendOutcome) -> bool {
        if !outcome.ended_with_message() {
            return false;
        }
        match &outcome.conversation_id {
            Some(id) => self.identity.confirm(id.clone()),
            None => false,
        }
    }

    fn build(&self, turn: &Turn) -> ChatRequest {
        let mut request = ChatRequest::new(turn.query.clone(), self.user.clone())
            .with_inputs(turn.inputs.clone())
            .with_files(turn.files.iter().cloned());
        if let Some(id) = self.identity.server_id() {
            request = request.in_conversation(id);
        }
        request
    }
}
