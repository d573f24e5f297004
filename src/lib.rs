//! Streaming client for the Dify chat-message API.

pub mod channel;
pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod session;
pub mod thread;
pub mod transport;

pub use channel::{ChannelHandler, EventStream, SessionUpdate};
pub use client::{ChatClient, SendOutcome};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use pending::{PendingFile, PendingFiles, UploadState};
pub use protocol::{ChatRequest, FileKind, FileReference, Rating, StreamEvent};
pub use session::{CancelHandle, SessionOutcome, SessionState, StreamHandler, StreamSession};
pub use thread::{ChatThread, ConversationIdentity};
