use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use difystream::protocol::{ConversationQuery, MessageEnd, StepStatus};
use difystream::{
    ChatClient, ClientConfig, ClientError, PendingFiles, Rating, SessionState, SessionUpdate,
    StreamEvent, StreamHandler, UploadState,
};
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use tokio::net::TcpListener;

const API_KEY: &str = "app-test-key";

const HELLO: &str = concat!(
    "data: {\"event\":\"message\",\"answer\":\"He\",\"task_id\":\"t1\"}\n\n",
    "data: {\"event\":\"message\",\"answer\":\"llo\",\"task_id\":\"t1\"}\n\n",
    "data: {\"event\":\"message_end\",\"conversation_id\":\"c1\",\"message_id\":\"m1\",\"metadata\":{\"suggested_questions\":[\"And then?\"]}}\n\n",
);

#[derive(Default)]
struct MockState {
    stop_calls: AtomicUsize,
    last_chat: Mutex<Option<Value>>,
    last_feedback: Mutex<Option<Value>>,
    last_delete: Mutex<Option<Value>>,
}

fn authorize(headers: &HeaderMap) -> Result<(), StatusCode> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match header {
        Some(value) if value == format!("Bearer {}", API_KEY) => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn dify_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({"code": code, "message": message, "status": status.as_u16()})),
    )
        .into_response()
}

// Splits at odd offsets so records and multi-byte characters straddle chunks.
fn awkward_chunks(body: &str) -> Vec<Vec<u8>> {
    body.as_bytes().chunks(7).map(<[u8]>::to_vec).collect()
}

fn event_stream(chunks: Vec<Vec<u8>>) -> Response {
    let body = Body::from_stream(stream::iter(chunks.into_iter().map(Ok::<_, Infallible>)));
    ([(CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn chat_messages(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(status) = authorize(&headers) {
        return dify_error(status, "unauthorized", "Access token is invalid");
    }
    *state.last_chat.lock().unwrap() = Some(body.clone());

    match body["query"].as_str().unwrap_or_default() {
        "hi" => event_stream(awkward_chunks(HELLO)),
        "cjk" => event_stream(awkward_chunks(concat!(
            "data: {\"event\":\"message\",\"answer\":\"你好\",\"task_id\":\"t2\"}\n\n",
            "data: {\"event\":\"message\",\"answer\":\"世界\",\"task_id\":\"t2\"}\n\n",
            "data: [DONE]\n\n",
        ))),
        "workflow" => event_stream(awkward_chunks(concat!(
            "data: {\"event\":\"workflow_started\",\"task_id\":\"t3\",\"workflow_run_id\":\"w\",\"data\":{\"id\":\"w\"}}\n\n",
            "data: {\"event\":\"node_finished\",\"task_id\":\"t3\",\"data\":{\"id\":\"n\",\"title\":\"LLM\",\"status\":\"succeeded\"}}\n\n",
            "data: {\"event\":\"message\",\"answer\":\"ok\",\"task_id\":\"t3\"}\n\n",
            "data: {\"event\":\"workflow_finished\",\"task_id\":\"t3\",\"data\":{\"id\":\"w\",\"status\":\"failed\",\"error\":\"boom\"}}\n\n",
            "data: {\"event\":\"message_end\",\"conversation_id\":\"c3\",\"message_id\":\"m3\"}\n\n",
        ))),
        "partial" => event_stream(awkward_chunks(concat!(
            "data: {\"event\":\"message\",\"answer\":\"Half an\",\"task_id\":\"t4\"}\n\n",
            "data: {\"event\":\"error\",\"task_id\":\"t4\",\"status\":500,\"code\":\"completion_request_error\",\"message\":\"model overloaded\"}\n\n",
        ))),
        "slow" => {
            let first = stream::iter(vec![Ok::<_, Infallible>(
                b"data: {\"event\":\"message\",\"answer\":\"Thinking\",\"task_id\":\"t-slow\"}\n\n"
                    .to_vec(),
            )]);
            let body = Body::from_stream(first.chain(stream::pending()));
            ([(CONTENT_TYPE, "text/event-stream")], body).into_response()
        }
        "hang" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            event_stream(Vec::new())
        }
        _ => dify_error(StatusCode::BAD_REQUEST, "invalid_param", "unsupported query"),
    }
}

async fn stop_task(
    State(state): State<Arc<MockState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(status) = authorize(&headers) {
        return status.into_response();
    }
    assert_eq!(body["user"], "u1", "stop for {}", task_id);
    state.stop_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({"result": "success"})).into_response()
}

async fn upload(headers: HeaderMap, body: Bytes) -> Response {
    if let Err(status) = authorize(&headers) {
        return status.into_response();
    }
    let is_multipart = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));
    if !is_multipart {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }

    let text = String::from_utf8_lossy(&body);
    if text.contains("filename=\"reject.txt\"") {
        return dify_error(StatusCode::PAYLOAD_TOO_LARGE, "file_too_large", "File size exceeded.");
    }
    assert!(text.contains("name=\"user\""));
    let id = if text.contains("filename=\"cat.png\"") {
        if !text.to_ascii_lowercase().contains("content-type: image/png") {
            return dify_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_file_type",
                "File type not allowed.",
            );
        }
        "file-png"
    } else {
        "file-txt"
    };
    (
        StatusCode::CREATED,
        Json(json!({"id": id, "name": "x", "size": 5, "extension": "txt", "mime_type": "text/plain"})),
    )
        .into_response()
}

async fn conversations(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Response {
    if let Err(status) = authorize(&headers) {
        return status.into_response();
    }
    assert_eq!(params.get("user").map(String::as_str), Some("u1"));
    let has_more = params.get("last_id").is_none();
    Json(json!({
        "limit": params.get("limit").and_then(|l| l.parse::<u32>().ok()).unwrap_or(20),
        "has_more": has_more,
        "data": [
            {"id": "c1", "name": "First chat", "inputs": {}, "status": "normal", "created_at": 1700000000, "updated_at": 1700000100},
            {"id": "c2", "name": null, "inputs": null, "status": "normal", "created_at": 1700000200}
        ]
    }))
    .into_response()
}

async fn rename_conversation(
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(status) = authorize(&headers) {
        return status.into_response();
    }
    let name = if body["auto_generate"] == json!(true) {
        "Generated title".to_string()
    } else {
        body["name"].as_str().unwrap_or_default().to_string()
    };
    Json(json!({"id": conversation_id, "name": name, "inputs": {}, "status": "normal"})).into_response()
}

async fn delete_conversation(
    State(state): State<Arc<MockState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(status) = authorize(&headers) {
        return status.into_response();
    }
    if conversation_id == "missing" {
        return dify_error(StatusCode::NOT_FOUND, "not_found", "Conversation Not Exists.");
    }
    *state.last_delete.lock().unwrap() = Some(body);
    StatusCode::NO_CONTENT.into_response()
}

async fn messages(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Response {
    if let Err(status) = authorize(&headers) {
        return status.into_response();
    }
    assert_eq!(params.get("conversation_id").map(String::as_str), Some("c1"));
    Json(json!({
        "limit": 20,
        "has_more": params.get("first_id").is_none(),
        "data": [{
            "id": "m1",
            "conversation_id": "c1",
            "query": "hi",
            "answer": "Hello",
            "created_at": 1700000000,
            "message_files": [],
            "feedback": null,
            "metadata": {"suggested_questions": null}
        }]
    }))
    .into_response()
}

async fn feedback(
    State(state): State<Arc<MockState>>,
    Path(message_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(status) = authorize(&headers) {
        return status.into_response();
    }
    *state.last_feedback.lock().unwrap() = Some(json!({"message_id": message_id, "body": body}));
    Json(json!({"result": "success"})).into_response()
}

async fn parameters(headers: HeaderMap) -> Response {
    if let Err(status) = authorize(&headers) {
        return status.into_response();
    }
    Json(json!({
        "opening_statement": "Welcome!",
        "suggested_questions": ["What can you do?", ""],
        "suggested_questions_after_answer": {"enabled": true},
        "file_upload": {"image": {"enabled": true}},
        "user_input_form": [],
        "speech_to_text": {"enabled": false}
    }))
    .into_response()
}

async fn malformed_parameters(headers: HeaderMap) -> Response {
    if let Err(status) = authorize(&headers) {
        return status.into_response();
    }
    ([(CONTENT_TYPE, "application/json")], "{\"opening_statement\": ").into_response()
}

async fn spawn_server() -> (String, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/v1/chat-messages", post(chat_messages))
        .route("/v1/chat-messages/:task_id/stop", post(stop_task))
        .route("/v1/files/upload", post(upload))
        .route("/v1/conversations", get(conversations))
        .route("/v1/conversations/:id/name", post(rename_conversation))
        .route("/v1/conversations/:id", delete(delete_conversation))
        .route("/v1/messages", get(messages))
        .route("/v1/messages/:id/feedbacks", post(feedback))
        .route("/v1/parameters", get(parameters))
        .route("/broken/parameters", get(malformed_parameters))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/v1/", addr), state)
}

fn client_for(base_url: &str) -> ChatClient {
    ChatClient::new(ClientConfig::new(base_url, API_KEY, "u1")).unwrap()
}

#[derive(Default)]
struct Recorder {
    chunks: Vec<String>,
    kinds: Vec<String>,
    ends: Vec<MessageEnd>,
    errors: Vec<String>,
    completions: usize,
}

impl StreamHandler for Recorder {
    fn on_chunk(&mut self, text: &str) {
        self.chunks.push(text.to_string());
    }

    fn on_event(&mut self, event: &StreamEvent) {
        self.kinds.push(event.kind().to_string());
    }

    fn on_message_end(&mut self, end: &MessageEnd) {
        self.ends.push(end.clone());
    }

    fn on_error(&mut self, error: &ClientError) {
        self.errors.push(error.to_string());
    }

    fn on_complete(&mut self) {
        self.completions += 1;
    }
}

#[tokio::test]
async fn send_message_streams_hello_and_resolves_identifiers() {
    let (base_url, state) = spawn_server().await;
    let client = client_for(&base_url);
    let mut recorder = Recorder::default();

    let outcome = client
        .send_message(&client.request("hi"), &mut recorder)
        .await
        .unwrap();

    assert_eq!(recorder.chunks, vec!["He", "llo"]);
    assert_eq!(recorder.ends.len(), 1);
    assert_eq!(recorder.ends[0].conversation_id.as_deref(), Some("c1"));
    assert_eq!(recorder.completions, 1);
    assert!(recorder.errors.is_empty());

    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.conversation_id.as_deref(), Some("c1"));
    assert_eq!(outcome.message_id.as_deref(), Some("m1"));
    assert_eq!(outcome.task_id.as_deref(), Some("t1"));
    assert_eq!(outcome.answer, "Hello");
    assert_eq!(outcome.suggested_questions(), ["And then?".to_string()]);
    assert_eq!(client.last_task_id(), None);

    let sent = state.last_chat.lock().unwrap().clone().unwrap();
    assert_eq!(sent["query"], "hi");
    assert_eq!(sent["user"], "u1");
    assert_eq!(sent["response_mode"], "streaming");
    assert_eq!(sent["inputs"], json!({}));
    assert!(sent.get("conversation_id").is_none());
}

#[tokio::test]
async fn stop_task_is_idempotent() {
    let (base_url, state) = spawn_server().await;
    let client = client_for(&base_url);
    client.send_message(&client.request("hi"), ()).await.unwrap();

    // t1 finished on this client, so no request is needed.
    client.stop_task("t1").await.unwrap();
    client.stop_task("t1").await.unwrap();
    assert_eq!(state.stop_calls.load(Ordering::SeqCst), 0);

    client.stop_task("t-elsewhere").await.unwrap();
    client.stop_task("t-elsewhere").await.unwrap();
    assert_eq!(state.stop_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn multibyte_text_survives_chunk_splits() {
    let (base_url, _state) = spawn_server().await;
    let client = client_for(&base_url);
    let mut recorder = Recorder::default();

    let outcome = client
        .send_message(&client.request("cjk"), &mut recorder)
        .await
        .unwrap();

    assert_eq!(recorder.chunks, vec!["你好", "世界"]);
    assert_eq!(outcome.answer, "你好世界");
    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(recorder.completions, 1);
    assert!(recorder.ends.is_empty());
}

#[tokio::test]
async fn workflow_events_are_classified() {
    let (base_url, _state) = spawn_server().await;
    let client = client_for(&base_url);

    let (updates, _cancel, task) = client.stream_message(&client.request("workflow")).await.unwrap();
    let updates: Vec<SessionUpdate> = updates.collect().await;
    let outcome = task.await.unwrap();

    let steps: Vec<(String, StepStatus)> = updates
        .iter()
        .filter_map(|update| match update {
            SessionUpdate::Event(event) => event
                .workflow_step()
                .map(|step| (event.kind().to_string(), step.status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        steps,
        vec![
            ("workflow_started".to_string(), StepStatus::Running),
            ("node_finished".to_string(), StepStatus::Completed),
            ("workflow_finished".to_string(), StepStatus::Failed),
        ]
    );
    assert!(matches!(updates.last(), Some(SessionUpdate::Complete)));
    assert_eq!(outcome.answer, "ok");
    assert_eq!(outcome.conversation_id.as_deref(), Some("c3"));
}

#[tokio::test]
async fn http_error_before_stream_is_returned_not_delivered() {
    let (base_url, _state) = spawn_server().await;
    let client = client_for(&base_url);
    let mut recorder = Recorder::default();

    let err = client
        .send_message(&client.request("unknown"), &mut recorder)
        .await
        .unwrap_err();

    match err {
        ClientError::Http {
            status,
            code,
            message,
        } => {
            assert_eq!(status, 400);
            assert_eq!(code.as_deref(), Some("invalid_param"));
            assert_eq!(message, "unsupported query");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(recorder.errors.is_empty());
    assert!(recorder.kinds.is_empty());
}

#[tokio::test]
async fn wrong_api_key_is_an_http_error() {
    let (base_url, _state) = spawn_server().await;
    let client = ChatClient::new(ClientConfig::new(&base_url, "wrong", "u1")).unwrap();

    let err = client.get_parameters().await.unwrap_err();
    assert_eq!(err.status(), Some(401));
}

#[tokio::test]
async fn mid_stream_error_keeps_partial_answer() {
    let (base_url, _state) = spawn_server().await;
    let client = client_for(&base_url);
    let mut recorder = Recorder::default();

    let outcome = client
        .send_message(&client.request("partial"), &mut recorder)
        .await
        .unwrap();

    assert_eq!(outcome.state, SessionState::Failed);
    assert_eq!(outcome.answer, "Half an");
    assert_eq!(recorder.errors.len(), 1);
    assert!(recorder.errors[0].contains("model overloaded"));
    assert_eq!(recorder.completions, 0);
    assert!(matches!(
        outcome.error,
        Some(ClientError::StreamProtocol {
            status: Some(500),
            ..
        })
    ));
}

#[tokio::test]
async fn cancel_stops_local_consumption_and_stop_current_reaches_server() {
    let (base_url, state) = spawn_server().await;
    let client = client_for(&base_url);

    let (mut updates, cancel, task) = client.stream_message(&client.request("slow")).await.unwrap();
    loop {
        match updates.next().await {
            Some(SessionUpdate::Chunk(text)) => {
                assert_eq!(text, "Thinking");
                break;
            }
            Some(_) => continue,
            None => panic!("stream ended before the first chunk"),
        }
    }

    cancel.cancel();
    let outcome = task.await.unwrap();
    assert_eq!(outcome.state, SessionState::Cancelled);
    assert_eq!(outcome.answer, "Thinking");
    assert!(updates.next().await.is_none());

    assert_eq!(client.last_task_id().as_deref(), Some("t-slow"));
    assert_eq!(client.stop_current().await.unwrap().as_deref(), Some("t-slow"));
    assert_eq!(state.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.last_task_id(), None);
    assert_eq!(client.stop_current().await.unwrap(), None);
}

#[tokio::test]
async fn connect_phase_timeout() {
    let (base_url, _state) = spawn_server().await;
    let client = ChatClient::new(
        ClientConfig::new(&base_url, API_KEY, "u1").with_connect_timeout(Duration::from_millis(200)),
    )
    .unwrap();

    let err = client.send_message(&client.request("hang"), ()).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(d) if d == Duration::from_millis(200)));
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(&format!("http://{}/v1", addr));
    let err = client.send_message(&client.request("hi"), ()).await.unwrap_err();
    assert!(matches!(err, ClientError::Network(_)), "got {:?}", err);
    assert!(err.is_transient());
}

#[tokio::test]
async fn conversation_operations() {
    let (base_url, state) = spawn_server().await;
    let client = client_for(&base_url);

    let page = client
        .list_conversations(&ConversationQuery::default().limit(2))
        .await
        .unwrap();
    assert_eq!(page.limit, Some(2));
    assert!(page.has_more);
    assert_eq!(page.data.len(), 2);
    assert_eq!(page.data[0].name, "First chat");
    assert_eq!(page.data[1].name, "");

    let next = client
        .list_conversations(&ConversationQuery::default().after("c2"))
        .await
        .unwrap();
    assert!(!next.has_more);

    let renamed = client.rename_conversation("c1", "Renamed").await.unwrap();
    assert_eq!(renamed.name, "Renamed");
    let generated = client.auto_rename_conversation("c1").await.unwrap();
    assert_eq!(generated.name, "Generated title");

    client.delete_conversation("c1").await.unwrap();
    assert_eq!(
        state.last_delete.lock().unwrap().clone(),
        Some(json!({"user": "u1"}))
    );

    let err = client.delete_conversation("missing").await.unwrap_err();
    assert!(matches!(err, ClientError::Http { status: 404, .. }));
}

#[tokio::test]
async fn messages_feedback_and_parameters() {
    let (base_url, state) = spawn_server().await;
    let client = client_for(&base_url);

    let history = client.list_messages("c1", None, Some(20)).await.unwrap();
    assert!(history.has_more);
    assert_eq!(history.data[0].answer.as_deref(), Some("Hello"));
    assert!(history.data[0].metadata.suggested_questions.is_empty());

    client
        .submit_feedback("m1", Some(Rating::Like), Some("great"))
        .await
        .unwrap();
    assert_eq!(
        state.last_feedback.lock().unwrap().clone(),
        Some(json!({
            "message_id": "m1",
            "body": {"rating": "like", "user": "u1", "content": "great"}
        }))
    );

    client.submit_feedback("m1", None, None).await.unwrap();
    assert_eq!(
        state.last_feedback.lock().unwrap().clone().unwrap()["body"],
        json!({"rating": null, "user": "u1"})
    );

    let parameters = client.get_parameters().await.unwrap();
    assert_eq!(parameters.opening_statement.as_deref(), Some("Welcome!"));
    assert_eq!(
        parameters.opening_suggestions().collect::<Vec<_>>(),
        vec!["What can you do?"]
    );
}

#[tokio::test]
async fn uploads_single_and_pending_files() {
    let (base_url, _state) = spawn_server().await;
    let client = client_for(&base_url);
    let dir = tempfile::tempdir().unwrap();

    let note = dir.path().join("note.txt");
    std::fs::write(&note, "hello").unwrap();
    let uploaded = client.upload_file(&note).await.unwrap();
    assert_eq!(uploaded.id, "file-txt");

    let image = dir.path().join("cat.png");
    std::fs::write(&image, [0x89, b'P', b'N', b'G']).unwrap();
    let mut pending = PendingFiles::new();
    pending.add(&note);
    pending.add(&image);

    let references = client.upload_pending(&mut pending).await.unwrap();
    assert!(pending.all_uploaded());
    assert_eq!(references.len(), 2);
    assert_eq!(references[1].upload_file_id.as_deref(), Some("file-png"));
    assert_eq!(references[1].kind, difystream::FileKind::Image);

    let rejected = dir.path().join("reject.txt");
    std::fs::write(&rejected, "too big").unwrap();
    let mut pending = PendingFiles::new();
    pending.add(&rejected);
    let err = client.upload_pending(&mut pending).await.unwrap_err();
    assert!(matches!(err, ClientError::Upload { status: Some(413), .. }));
    assert!(matches!(
        pending.iter().next().unwrap().state(),
        UploadState::Failed(_)
    ));
}

#[tokio::test]
async fn dropping_updates_during_a_stall_releases_the_session() {
    let (base_url, state) = spawn_server().await;
    let client = client_for(&base_url);

    let (mut updates, cancel, task) = client.stream_message(&client.request("slow")).await.unwrap();
    loop {
        match updates.next().await {
            Some(SessionUpdate::Chunk(_)) => break,
            Some(_) => continue,
            None => panic!("stream ended before the first chunk"),
        }
    }
    drop(updates);

    let outcome = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("session kept running after its updates were dropped")
        .unwrap();
    assert!(cancel.is_cancelled());
    assert_eq!(outcome.state, SessionState::Cancelled);

    assert_eq!(client.stop_current().await.unwrap().as_deref(), Some("t-slow"));
    assert_eq!(state.stop_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_success_body_is_not_transient() {
    let (base_url, _state) = spawn_server().await;
    let client = client_for(&base_url.replace("/v1/", "/broken"));

    let err = client.get_parameters().await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidResponse(_)), "got {:?}", err);
    assert!(!err.is_transient());
    assert_eq!(err.status(), None);
}
