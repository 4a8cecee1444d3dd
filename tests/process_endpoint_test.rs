use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lectern::capture::{CaptureDevice, SinePcmSource, WebmOpusDevice};
use lectern::lecture::MemoryLectureStore;
use lectern::openai::{ApiError, ChatModel, SpeechToText};
use lectern::pipeline::Pipeline;
use lectern::remote::{chunk_object_key, MemoryObjectStore, ObjectStore};
use lectern::server;

struct CannedStt;

impl SpeechToText for CannedStt {
    fn transcribe(&self, _a: &[u8], _n: &str, _m: &str) -> Result<String, ApiError> {
        Ok("a short lecture transcript".to_string())
    }
}

struct CannedChat;

impl ChatModel for CannedChat {
    fn complete(&self, system: &str, _user: &str, _t: f32) -> Result<String, ApiError> {
        if system.contains("suggested lecture title") {
            return Ok("TITLE: Endpoint Lecture".to_string());
        }
        Ok("canned reply".to_string())
    }
}

struct TestServer {
    addr: SocketAddr,
    objects: Arc<MemoryObjectStore>,
    lectures: Arc<MemoryLectureStore>,
}

async fn spawn_server() -> TestServer {
    let objects = Arc::new(MemoryObjectStore::new());
    let lectures = Arc::new(MemoryLectureStore::new());
    let pipeline = Arc::new(Pipeline::new(
        objects.clone(),
        Arc::new(CannedStt),
        Arc::new(CannedChat),
        lectures.clone(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::app(pipeline)).await.unwrap();
    });
    // Give the listener a beat to accept connections
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        objects,
        lectures,
    }
}

fn upload_one_chunk(objects: &MemoryObjectStore, user: &str, session: &str) {
    let source = SinePcmSource::new(48000, 440.0).with_duration_secs(2.0);
    let mut device = WebmOpusDevice::new(Box::new(source));
    let mut stream = device.open(Duration::from_millis(5000)).unwrap();
    let chunk = stream.next_chunk().unwrap().unwrap();

    let key = chunk_object_key(user, session, 0, "audio/webm;codecs=opus");
    objects
        .put_object(&key, &chunk, "audio/webm;codecs=opus")
        .unwrap();
}

#[tokio::test]
async fn process_endpoint_completes_a_session() {
    let server = spawn_server().await;
    upload_one_chunk(&server.objects, "u1", "s1");

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/process", server.addr))
        .json(&serde_json::json!({ "sessionId": "s1", "userId": "u1" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["sessionId"], "s1");
    assert_eq!(body["status"], "completed");

    let record = server.lectures.get("u1", "s1").unwrap();
    assert_eq!(record["status"], "completed");
    assert!(record["notes"]
        .as_str()
        .unwrap()
        .starts_with("# Endpoint Lecture"));
}

#[tokio::test]
async fn missing_fields_return_400_with_error_body() {
    let server = spawn_server().await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/process", server.addr))
        .json(&serde_json::json!({ "sessionId": "s1" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "sessionId and userId required");
}

#[tokio::test]
async fn empty_session_returns_500_and_marks_lecture_failed() {
    let server = spawn_server().await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/process", server.addr))
        .json(&serde_json::json!({ "sessionId": "missing", "userId": "u1" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 500);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "No chunks found for session");

    let record = server.lectures.get("u1", "missing").unwrap();
    assert_eq!(record["status"], "failed");
}

#[tokio::test]
async fn preflight_options_returns_204() {
    let server = spawn_server().await;

    let client = reqwest::Client::new();
    let response = client
        .request(
            reqwest::Method::OPTIONS,
            format!("http://{}/api/process", server.addr),
        )
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 204);
}

#[tokio::test]
async fn health_endpoint_answers_ok() {
    let server = spawn_server().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/api/health", server.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}
