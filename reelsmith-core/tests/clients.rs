use std::fs;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use reelsmith_core::clients::{
    interpret_status, render, HttpService, PollPolicy, PollStatus, RetryPolicy, ServiceError,
    ServiceResult, SubtitleRequest, SubtitleService, VideoClient, VideoJob, VideoOutput,
    VideoService, VideoStatusResponse, WhisperClient,
};

/// Answers one request per connection with the next scripted response and
/// records the request lines it saw.
struct ScriptedServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedServer {
    async fn start(responses: Vec<(u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (server_hits, server_requests) = (hits.clone(), requests.clone());
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let line = read_request(&mut socket).await;
                server_requests.lock().unwrap().push(line);
                server_hits.fetch_add(1, Ordering::SeqCst);
                let reply = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        Self {
            base_url,
            hits,
            requests,
        }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn request_lines(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let read = socket.read(&mut chunk).await.unwrap_or(0);
        if read == 0 {
            break buffer.len();
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(pos) = find(&buffer, b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buffer[..header_end.min(buffer.len())]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buffer.len() < header_end + content_length {
        let read = socket.read(&mut chunk).await.unwrap_or(0);
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
    head.lines().next().unwrap_or_default().to_string()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        multiplier: 2.0,
        max_delay: Duration::from_millis(20),
    }
}

fn service(server: &ScriptedServer, retry: RetryPolicy) -> HttpService {
    HttpService::new(&server.base_url, Duration::from_secs(5), retry).unwrap()
}

fn unavailable() -> (u16, String) {
    (503, r#"{"detail":"warming up"}"#.to_string())
}

#[tokio::test]
async fn gateway_errors_are_retried_until_success() {
    let server = ScriptedServer::start(vec![
        unavailable(),
        unavailable(),
        unavailable(),
        (200, r#"{"status":"ok"}"#.to_string()),
    ])
    .await;
    let http = service(&server, fast_retry(5));

    let reply: Value = http.post_json("tts", &json!({"text": "hi"})).await.unwrap();

    assert_eq!(reply["status"], "ok");
    assert_eq!(server.hits(), 4);
}

#[tokio::test]
async fn retries_stop_at_the_attempt_cap() {
    let server = ScriptedServer::start(vec![unavailable(); 6]).await;
    let http = service(&server, fast_retry(5));

    let err = http
        .post_json::<_, Value>("tts", &json!({"text": "hi"}))
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Http { status: 503, .. }));
    assert_eq!(server.hits(), 5);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = ScriptedServer::start(vec![
        (400, r#"{"detail":"bad"}"#.to_string()),
        (200, r#"{"status":"ok"}"#.to_string()),
    ])
    .await;
    let http = service(&server, fast_retry(5));

    let err = http
        .post_json::<_, Value>("tts", &json!({"text": "hi"}))
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Http { status: 400, .. }));
    assert!(!err.is_transient());
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn video_client_submits_and_polls_until_done() {
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("ABC_0badcafe.mp4");
    fs::write(&output, b"video").unwrap();
    let server = ScriptedServer::start(vec![
        (200, r#"{"task_id":"t-42"}"#.to_string()),
        (200, r#"{"status":"processing","progress":0.5}"#.to_string()),
        (
            200,
            json!({"status": "completed", "output_path": output}).to_string(),
        ),
    ])
    .await;
    let client = VideoClient::new(
        service(&server, fast_retry(3)),
        "/api/v1/api/process/make",
        "/api/v1/api/process/status",
    );
    let job = VideoJob::Make {
        audio: temp.path().join("ABC_audio.wav"),
        subtitle: temp.path().join("ABC.srt"),
        overlay1: temp.path().join("overlay1.png"),
        overlay2: temp.path().join("overlay2.png"),
        preset_name: "1".into(),
        output_name: "ABC_0badcafe.mp4".into(),
    };

    let rendered = render(&client, &job, &PollPolicy::new(Duration::from_millis(5), 10))
        .await
        .unwrap();

    assert_eq!(rendered.task_id, "t-42");
    assert_eq!(rendered.path, output);
    let lines = server.request_lines();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("POST /api/v1/api/process/make"));
    assert!(lines[1].starts_with("GET /api/v1/api/process/status/t-42"));
}

#[tokio::test]
async fn whisper_client_waits_for_the_subtitle_file() {
    let temp = TempDir::new().unwrap();
    let request = SubtitleRequest {
        audio: temp.path().join("ABC_audio.wav"),
        output_dir: temp.path().to_path_buf(),
        filename: "ABC".into(),
        words_per_segment: Some(3),
        max_chars: None,
    };
    fs::write(request.expected_path(), "1\n00:00:00,000 --> 00:00:01,000\nhi\n").unwrap();
    let server =
        ScriptedServer::start(vec![(200, r#"{"status":"success"}"#.to_string())]).await;
    let client = WhisperClient::new(
        service(&server, fast_retry(1)),
        PollPolicy::new(Duration::from_millis(5), 3),
    );

    let path = client.transcribe(&request).await.unwrap();

    assert_eq!(path, temp.path().join("ABC.srt"));
    assert!(server.request_lines()[0].starts_with("POST /to_srt/"));
}

/// Reports `processing` for the first `pending` checks, then `failed`.
struct CrashingRender {
    pending: u32,
    checks: AtomicU32,
}

#[async_trait]
impl VideoService for CrashingRender {
    async fn submit(&self, _job: &VideoJob) -> ServiceResult<String> {
        Ok("t-1".into())
    }

    async fn status(&self, task_id: &str) -> ServiceResult<PollStatus<VideoOutput>> {
        let check = self.checks.fetch_add(1, Ordering::SeqCst);
        let response = if check < self.pending {
            VideoStatusResponse {
                status: "processing".into(),
                ..Default::default()
            }
        } else {
            VideoStatusResponse {
                status: "failed".into(),
                error: Some("render crashed".into()),
                ..Default::default()
            }
        };
        interpret_status(task_id, &response)
    }
}

fn batch_job() -> VideoJob {
    VideoJob::Batch {
        input_folder: "/srv/channel/Working".into(),
        preset_name: "1".into(),
    }
}

#[tokio::test(start_paused = true)]
async fn failure_on_the_last_poll_is_reported() {
    let service = CrashingRender {
        pending: 179,
        checks: AtomicU32::new(0),
    };
    let policy = PollPolicy::new(Duration::from_secs(10), 180);

    let err = render(&service, &batch_job(), &policy).await.unwrap_err();

    assert_eq!(err.to_string(), "Video generation failed: render crashed");
    assert_eq!(service.checks.load(Ordering::SeqCst), 180);
}

#[tokio::test(start_paused = true)]
async fn polling_gives_up_after_max_attempts() {
    let service = CrashingRender {
        pending: 180,
        checks: AtomicU32::new(0),
    };
    let policy = PollPolicy::new(Duration::from_secs(10), 180);

    let err = render(&service, &batch_job(), &policy).await.unwrap_err();

    assert!(matches!(err, ServiceError::Timeout { attempts: 180 }));
    assert_eq!(service.checks.load(Ordering::SeqCst), 180);
}
