//! In-process stand-ins for the remote collaborators.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fluxdesk_contracts::errors::JobError;
use fluxdesk_contracts::request::GenerationRequest;

use crate::artifacts::ArtifactFetcher;
use crate::controller::{BatchItemReport, JobObserver};
use crate::generation::{GenerationApi, PollHandle, PollOutcome, PollSettings};
use crate::refine::{RefineOptions, RefinementApi};

pub(crate) fn fast_settings() -> PollSettings {
    PollSettings {
        max_attempts: 10,
        poll_interval: Duration::ZERO,
    }
}

/// Replays queued submit results and poll outcomes. Once a queue runs dry,
/// submits succeed with `poll-1` and polls report `Pending`.
pub(crate) struct ScriptedApi {
    submits: Mutex<VecDeque<Result<PollHandle, JobError>>>,
    polls: Mutex<VecDeque<PollOutcome>>,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    pub submit_calls: AtomicU32,
    pub poll_calls: AtomicU32,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self {
            submits: Mutex::new(VecDeque::new()),
            polls: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
            submit_calls: AtomicU32::new(0),
            poll_calls: AtomicU32::new(0),
        }
    }

    pub fn with_submits(self, submits: Vec<Result<PollHandle, JobError>>) -> Self {
        *self.submits.lock().unwrap() = submits.into();
        self
    }

    pub fn with_polls(self, polls: Vec<PollOutcome>) -> Self {
        *self.polls.lock().unwrap() = polls.into();
        self
    }

    /// The first submit signals `entered` and then blocks until `release`
    /// yields a value.
    pub fn with_submit_gate(self, entered: Sender<()>, release: Receiver<()>) -> Self {
        *self.gate.lock().unwrap() = Some((entered, release));
        self
    }
}

impl GenerationApi for ScriptedApi {
    fn submit(&self, _request: &GenerationRequest) -> Result<PollHandle, JobError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        self.submits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(PollHandle::new("poll-1")))
    }

    fn poll(&self, _handle: &PollHandle) -> Result<PollOutcome, JobError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PollOutcome::Pending))
    }
}

/// Serves fixed bytes per URL.
#[derive(Default)]
pub(crate) struct StaticFetcher {
    bodies: HashMap<String, Vec<u8>>,
    pub calls: AtomicU32,
}

impl StaticFetcher {
    pub fn with(mut self, url: &str, body: &[u8]) -> Self {
        self.bodies.insert(url.to_string(), body.to_vec());
        self
    }
}

impl ArtifactFetcher for StaticFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.get(url).cloned().ok_or_else(|| JobError::Http {
            status: 404,
            body: format!("no stub body for {url}"),
        })
    }
}

/// Refinement stand-in: appends a marker, or fails with a fixed message.
pub(crate) struct StubRefiner {
    pub failure: Option<String>,
    pub calls: AtomicU32,
}

impl StubRefiner {
    pub fn ok() -> Self {
        Self {
            failure: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            calls: AtomicU32::new(0),
        }
    }
}

impl RefinementApi for StubRefiner {
    fn refine(
        &self,
        image: &[u8],
        _prompt: &str,
        _options: &RefineOptions,
    ) -> Result<Vec<u8>, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(JobError::Refinement(message.clone()));
        }
        let mut out = image.to_vec();
        out.extend_from_slice(b"+refined");
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Observed {
    Progress(u32, u32),
    Retry(u32, u32),
    Status(String),
    Success(PathBuf),
    BatchItem(usize, bool),
    BatchComplete(usize),
    Error(String),
    Cancelled,
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub events: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().unwrap().clone()
    }

    pub fn terminal_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    Observed::Success(_)
                        | Observed::Error(_)
                        | Observed::Cancelled
                        | Observed::BatchComplete(_)
                )
            })
            .count()
    }

    fn push(&self, event: Observed) {
        self.events.lock().unwrap().push(event);
    }
}

impl JobObserver for RecordingObserver {
    fn on_progress(&self, attempt: u32, total: u32) {
        self.push(Observed::Progress(attempt, total));
    }

    fn on_retry(&self, attempt: u32, total: u32, _message: &str) {
        self.push(Observed::Retry(attempt, total));
    }

    fn on_status(&self, message: &str) {
        self.push(Observed::Status(message.to_string()));
    }

    fn on_success(&self, path: &Path) {
        self.push(Observed::Success(path.to_path_buf()));
    }

    fn on_batch_item(&self, report: &BatchItemReport) {
        self.push(Observed::BatchItem(report.index, report.outcome.is_ok()));
    }

    fn on_batch_complete(&self, reports: &[BatchItemReport]) {
        self.push(Observed::BatchComplete(reports.len()));
    }

    fn on_error(&self, message: &str) {
        self.push(Observed::Error(message.to_string()));
    }

    fn on_cancelled(&self) {
        self.push(Observed::Cancelled);
    }
}

pub(crate) struct CannedResponse {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl CannedResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn bytes(status: u16, content_type: &'static str, body: &[u8]) -> Self {
        Self {
            status,
            content_type,
            body: body.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// One-connection-per-response HTTP/1.1 server on a loopback port. Serves
/// the canned responses in order, then stops.
pub(crate) struct FakeServer {
    base: String,
    handle: Option<JoinHandle<Vec<RecordedRequest>>>,
}

impl FakeServer {
    pub fn start(build: impl FnOnce(&str) -> Vec<CannedResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let responses = build(&base);
        listener
            .set_nonblocking(true)
            .expect("nonblocking listener");
        let handle = thread::spawn(move || serve(listener, responses));
        Self {
            base,
            handle: Some(handle),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn finish(mut self) -> Vec<RecordedRequest> {
        self.handle
            .take()
            .map(|handle| handle.join().expect("fake server thread"))
            .unwrap_or_default()
    }
}

fn serve(listener: TcpListener, responses: Vec<CannedResponse>) -> Vec<RecordedRequest> {
    let mut recorded = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    for response in responses {
        let stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break Some(stream),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        break None;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(_) => break None,
            }
        };
        let Some(mut stream) = stream else {
            break;
        };
        let _ = stream.set_nonblocking(false);
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        if let Ok(request) = read_request(&mut stream) {
            recorded.push(request);
        }
        let head = format!(
            "HTTP/1.1 {} Canned\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            response.status,
            response.content_type,
            response.body.len()
        );
        let _ = stream.write_all(head.as_bytes());
        let _ = stream.write_all(&response.body);
        let _ = stream.flush();
    }
    recorded
}

fn read_request(stream: &mut TcpStream) -> io::Result<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no request head"));
        }
        buf.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(key, _)| key == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok());
    let chunked = headers
        .iter()
        .any(|(key, value)| key == "transfer-encoding" && value.contains("chunked"));

    loop {
        let body = &buf[header_end..];
        let complete = match content_length {
            Some(len) => body.len() >= len,
            None if chunked => body.ends_with(b"0\r\n\r\n"),
            None => true,
        };
        if complete {
            break;
        }
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
    }

    Ok(RecordedRequest {
        method,
        path,
        headers,
        body: buf[header_end..].to_vec(),
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
