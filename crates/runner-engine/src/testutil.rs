//! Shared fixtures for the engine's tests: a loopback HTTP listener that
//! stands in for agent containers and download servers, a scripted image
//! fetcher, and a container runtime that binds real sockets instead of
//! talking to Docker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use runner_common::{Result, RunnerError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::fetch::{FetchedArchive, ImageFetcher};
use crate::runtime::{ContainerRuntime, LaunchSpec, StartedContainer};

/// A minimal docker-save archive: a manifest naming `tag` plus an empty
/// config blob. Enough for `verify_archive` and the fetch tests.
pub fn fake_image_archive(tag: &str) -> Vec<u8> {
    let manifest = format!(r#"[{{"Config":"config.json","RepoTags":["{tag}"],"Layers":[]}}]"#);
    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "manifest.json", manifest.as_bytes());
    append_file(&mut builder, "config.json", b"{}");
    builder.into_inner().expect("in-memory tar")
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).expect("tar entry");
}

/// How a [`FakeAgent`] answers the next request.
#[derive(Debug, Clone)]
pub struct AgentBehavior {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: String,
    pub delay: Duration,
    pub drop_connection: bool,
}

impl AgentBehavior {
    pub fn respond(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            body,
            content_type: "application/octet-stream".to_string(),
            delay: Duration::ZERO,
            drop_connection: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    pub fn drop_connection() -> Self {
        Self {
            drop_connection: true,
            ..Self::respond(200, Vec::new())
        }
    }
}

/// Loopback HTTP/1.1 listener with scripted behavior. Serves as both the
/// archive download server and the in-container agent in tests.
pub struct FakeAgent {
    pub port: u16,
    pub hits: Arc<AtomicUsize>,
    pub posts: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl FakeAgent {
    pub async fn spawn(behavior: AgentBehavior) -> FakeAgent {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        Self::serve(listener, Arc::new(Mutex::new(behavior)))
    }

    pub async fn bind(port: u16, behavior: Arc<Mutex<AgentBehavior>>) -> std::io::Result<FakeAgent> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        Ok(Self::serve(listener, behavior))
    }

    fn serve(listener: TcpListener, behavior: Arc<Mutex<AgentBehavior>>) -> FakeAgent {
        let port = listener.local_addr().expect("local addr").port();
        let hits = Arc::new(AtomicUsize::new(0));
        let posts = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let agent_behavior = behavior;
        let agent_hits = hits.clone();
        let agent_posts = posts.clone();
        let agent_max = max_in_flight.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let behavior = agent_behavior.lock().unwrap_or_else(|e| e.into_inner()).clone();
                let hits = agent_hits.clone();
                let posts = agent_posts.clone();
                let in_flight = in_flight.clone();
                let max = agent_max.clone();
                tokio::spawn(async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(current, Ordering::SeqCst);
                    handle_request(socket, behavior, &hits, &posts).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        FakeAgent {
            port,
            hits,
            posts,
            max_in_flight,
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    /// Aborts the accept loop and waits for it to finish, so the listener
    /// is closed by the time this returns and the port can be rebound.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn handle_request(
    mut socket: TcpStream,
    behavior: AgentBehavior,
    hits: &AtomicUsize,
    posts: &AtomicUsize,
) {
    let Some(method) = read_request(&mut socket).await else {
        return;
    };
    hits.fetch_add(1, Ordering::SeqCst);
    if method == "POST" {
        posts.fetch_add(1, Ordering::SeqCst);
    }

    if behavior.delay > Duration::ZERO {
        tokio::time::sleep(behavior.delay).await;
    }
    if behavior.drop_connection {
        return; // socket drops without a response
    }

    let reason = match behavior.status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Status",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        behavior.status,
        reason,
        behavior.content_type,
        behavior.body.len()
    );
    let _ = socket.write_all(head.as_bytes()).await;
    let _ = socket.write_all(&behavior.body).await;
    let _ = socket.flush().await;
}

/// Reads one full HTTP request (headers plus Content-Length body) and
/// returns the method, or None if the peer hung up early.
async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let method = head.split_whitespace().next().unwrap_or("").to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    Some(method)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Image fetcher with a scripted outcome: optional delay, optional leading
/// failures, and a fixed-size archive written to the destination.
pub struct ScriptedFetcher {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub fail_first: usize,
    pub archive_bytes: usize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_first: 0,
            archive_bytes: 64,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: String, dest: PathBuf, _deadline: Duration) -> Result<FetchedArchive> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        if call < self.fail_first {
            return Err(RunnerError::ImageResolve(format!(
                "scripted failure for {url}"
            )));
        }
        tokio::fs::write(&dest, vec![0u8; self.archive_bytes])
            .await
            .map_err(|e| RunnerError::ImageResolve(e.to_string()))?;
        let slug: String = url
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(12)
            .collect();
        Ok(FetchedArchive {
            size_bytes: self.archive_bytes as u64,
            repo_tag: format!("{slug}:latest"),
        })
    }
}

/// Container runtime that binds a [`FakeAgent`] on the requested host port
/// instead of starting a container. Toggle `listen` off to simulate an
/// image whose process never opens its listener.
pub struct FakeRuntime {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub listen: AtomicBool,
    start_delay: Mutex<Duration>,
    behavior: Arc<Mutex<AgentBehavior>>,
    agents: Mutex<HashMap<String, FakeAgent>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            listen: AtomicBool::new(true),
            start_delay: Mutex::new(Duration::ZERO),
            behavior: Arc::new(Mutex::new(AgentBehavior::respond(200, b"ok".to_vec()))),
            agents: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_behavior(&self, behavior: AgentBehavior) {
        *self.behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    /// Makes every subsequent `start` take this long, simulating a slow
    /// container launch.
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Highest number of requests any one agent served concurrently.
    pub fn max_in_flight(&self) -> usize {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|agent| agent.max_in_flight.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }

    pub fn total_posts(&self) -> usize {
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|agent| agent.posts.load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: LaunchSpec) -> Result<StartedContainer> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock().unwrap_or_else(|e| e.into_inner());
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let container_id = format!("fake-{}", uuid::Uuid::new_v4());
        if self.listen.load(Ordering::SeqCst) {
            let agent = FakeAgent::bind(spec.host_port, self.behavior.clone())
                .await
                .map_err(|e| {
                    RunnerError::InstanceStart(format!("binding port {}: {e}", spec.host_port))
                })?;
            self.agents
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(container_id.clone(), agent);
        }
        Ok(StartedContainer { container_id })
    }

    async fn stop(&self, container_id: String) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let agent = self
            .agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&container_id);
        if let Some(agent) = agent {
            // Wait for the listener to actually close; the port is handed
            // back to the pool as soon as this returns.
            agent.shutdown().await;
        }
        Ok(())
    }
}
