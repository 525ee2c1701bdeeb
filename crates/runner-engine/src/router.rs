//! End-to-end request path: resolve the agent image, acquire its instance,
//! forward the payload, and assemble the step-by-step receipt.

use std::sync::Arc;
use std::time::Instant;

use runner_common::{
    AgentResponse, ExecutionRequest, Outcome, Receipt, Result, RunnerError, Step,
};
use tracing::{info, instrument, warn};

use crate::cache::{CachedImage, ImageCache};
use crate::instance::InstancePool;
use crate::receipt::{ReceiptRecorder, ReceiptUploader};

struct RouterInner {
    cache: ImageCache,
    pool: InstancePool,
    uploader: ReceiptUploader,
    client: reqwest::Client,
}

#[derive(Clone)]
pub struct ExecutionRouter {
    inner: Arc<RouterInner>,
}

impl ExecutionRouter {
    pub fn new(cache: ImageCache, pool: InstancePool, uploader: ReceiptUploader) -> ExecutionRouter {
        ExecutionRouter {
            inner: Arc::new(RouterInner {
                cache,
                pool,
                uploader,
                client: reqwest::Client::new(),
            }),
        }
    }

    /// Runs one request end to end. The receipt is always produced and
    /// published, whether the execution succeeded or not.
    #[instrument(skip(self, request), fields(request_id = %request.request_id, agent_url = %request.agent_url))]
    pub async fn execute(&self, request: ExecutionRequest) -> (Result<AgentResponse>, Receipt) {
        let mut recorder = ReceiptRecorder::new(&request.request_id, &request.agent_url);
        let result = self.run(&request, &mut recorder).await;
        let outcome = match &result {
            Ok(_) => Outcome::Ok,
            Err(_) => Outcome::Error,
        };
        let receipt = recorder.finish(outcome);
        self.inner.uploader.publish(&receipt);
        match &result {
            Ok(response) => info!(bytes = response.body.len(), "request completed"),
            Err(e) => warn!(error = %e, kind = e.kind(), "request failed"),
        }
        (result, receipt)
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        recorder: &mut ReceiptRecorder,
    ) -> Result<AgentResponse> {
        let started = Instant::now();
        let deadline_at = started + request.deadline;

        recorder.record(
            Step::new("request_received")
                .field("agent_url", &request.agent_url)
                .incidental("request_id", &request.request_id)
                .incidental("payload_bytes", request.payload.len().to_string()),
        );

        let remaining = deadline_at.saturating_duration_since(Instant::now());
        let (image, cache_outcome) = match self.inner.cache.resolve(&request.agent_url, remaining).await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                recorder.record(
                    Step::new("image_resolve_failed")
                        .field("error", e.kind())
                        .incidental("detail", e.to_string()),
                );
                return Err(e);
            }
        };
        recorder.record(
            Step::new("image_resolved")
                .field("cache", cache_outcome.to_string())
                .field("image", &image.repo_tag)
                .incidental("archive_bytes", image.size_bytes.to_string()),
        );

        let result = self
            .with_instance(request, recorder, &image, deadline_at)
            .await;
        self.inner.cache.release(&image.key);

        let response = result?;
        recorder.record(
            Step::new("completed").incidental("elapsed_ms", started.elapsed().as_millis().to_string()),
        );
        Ok(response)
    }

    async fn with_instance(
        &self,
        request: &ExecutionRequest,
        recorder: &mut ReceiptRecorder,
        image: &CachedImage,
        deadline_at: Instant,
    ) -> Result<AgentResponse> {
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        let lease = self.inner.pool.acquire(image, remaining).await?;
        recorder.record(
            Step::new("instance_acquired")
                .field("start", lease.start_mode().to_string())
                .incidental("port", lease.port().to_string()),
        );

        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            // Nothing was sent; the instance is still good.
            lease.release_ok();
            return Err(RunnerError::deadline("forward"));
        }
        recorder
            .record(Step::new("forwarded").incidental("timeout_ms", remaining.as_millis().to_string()));

        let url = format!("http://127.0.0.1:{}/", lease.port());
        let mut builder = self
            .inner
            .client
            .post(&url)
            .timeout(remaining)
            .body(request.payload.clone());
        if let Some(ct) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, ct.as_str());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let err = if e.is_timeout() {
                    RunnerError::deadline("forward")
                } else {
                    RunnerError::Forward(format!("forwarding to agent: {e}"))
                };
                // The agent was mid-request; its state is unknown.
                lease.release_failed().await;
                return Err(err);
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                let err = if e.is_timeout() {
                    RunnerError::deadline("forward")
                } else {
                    RunnerError::Forward(format!("reading agent response: {e}"))
                };
                lease.release_failed().await;
                return Err(err);
            }
        };

        if !status.is_success() {
            recorder.record(
                Step::new("container_error")
                    .field("status", status.as_u16().to_string())
                    .incidental("body_bytes", body.len().to_string()),
            );
            // The agent answered in protocol; the instance stays healthy.
            lease.release_ok();
            return Err(RunnerError::AgentStatus {
                status: status.as_u16(),
                body,
                content_type,
            });
        }

        recorder.record(
            Step::new("response_received")
                .field("status", status.as_u16().to_string())
                .incidental("body_bytes", body.len().to_string()),
        );
        lease.release_ok();
        Ok(AgentResponse { body, content_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::instance::InstancePool;
    use crate::ports::PortAllocator;
    use crate::testutil::{AgentBehavior, FakeAgent, FakeRuntime, ScriptedFetcher};
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn test_config(port_base: u16) -> EngineConfig {
        EngineConfig {
            cache_dir: std::env::temp_dir(),
            cache_max_bytes: 10 << 20,
            cache_max_entries: 16,
            port_range_start: port_base,
            port_range_size: 8,
            max_instances: 4,
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(60),
            readiness_timeout: Duration::from_secs(5),
            readiness_poll_interval: Duration::from_millis(20),
            default_deadline: Duration::from_secs(5),
            max_deadline: Duration::from_secs(30),
            container_runtime: None,
            receipts_url: None,
        }
    }

    struct Harness {
        router: ExecutionRouter,
        runtime: Arc<FakeRuntime>,
        pool: InstancePool,
    }

    fn harness(
        dir: &Path,
        port_base: u16,
        fetcher: Arc<ScriptedFetcher>,
        receipts_url: Option<String>,
    ) -> Harness {
        let config = test_config(port_base);
        let runtime = FakeRuntime::new();
        let cache = ImageCache::open(
            dir.to_path_buf(),
            config.cache_max_bytes,
            config.cache_max_entries,
            fetcher,
        )
        .unwrap();
        let ports = PortAllocator::new(config.port_range_start, config.port_range_size);
        let pool = InstancePool::new(runtime.clone(), cache.clone(), ports, config);
        let router = ExecutionRouter::new(cache, pool.clone(), ReceiptUploader::new(receipts_url));
        Harness {
            router,
            runtime,
            pool,
        }
    }

    fn request(id: &str, url: &str, deadline: Duration) -> ExecutionRequest {
        ExecutionRequest {
            request_id: id.to_string(),
            agent_url: url.to_string(),
            payload: b"\x01\x02payload".to_vec(),
            content_type: Some("application/octet-stream".to_string()),
            deadline,
        }
    }

    fn step_names(receipt: &Receipt) -> Vec<&str> {
        receipt.steps.iter().map(|s| s.name.as_str()).collect()
    }

    fn step<'a>(receipt: &'a Receipt, name: &str) -> &'a Step {
        receipt
            .steps
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("missing step {name}"))
    }

    #[tokio::test]
    async fn test_first_request_cold_path_records_all_steps() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 43000, Arc::new(ScriptedFetcher::new()), None);

        let (result, receipt) = h
            .router
            .execute(request("req-1", "http://example.com/a", Duration::from_secs(5)))
            .await;
        let response = result.unwrap();
        assert_eq!(response.body, b"ok");
        assert_eq!(receipt.outcome, Outcome::Ok);
        assert_eq!(
            step_names(&receipt),
            [
                "request_received",
                "image_resolved",
                "instance_acquired",
                "forwarded",
                "response_received",
                "completed",
            ]
        );
        assert_eq!(
            step(&receipt, "image_resolved").fields.get("cache"),
            Some(&"miss".to_string())
        );
        assert_eq!(
            step(&receipt, "instance_acquired").fields.get("start"),
            Some(&"cold".to_string())
        );
    }

    #[tokio::test]
    async fn test_second_request_is_hit_and_warm() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 43010, Arc::new(ScriptedFetcher::new()), None);

        let (result, _) = h
            .router
            .execute(request("req-1", "http://example.com/a", Duration::from_secs(5)))
            .await;
        result.unwrap();

        let (result, receipt) = h
            .router
            .execute(request("req-2", "http://example.com/a", Duration::from_secs(5)))
            .await;
        result.unwrap();
        assert_eq!(
            step(&receipt, "image_resolved").fields.get("cache"),
            Some(&"hit".to_string())
        );
        assert_eq!(
            step(&receipt, "instance_acquired").fields.get("start"),
            Some(&"warm".to_string())
        );
        assert_eq!(h.runtime.start_count(), 1);
    }

    // Steady-state receipts for the same input are semantically identical
    // even though request ids and timings differ.
    #[tokio::test]
    async fn test_warmed_receipts_are_semantically_equal() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 43020, Arc::new(ScriptedFetcher::new()), None);

        let mut receipts = Vec::new();
        for id in ["run-1", "run-2", "run-3"] {
            let (result, receipt) = h
                .router
                .execute(request(id, "http://example.com/a", Duration::from_secs(5)))
                .await;
            result.unwrap();
            receipts.push(receipt);
        }

        assert!(
            !receipts[0].semantic_eq(&receipts[1]),
            "cold and warm runs differ semantically"
        );
        assert!(receipts[1].semantic_eq(&receipts[2]));
    }

    #[tokio::test]
    async fn test_agent_error_status_preserves_body_and_keeps_instance() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 43030, Arc::new(ScriptedFetcher::new()), None);
        h.runtime
            .set_behavior(AgentBehavior::respond(500, b"boom".to_vec()));

        let (result, receipt) = h
            .router
            .execute(request("req-1", "http://example.com/a", Duration::from_secs(5)))
            .await;
        match result.unwrap_err() {
            RunnerError::AgentStatus { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, b"boom");
            }
            other => panic!("expected AgentStatus, got {other:?}"),
        }
        assert_eq!(receipt.outcome, Outcome::Error);
        assert_eq!(
            step(&receipt, "container_error").fields.get("status"),
            Some(&"500".to_string())
        );

        // A non-2xx answer is an agent-level result, not a broken
        // container; the next request reuses the same instance.
        h.runtime.set_behavior(AgentBehavior::respond(200, b"ok".to_vec()));
        let (result, receipt) = h
            .router
            .execute(request("req-2", "http://example.com/a", Duration::from_secs(5)))
            .await;
        result.unwrap();
        assert_eq!(
            step(&receipt, "instance_acquired").fields.get("start"),
            Some(&"warm".to_string())
        );
        assert_eq!(h.runtime.start_count(), 1);
        assert_eq!(h.runtime.stop_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_retires_instance() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 43040, Arc::new(ScriptedFetcher::new()), None);

        // Warm up, then make the agent hang up mid-request.
        let (result, _) = h
            .router
            .execute(request("req-1", "http://example.com/a", Duration::from_secs(5)))
            .await;
        result.unwrap();
        h.runtime.set_behavior(AgentBehavior::drop_connection());

        let (result, receipt) = h
            .router
            .execute(request("req-2", "http://example.com/a", Duration::from_secs(5)))
            .await;
        assert_eq!(result.unwrap_err().kind(), "forward");
        assert_eq!(receipt.outcome, Outcome::Error);
        assert_eq!(h.runtime.stop_count(), 1);
        assert_eq!(h.pool.stats().active_instances, 0);

        // The next request cold starts a fresh container.
        h.runtime.set_behavior(AgentBehavior::respond(200, b"ok".to_vec()));
        let (result, receipt) = h
            .router
            .execute(request("req-3", "http://example.com/a", Duration::from_secs(5)))
            .await;
        result.unwrap();
        assert_eq!(
            step(&receipt, "instance_acquired").fields.get("start"),
            Some(&"cold".to_string())
        );
        assert_eq!(h.runtime.start_count(), 2);
    }

    #[tokio::test]
    async fn test_resolve_failure_produces_failure_receipt() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new().failing_first(1));
        let h = harness(dir.path(), 43050, fetcher, None);

        let (result, receipt) = h
            .router
            .execute(request("req-1", "http://example.com/a", Duration::from_secs(5)))
            .await;
        assert_eq!(result.unwrap_err().kind(), "image_resolve");
        assert_eq!(receipt.outcome, Outcome::Error);
        assert_eq!(step_names(&receipt), ["request_received", "image_resolve_failed"]);
        assert_eq!(
            step(&receipt, "image_resolve_failed").fields.get("error"),
            Some(&"image_resolve".to_string())
        );
        assert_eq!(h.runtime.start_count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_during_forward_reports_stage_and_retires() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 43060, Arc::new(ScriptedFetcher::new()), None);

        // Warm up so the deadline can only expire inside the forward.
        let (result, _) = h
            .router
            .execute(request("req-1", "http://example.com/a", Duration::from_secs(5)))
            .await;
        result.unwrap();
        h.runtime.set_behavior(
            AgentBehavior::respond(200, b"late".to_vec()).with_delay(Duration::from_millis(600)),
        );

        let (result, receipt) = h
            .router
            .execute(request("req-2", "http://example.com/a", Duration::from_millis(250)))
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), "deadline_exceeded");
        assert!(err.to_string().contains("forward"));
        let names = step_names(&receipt);
        assert!(names.contains(&"forwarded"));
        assert!(!names.contains(&"response_received"));

        // A request cut off mid-forward poisons the container.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.runtime.stop_count(), 1);
        assert_eq!(h.pool.stats().active_instances, 0);
    }

    #[tokio::test]
    async fn test_receipts_are_published_to_collector() {
        let dir = tempfile::tempdir().unwrap();
        let collector = FakeAgent::spawn(AgentBehavior::respond(204, Vec::new())).await;
        let h = harness(
            dir.path(),
            43070,
            Arc::new(ScriptedFetcher::new()),
            Some(collector.url()),
        );

        let (result, _) = h
            .router
            .execute(request("req-1", "http://example.com/a", Duration::from_secs(5)))
            .await;
        result.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(collector.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_content_type_passes_through_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 43080, Arc::new(ScriptedFetcher::new()), None);
        h.runtime.set_behavior(
            AgentBehavior::respond(200, b"\x00\x01\x02".to_vec())
                .with_content_type("application/x-agent-result"),
        );

        let (result, _) = h
            .router
            .execute(request("req-1", "http://example.com/a", Duration::from_secs(5)))
            .await;
        let response = result.unwrap();
        assert_eq!(response.body, b"\x00\x01\x02");
        assert_eq!(
            response.content_type.as_deref(),
            Some("application/x-agent-result")
        );
    }

    // Four requests race for the same agent; the agent itself must never
    // see more than one of them at a time.
    #[tokio::test]
    async fn test_concurrent_requests_to_one_agent_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), 43090, Arc::new(ScriptedFetcher::new()), None);
        h.runtime.set_behavior(
            AgentBehavior::respond(200, b"ok".to_vec()).with_delay(Duration::from_millis(40)),
        );

        let (a, b, c, d) = tokio::join!(
            h.router
                .execute(request("req-1", "http://example.com/a", Duration::from_secs(5))),
            h.router
                .execute(request("req-2", "http://example.com/a", Duration::from_secs(5))),
            h.router
                .execute(request("req-3", "http://example.com/a", Duration::from_secs(5))),
            h.router
                .execute(request("req-4", "http://example.com/a", Duration::from_secs(5))),
        );
        let receipts = [a, b, c, d].map(|(result, receipt)| {
            assert_eq!(result.unwrap().body, b"ok");
            receipt
        });

        // One caller cold starts the container, the rest queue behind it.
        let cold_starts = receipts
            .iter()
            .filter(|r| {
                step(r, "instance_acquired").fields.get("start") == Some(&"cold".to_string())
            })
            .count();
        assert_eq!(cold_starts, 1);
        assert_eq!(h.runtime.start_count(), 1);
        assert_eq!(h.runtime.total_posts(), 4);
        assert_eq!(h.runtime.max_in_flight(), 1, "forwards overlapped at the agent");
    }
}
