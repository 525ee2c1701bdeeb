//! Engine behind the agent runner: image cache, container lifecycle, and
//! the per-request execution path.

pub mod cache;
pub mod config;
pub mod fetch;
pub mod instance;
pub mod ports;
pub mod receipt;
pub mod router;
pub mod runtime;

#[cfg(test)]
mod testutil;

use std::sync::Arc;

use runner_common::Result;

pub use cache::{CacheOutcome, CacheStatsSnapshot, CachedImage, ImageCache};
pub use config::EngineConfig;
pub use fetch::{FetchedArchive, HttpFetcher, ImageFetcher};
pub use instance::{InstancePool, InstanceState, Lease, PoolStatsSnapshot, StartMode};
pub use ports::PortAllocator;
pub use receipt::{ReceiptRecorder, ReceiptUploader};
pub use router::ExecutionRouter;
pub use runtime::{
    connect_docker, ContainerRuntime, DockerRuntime, LaunchSpec, StartedContainer, AGENT_PORT,
};

/// Fully wired engine: cache, instance pool, and router sharing one
/// configuration.
pub struct Engine {
    pub cache: ImageCache,
    pub pool: InstancePool,
    pub router: ExecutionRouter,
    pub config: EngineConfig,
}

impl Engine {
    /// Builds an engine around the given fetcher and container runtime.
    /// Must be called from within a tokio runtime; the pool spawns its
    /// maintenance task on creation.
    pub fn new(
        config: EngineConfig,
        fetcher: Arc<dyn ImageFetcher>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Engine> {
        let cache = ImageCache::open(
            config.cache_dir.clone(),
            config.cache_max_bytes,
            config.cache_max_entries,
            fetcher,
        )?;
        let ports = PortAllocator::new(config.port_range_start, config.port_range_size);
        let pool = InstancePool::new(runtime, cache.clone(), ports, config.clone());
        let uploader = ReceiptUploader::new(config.receipts_url.clone());
        let router = ExecutionRouter::new(cache.clone(), pool.clone(), uploader);
        Ok(Engine {
            cache,
            pool,
            router,
            config,
        })
    }

    /// Engine wired to the local Docker daemon with the HTTP fetcher.
    pub fn with_docker(config: EngineConfig) -> Result<Engine> {
        let docker = connect_docker()?;
        Engine::new(
            config,
            Arc::new(HttpFetcher::new()),
            Arc::new(DockerRuntime::new(docker)),
        )
    }
}
