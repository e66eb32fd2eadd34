//! Server node composition.
//!
//! Wires together the engine, the embedding gateway and the HTTP transport.

use crate::config::ServerConfig;
use crate::embedding::{EmbeddingGateway, OllamaGateway};
use crate::http::{HttpServer, HttpServerState};
use crate::metrics::PrometheusMeter;
use ember_engine::Engine;
use std::net::SocketAddr;
use std::sync::Arc;

/// Server node - main composition root.
///
/// Holds all components and manages their lifecycle.
pub struct Node {
    config: ServerConfig,

    engine: Arc<Engine>,

    /// Text-to-vector service used by insert and search
    gateway: Arc<dyn EmbeddingGateway>,

    meter: Arc<PrometheusMeter>,

    /// HTTP REST API server (created on start)
    http_server: Option<HttpServer>,
}

impl Node {
    /// Create a node that embeds text through Ollama.
    pub async fn new(config: ServerConfig) -> Result<Self, NodeError> {
        let gateway = OllamaGateway::new(&config.embedding, config.dimensions)
            .map_err(|e| NodeError::Initialization(e.to_string()))?;
        tracing::info!(
            "Embedding model {} at {}",
            config.embedding.model,
            config.embedding.base_url
        );

        Self::with_gateway(config, Arc::new(gateway)).await
    }

    /// Create a node with a caller-supplied embedding gateway.
    ///
    /// Opens the record store and loads or rebuilds the index.
    pub async fn with_gateway(
        config: ServerConfig,
        gateway: Arc<dyn EmbeddingGateway>,
    ) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            NodeError::Initialization(format!("Failed to create data dir: {}", e))
        })?;

        let meter = Arc::new(PrometheusMeter::new());
        let engine_config = config.engine_config();
        let engine_meter = meter.clone();

        // Recovery and index rebuild do blocking file I/O.
        let engine = tokio::task::spawn_blocking(move || {
            Engine::open_with_meter(engine_config, engine_meter)
        })
        .await
        .map_err(|e| NodeError::Initialization(format!("Engine open task failed: {}", e)))?
        .map_err(|e| NodeError::Initialization(format!("Failed to open engine: {}", e)))?;

        let stats = engine.stats();
        tracing::info!(
            records = stats.records,
            index_nodes = stats.index_nodes,
            "Engine opened at {}",
            config.data_dir.display()
        );

        Ok(Self {
            config,
            engine: Arc::new(engine),
            gateway,
            meter,
            http_server: None,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Address the HTTP server is listening on, once started.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_server.as_ref().and_then(|s| s.local_addr())
    }

    /// Start the HTTP server.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        let addr: SocketAddr = self
            .config
            .http_addr
            .parse()
            .map_err(|e| NodeError::Startup(format!("Invalid http_addr: {}", e)))?;

        let state = HttpServerState::new(
            self.engine.clone(),
            self.gateway.clone(),
            self.meter.clone(),
            self.config.request_timeout(),
        );

        let mut server = HttpServer::new(addr, state);
        server
            .start()
            .await
            .map_err(|e| NodeError::Startup(e.to_string()))?;
        self.http_server = Some(server);

        Ok(())
    }

    /// Stop serving, then drain indexing, persist the index and sync the log.
    pub async fn shutdown(mut self) -> Result<(), NodeError> {
        if let Some(server) = self.http_server.take() {
            server
                .shutdown()
                .await
                .map_err(|e| NodeError::Shutdown(e.to_string()))?;
        }

        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.close())
            .await
            .map_err(|e| NodeError::Shutdown(format!("Engine close task failed: {}", e)))?
            .map_err(|e| NodeError::Shutdown(format!("Failed to close engine: {}", e)))?;

        tracing::info!("Node shutdown complete");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}
