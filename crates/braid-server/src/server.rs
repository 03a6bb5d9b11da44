use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use braid_core::producer::Producer;
use braid_core::settings::BraidSettings;
use braid_engine::{
    AgentOrchestrator, ApprovalGateway, EngineConfig, StreamBroker, SubAgentDispatcher,
    SubAgentRegistry, ToolRegistry, ToolThreadCache,
};
use braid_store::{Database, MessageTree};

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How often finalized streams and idle thread bindings are swept.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9091,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &BraidSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            sweep_interval: settings.broker.sweep_interval(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: AgentOrchestrator,
    pub threads: ToolThreadCache,
}

impl AppState {
    /// Wire the engine components over one database.
    pub fn assemble(
        db: Database,
        settings: &BraidSettings,
        producer: Arc<dyn Producer>,
        tools: Arc<ToolRegistry>,
        agents: SubAgentRegistry,
        threads: ToolThreadCache,
    ) -> Self {
        let config = EngineConfig::from_settings(settings);
        let tree = Arc::new(MessageTree::new(db));
        let broker = StreamBroker::new(&settings.broker);
        let gateway = ApprovalGateway::new(config.approval_timeout);
        let dispatcher = Arc::new(SubAgentDispatcher::new(
            agents,
            Arc::clone(&tree),
            gateway.clone(),
            config.clone(),
        ));
        let orchestrator =
            AgentOrchestrator::new(tree, broker, gateway, dispatcher, producer, tools, config);
        Self { orchestrator, threads }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions/{session_id}/generations", post(handlers::begin_generation))
        .route("/sessions/{session_id}/stream", get(handlers::attach_stream))
        .route("/sessions/{session_id}/stop", post(handlers::stop_generation))
        .route("/sessions/{session_id}/state", get(handlers::generation_state))
        .route("/sessions/{session_id}/messages", get(handlers::list_messages))
        .route("/sessions/{session_id}/preface", put(handlers::set_preface))
        .route("/tools/{tool_call_id}/ack", post(handlers::ack_tool))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Periodically dispose finalized streams past their grace period and
/// evict idle tool thread bindings.
pub fn start_sweep_task(
    state: AppState,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let disposed = state.orchestrator.broker().sweep_expired();
                    state.threads.sweep();
                    if disposed > 0 {
                        tracing::debug!(disposed, "swept finalized streams");
                    }
                }
            }
        }
    })
}

/// Bind and serve. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let sweeper = start_sweep_task(state.clone(), config.sweep_interval, shutdown.clone());

    let router = build_router(state.clone());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "braid server started");

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        state,
        shutdown,
        server,
        sweeper,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    state: AppState,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop running generations and begin graceful shutdown.
    pub fn shutdown(&self) {
        let stopped = self.state.orchestrator.stop_all();
        tracing::info!(stopped, "shutting down");
        self.shutdown.cancel();
    }

    pub async fn wait(self) {
        if let Err(e) = self.server.await {
            tracing::error!(error = %e, "server task failed");
        }
        if let Err(e) = self.sweeper.await {
            tracing::error!(error = %e, "sweep task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::mock::{MockProducer, MockResponse};
    use braid_core::stream::Fragment;
    use serde_json::{json, Value};

    fn state(responses: Vec<MockResponse>) -> AppState {
        let db = Database::in_memory().unwrap();
        let settings = BraidSettings::default();
        let threads = ToolThreadCache::from_settings(&settings.thread_cache);
        AppState::assemble(
            db,
            &settings,
            Arc::new(MockProducer::new(responses)),
            Arc::new(ToolRegistry::new()),
            SubAgentRegistry::new(),
            threads,
        )
    }

    async fn serve(responses: Vec<MockResponse>) -> (ServerHandle, String) {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, state(responses)).await.unwrap();
        let base = format!("http://127.0.0.1:{}", handle.port);
        (handle, base)
    }

    fn data_frames(body: &str) -> Vec<Value> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .filter_map(|data| serde_json::from_str(data).ok())
            .collect()
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (handle, base) = serve(Vec::new()).await;
        assert!(handle.port > 0);

        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn generation_streams_and_persists() {
        let (_handle, base) = serve(vec![MockResponse::stream_text("Hi")]).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/sessions/S1/generations"))
            .json(&json!({"text": "hi", "messageId": "u1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let assistant_id = resp.headers()["x-assistant-message-id"].to_str().unwrap().to_string();
        let frames = data_frames(&resp.text().await.unwrap());
        let kinds: Vec<&str> = frames.iter().filter_map(|f| f["type"].as_str()).collect();
        assert_eq!(kinds, vec!["start", "text-delta", "finish"]);
        assert_eq!(frames[0]["messageId"], assistant_id.as_str());

        // The node is sealed just before `finish` is buffered.
        let messages: Vec<Value> = client
            .get(format!("{base}/sessions/S1/messages"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["id"], "u1");
        assert_eq!(messages[1]["id"], assistant_id.as_str());
        assert_eq!(messages[1]["parentId"], "u1");
        assert_eq!(messages[1]["parts"][0]["text"], "Hi");
    }

    #[tokio::test]
    async fn follower_replays_running_generation() {
        let (_handle, base) =
            serve(vec![MockResponse::Hang(vec![Fragment::text("t0", "wait")])]).await;
        let client = reqwest::Client::new();
        let _first = client
            .post(format!("{base}/sessions/S1/generations"))
            .json(&json!({"text": "hi"}))
            .send()
            .await
            .unwrap();

        let follower = client
            .get(format!("{base}/sessions/S1/stream?subscriberId=f1"))
            .send()
            .await
            .unwrap();
        assert_eq!(follower.status(), 200);

        let duplicate = client
            .get(format!("{base}/sessions/S1/stream?subscriberId=f1"))
            .send()
            .await
            .unwrap();
        assert_eq!(duplicate.status(), 204);

        client.post(format!("{base}/sessions/S1/stop")).send().await.unwrap();
        let frames = data_frames(&follower.text().await.unwrap());
        let kinds: Vec<&str> = frames.iter().filter_map(|f| f["type"].as_str()).collect();
        assert_eq!(kinds, vec!["start", "text-delta"]);

        let missing = client
            .get(format!("{base}/sessions/nobody/stream"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 204);
    }

    #[tokio::test]
    async fn second_generation_conflicts_until_stopped() {
        let (_handle, base) =
            serve(vec![MockResponse::Hang(vec![Fragment::text("t0", "wait")])]).await;
        let client = reqwest::Client::new();

        let first = client
            .post(format!("{base}/sessions/S1/generations"))
            .json(&json!({"text": "one"}))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), 200);

        let second = client
            .post(format!("{base}/sessions/S1/generations"))
            .json(&json!({"text": "two"}))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), 409);
        let err: Value = second.json().await.unwrap();
        assert_eq!(err["code"], "conflict");

        let state: Value = client
            .get(format!("{base}/sessions/S1/state"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(state["phase"], "running");
        assert_eq!(state["framePath"], json!(["master"]));

        let stopped: Value = client
            .post(format!("{base}/sessions/S1/stop"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stopped["stopped"], true);

        // The aborted stream ends without a finish chunk.
        let frames = data_frames(&first.text().await.unwrap());
        assert!(frames.iter().all(|f| f["type"] != "finish"));
    }

    #[tokio::test]
    async fn bad_requests_and_acks() {
        let (_handle, base) = serve(Vec::new()).await;
        let client = reqwest::Client::new();

        let empty = client
            .post(format!("{base}/sessions/S1/generations"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), 400);

        let missing_parent = client
            .post(format!("{base}/sessions/S1/generations"))
            .json(&json!({"text": "hi", "parentMessageId": "ghost"}))
            .send()
            .await
            .unwrap();
        assert_eq!(missing_parent.status(), 404);

        let ack = client
            .post(format!("{base}/tools/nobody/ack"))
            .json(&json!({"status": "approved"}))
            .send()
            .await
            .unwrap();
        assert_eq!(ack.status(), 204);

        let stopped: Value = client
            .post(format!("{base}/sessions/S1/stop"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stopped["stopped"], false);

        let state = client.get(format!("{base}/sessions/idle/state")).send().await.unwrap();
        assert_eq!(state.status(), 404);
    }

    #[tokio::test]
    async fn preface_is_served_with_messages() {
        let (_handle, base) = serve(vec![MockResponse::stream_text("ok")]).await;
        let client = reqwest::Client::new();

        let put = client
            .put(format!("{base}/sessions/S1/preface"))
            .json(&json!({"preface": "Be brief."}))
            .send()
            .await
            .unwrap();
        assert_eq!(put.status(), 204);

        client
            .post(format!("{base}/sessions/S1/generations"))
            .json(&json!({"text": "hi"}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        let messages: Vec<Value> = client
            .get(format!("{base}/sessions/S1/messages"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["id"], "preface");
        assert_eq!(messages[0]["metadata"]["synthetic"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let task = start_sweep_task(state(Vec::new()), Duration::from_secs(30), cancel.clone());
        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        task.await.unwrap();
    }
}
