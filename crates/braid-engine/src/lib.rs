//! Generation engine: the per-session orchestrator, the replayable stream
//! broker, sub-agent delegation, approval gating and tool execution.

pub mod approval;
pub mod broker;
pub mod config;
pub mod error;
pub mod http_producer;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod subagent;
pub mod thread_cache;
pub mod tools;

pub use approval::{ApprovalGateway, Decision};
pub use broker::{ReadHandle, StreamBroker, WriteHandle};
pub use config::EngineConfig;
pub use error::{BrokerError, EngineError};
pub use http_producer::HttpProducer;
pub use orchestrator::{
    AckStatus, AgentOrchestrator, BeginRequest, GenerationHandle, GenerationOutcome,
    GenerationPhase, GenerationState,
};
pub use registry::{ToolFilter, ToolRegistry};
pub use subagent::{SubAgentDispatcher, SubAgentRegistry, SubAgentSpec};
pub use thread_cache::ToolThreadCache;
