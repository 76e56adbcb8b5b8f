//! Hybrid explore/replay agent for recurring browser workflows.
//!
//! A workflow is first solved by exploration: decision providers look at
//! the page and propose one action at a time. A successful exploration is
//! compiled into a [`Route`], a parameterised action sequence that later
//! runs replay without any provider calls. Routes that stop working fall
//! back to exploration and are relearned.

pub mod compiler;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod provider;
pub mod replayer;
pub mod store;
pub mod types;

pub use compiler::RouteCompiler;
pub use config::AgentConfig;
pub use error::{AgentError, ErrorKind};
pub use events::AgentEvent;
pub use executor::{ActionExecutor, SessionFactory};
pub use orchestrator::{AgentOrchestrator, RunSlot};
pub use provider::{ProviderChain, VisionDecisionProvider};
pub use replayer::{Replay, RouteReplayer, StepOutcome};
pub use store::{JsonRouteStore, MemoryRouteStore, RouteStore};
pub use types::{
    Action, ActionProposal, ActionResult, ActionType, AgentState, Binding, Check, Decision,
    ExplorationTrace, HistoryEntry, ObservedState, Point, ROUTE_SCHEMA_VERSION, Route, RouteStep,
    RunFailure, RunMode, RunReport, RunStatus, StepRef, Task, TraceEntry, VerifyCondition,
};
