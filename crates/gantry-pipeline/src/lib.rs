//! Pipeline execution engine, node handlers, validation, and edge selection.
//!
//! This crate implements the core Gantry pipeline runner: DOT graph
//! transforms and validation, the condition expression language, handler
//! dispatch, edge selection, retry policies, checkpoint/resume, parallel
//! fan-out, and sub-pipeline composition.

pub mod backend;
pub mod checkpoint;
pub mod condition;
pub mod edge_selection;
pub mod engine;
pub mod events;
pub mod goal_gate;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod interviewer;
pub mod retry;
pub mod run;
pub mod transforms;
pub mod validation;

pub use backend::{Backend, BackendResult, ScriptedBackend, SimulationBackend};
pub use checkpoint::{
    clear_checkpoint, load_checkpoint, save_checkpoint, write_atomic, CheckpointRecord,
};
pub use condition::{evaluate, parse_condition, CmpOp, Expr};
pub use edge_selection::{select_edge, select_fail_route, select_fanout, FailRoute};
pub use engine::{load_graph, Engine, EngineConfig, PipelineStatus, RunReport};
pub use events::{EngineEvent, EventEmitter, EventEnvelope, EVENT_BUFFER};
pub use goal_gate::{check_goal_gates, GoalGateResult};
pub use graph::{Edge, EdgeKind, Graph, Node};
pub use handler::{
    default_registry, default_registry_with_interviewer, DecisionHandler, DynHandler, ExitHandler,
    HandlerRegistry, NodeHandler, StartHandler,
};
pub use handlers::{CodergenHandler, ParallelHandler, SubpipelineHandler, WaitHumanHandler};
pub use interviewer::{
    Answer, AutoApproveInterviewer, ChannelInterviewer, ConsoleInterviewer, Interviewer, Question,
    RecordingInterviewer,
};
pub use retry::{Jitter, RetryPolicy};
pub use run::RunContext;
pub use transforms::{expand_variables, Transform, TransformRegistry};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
