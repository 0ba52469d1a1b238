//! Concurrent scheduling and termination detection for exploration sessions.
//!
//! Worker pools of pluggable task kinds pull work from typed queues and push
//! new work back. A single outstanding-work counter detects the instant
//! nothing is left anywhere in the pipeline; a time limit or a stop event can
//! end the session earlier. The [`orchestrator::Orchestrator`] drives the
//! lifecycle and announces each phase on the [`bus::EventBus`].

pub mod bus;
pub mod config;
pub mod error;
pub mod instrument;
pub mod limits;
pub mod observers;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod report;
pub mod session;
pub mod termination;

pub use bus::{Event, EventBus, TickStatus, Topic};
pub use config::{SessionConfig, Settings, StrategyConfig};
pub use error::{Cancelled, ConfigError, PoolError, SessionError, TaskError};
pub use instrument::{CodeCache, CodeLoader, CodeVariant};
pub use limits::{TimeLimit, Watchdog};
pub use orchestrator::{Orchestrator, RunState, SessionBuilder};
pub use pool::{RestartPolicy, Role, Task, TaskFactory, TaskKind, TaskPool, ThreadBounds, WorkerContext};
pub use queue::{CancelToken, ModelLane, QueueLengths, WorkQueueSet};
pub use registry::Registry;
pub use report::{PropertyValue, Reportable, ReportSection, SessionReport};
pub use session::SessionHandle;
pub use termination::{StopReason, Termination, WaitOutcome};
