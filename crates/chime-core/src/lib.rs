//! chime-core: the hub library of the Chime voice assistant.
//!
//! Holds the pipeline orchestrator, the intent resolution engine, the Core
//! process supervisor, and the bus plumbing they share. The `chime-hub`
//! binary wires these together; Cores themselves are separate processes
//! speaking JSON over the bus.

pub mod bus;
pub mod config;
pub mod error;
pub mod intent;
pub mod message;
pub mod orchestrator;
pub mod session;
pub mod supervisor;
pub mod topics;

pub use bus::{BusHandle, BusMessage, LocalBus, MessageBus};
pub use config::{BusConfig, HubConfig, OrchestratorSection};
pub use error::{HubError, HubResult};
pub use intent::{Collection, Intent, IntentRegistry, MatchResult, Resolution};
pub use orchestrator::{CueSounds, Orchestrator};
pub use session::{Session, Stage};
pub use supervisor::{CoreIdentity, Supervisor};
pub use topics::TopicSpace;
