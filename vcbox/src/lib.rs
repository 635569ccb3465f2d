//! vcbox: lifecycle management for VM-isolated sandboxes and the containers
//! they host.
//!
//! State lives in JSON files under two roots (see [`StoreLayout`]), guarded by
//! one advisory lock per sandbox. Each command rehydrates a [`Sandbox`],
//! drives it through the guest [`Agent`](agent::Agent) and flushes it back.

pub mod agent;
pub mod lock;
pub mod model;
pub mod runtime;
pub mod sandbox;
pub mod store;

pub use agent::{AgentConfig, AgentKind, IoStream};
pub use runtime::{ContainerStatus, RuntimeOptions, SandboxStatus, Target, VcRuntime};
pub use sandbox::Sandbox;
pub use store::{ResourceStore, ResourceValue};

pub use vcbox_shared::errors::{AgentError, AgentResult, VcError, VcResult};
pub use vcbox_shared::layout::{ResourceKind, ResourceScope, StorageRoot, StoreLayout};
