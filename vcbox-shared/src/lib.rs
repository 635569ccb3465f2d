//! Types shared between the vcbox runtime and its command-line front end.

pub mod errors;
pub mod layout;

pub use errors::{AgentError, AgentResult, VcError, VcResult};
pub use layout::{ResourceKind, ResourceScope, StorageRoot, StoreLayout};
