//! Session lifecycle: one engine connection per account, its state machine,
//! and the registry that keeps sessions unique per account id.

pub mod lifecycle;
pub mod reconnect;
pub mod registry;
pub mod types;

pub use lifecycle::{Session, SessionContext};
pub use reconnect::ReconnectPolicy;
pub use registry::{RestoreReport, SessionRegistry};
pub use types::*;
