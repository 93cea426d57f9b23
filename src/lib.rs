#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! Multi-account WhatsApp session host.
//!
//! One [`session::Session`] per account, kept unique by the
//! [`session::SessionRegistry`], persisted through the
//! [`store::CredentialStore`] and driven by an external
//! [`engine::ProtocolEngine`]. Outbound delivery goes through
//! [`dispatch::MessageDispatcher`].

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod health;
pub mod pairing;
pub mod session;
pub mod store;

pub use config::Config;
pub use dispatch::{Attachment, DeliveryReport, MessageDispatcher, OutboundMessage};
pub use error::SessionError;
pub use session::{Session, SessionId, SessionRegistry, SessionSnapshot, SessionState};
pub use store::{CredentialStore, Credentials, KeyCategory};
