//! Worker-manager candidate pool.
//!
//! - `server` - Candidate records and connect types
//! - `selector` - Selection, failure/success reporting and timeout detection

pub mod selector;
pub mod server;

pub use selector::WorkerManagerSelector;
pub use server::{ConnectType, Server};
