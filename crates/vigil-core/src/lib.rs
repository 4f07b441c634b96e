//! vigil-core — shared types, wire formats, and peer identity model.
//! All other Vigil crates depend on this one.

pub mod config;
pub mod identity;
pub mod message;
pub mod wire;

pub use identity::{IdentityRegistry, MalformedIdentityError, PeerAddress, PeerIdentity};
pub use message::{MessageError, PeerMessage};
