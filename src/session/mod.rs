use std::fmt;

pub mod client;
pub mod outbox;
pub mod token;

pub use client::run_client;
pub use outbox::Outbox;

/// Process-local connection identifier, printed in hexadecimal in logs and
/// used by the hub to tell participants apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
