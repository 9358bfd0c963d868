pub mod config;
pub mod engine;
pub mod identity;
pub mod media;
pub mod presence;
pub mod reconnect;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use config::SessionConfig;
pub use identity::SessionIdentity;
pub use session::{SessionDeps, SessionEvent, SessionHandle, SessionSnapshot};

#[cfg(test)]
mod tests;
