//! Synchronization primitives for the execution-context kernel.

mod event;
mod exec_token;
mod gate;
mod parker;

pub use event::Event;
pub use exec_token::ExecToken;
pub use gate::RwGate;
pub use parker::Parker;
