//! Worker-process side: admission gate and control socket server.

pub mod gate;
pub mod server;

pub use gate::*;
pub use server::*;
