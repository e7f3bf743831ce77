// src/ssh/mod.rs
//! SSH Transport (C2, spec §4.2).

mod transport;

pub use transport::{CommandRunner, CommandResult, SshTransport};
