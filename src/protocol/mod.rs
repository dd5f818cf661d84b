// ABOUTME: Protocol implementation for the Carabiner daemon connection
// ABOUTME: Provides outbound command encoding and inbound stream parsing

mod messages;
mod parser;

pub use messages::{Command, Event, QUANTUM};
pub use parser::decode;
