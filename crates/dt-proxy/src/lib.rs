pub mod handler;
pub mod logging;
pub mod resolver;

pub use handler::{ForwardError, Forwarder, TUNNEL_SOURCE};
pub use logging::{AccessLogEntry, AccessLogger, OptionalAccessLogger};
pub use resolver::{CachedTarget, TargetResolver};
