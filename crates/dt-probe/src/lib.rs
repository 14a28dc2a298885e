pub mod discovery;
pub mod probe;
pub mod status;

pub use discovery::{DiscoveryReport, Scanner};
pub use probe::{
    Confidence, FailureKind, HttpProber, ProbeError, ProbeMode, ProbeResult, Prober, USER_AGENT,
};
pub use status::{StatusAggregate, StatusReport, StatusReporter};
