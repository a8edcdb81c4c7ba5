//! gangway-core: configuration and time primitives shared by every
//! gangway crate.

pub mod clock;
pub mod config;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ControllerConfig, GangwayConfig, NodeConfig, OracleConfig, QueueConfig, RetryConfig,
    TimeoutAction,
};
