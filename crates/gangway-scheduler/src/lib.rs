//! gangway-scheduler: all-or-nothing scheduling of request groups.
//!
//! Groups of placement requests are admitted, evaluated and bound as a
//! unit. Either every required member of a group is bound, or none is.
//!
//! # Architecture
//!
//! ```text
//! GangScheduler
//!   ├── GroupRegistry (groups + members, phase machine, StateStore)
//!   ├── QueueController per queue
//!   │     ├── QueueLease (one active loop per queue)
//!   │     ├── CircuitBreaker (oracle outages)
//!   │     ├── AdmissionQueue (priority, then age)
//!   │     ├── GangEvaluator (from gangway-placement)
//!   │     └── ReservationManager (node-locked two-phase commit)
//!   ├── TimeoutSupervisor (periodic sweep, retry policy)
//!   ├── HierarchyResolver (parent/child visibility)
//!   └── EventRecorder (event log + broadcast)
//! ```

pub mod breaker;
pub mod controller;
pub mod error;
pub mod events;
pub mod hierarchy;
pub mod lease;
pub mod queue;
pub mod registry;
pub mod reservation;
pub mod scheduler;
pub mod status;
pub mod supervisor;

pub use breaker::{BreakerState, CircuitBreaker};
pub use controller::{CycleOutcome, CycleReport, QueueController};
pub use error::{SchedulerError, SchedulerResult};
pub use events::EventRecorder;
pub use hierarchy::HierarchyResolver;
pub use lease::QueueLease;
pub use queue::AdmissionQueue;
pub use registry::{GroupFilter, GroupRegistry};
pub use reservation::{ReservationManager, RestoreReport};
pub use scheduler::{DEFAULT_QUEUE, GangScheduler};
pub use supervisor::{SweepReport, TimeoutSupervisor};
