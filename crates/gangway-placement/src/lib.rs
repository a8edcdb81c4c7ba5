//! Gangway placement: capacity oracle interface and gang evaluation.
//!
//! This crate decides *whether* and *where* a whole group fits. It does
//! NOT bind anything (that's the reservation manager in
//! `gangway-scheduler`). It queries a [`CapacityOracle`] and produces
//! plans that the scheduler commits atomically.
//!
//! # Components
//!
//! - **`oracle`**: Capacity Oracle trait, candidate nodes, reservation tokens
//! - **`inventory`**: In-memory oracle over a static node table
//! - **`evaluator`**: Gang Evaluator (all-members feasibility + plan search)
//! - **`scorer`**: Plan ranking (locality, residual balance)
//! - **`convert`**: Type conversions from configuration types

pub mod convert;
pub mod evaluator;
pub mod inventory;
pub mod oracle;
pub mod scorer;

pub use convert::{node_config_to_inventory, oracle_from_config};
pub use evaluator::{EvaluateError, Evaluation, GangEvaluator, Heuristic, Placement, Plan};
pub use inventory::{InMemoryOracle, InventoryNode};
pub use oracle::{CandidateNode, CapacityOracle, OracleError, ReservationToken};
pub use scorer::{PlanScore, residual_imbalance, utilization};
