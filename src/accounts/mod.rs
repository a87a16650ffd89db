//! Account pool: capacity tracking, circuit breaking, and pluggable
//! selection over each organization's provisioned accounts.

mod breaker;
mod capacity;
mod pool;
mod strategy;

pub use breaker::{CircuitBreaker, CircuitState, CircuitTransition};
pub use capacity::{AccountLoad, CapacityTracker};
pub use pool::{AccountPoolService, RecordOutcome};
pub use strategy::{
    AccountCandidate, LeastLoaded, Random, RoundRobin, SelectionRequest, SelectionStrategy,
    StrategyRegistry, Weighted,
};
