//! Failure isolation for external dependencies

mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitHealth, CircuitState, Permit};
