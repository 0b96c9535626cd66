pub mod circuit_breaker;
pub mod classify;
pub mod retry;
pub mod router;

pub use circuit_breaker::{CircuitBreaker, CircuitMetrics, CircuitState};
pub use classify::{classify, recovery_action};
pub use retry::{compute_delay, Retrier, RetryResult};
pub use router::{retry_count, ErrorRouter};
