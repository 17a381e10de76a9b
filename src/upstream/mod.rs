pub mod backend;
pub mod circuit_breaker;
pub mod fallback;

pub use backend::{Backend, HttpBackend};
pub use circuit_breaker::{
    BreakerPolicy, BreakerSnapshot, BreakerState, CallOutcome, CallPermit, CircuitBreaker,
    CircuitBreakerRegistry,
};
pub use fallback::{Fallback, FallbackClient, FALLBACK_REASON_HEADER};
