//! Pluggable policies: host selection, retry decisions and reconnection
//! schedules

pub mod load_balancing;
pub mod reconnection;
pub mod retry;

pub use load_balancing::{LoadBalancingPolicy, QueryPlan, RoundRobinPolicy};
pub use reconnection::{
    ConstantReconnectionPolicy, ExponentialReconnectionPolicy, ReconnectionPolicy,
    ReconnectionSchedule,
};
pub use retry::{
    DefaultRetryPolicy, DowngradingConsistencyRetryPolicy, FallthroughRetryPolicy,
    LoggingRetryPolicy, RetryDecision, RetryPolicy,
};
