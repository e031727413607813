//! Rate-limited, budget-aware documentation migration.
//!
//! A [`MigrationPlan`](plan::MigrationPlan) is executed by the
//! [`MigrationExecutor`](executor::MigrationExecutor) through a priority
//! [`RequestQueue`](queue::RequestQueue) gated by a dual token-bucket
//! [`RateLimiter`](rate_limiter::RateLimiter). Spend is checked against a
//! ceiling by the [`CostTracker`](cost::CostTracker), progress is persisted by
//! the [`WorkflowStateManager`](state::WorkflowStateManager) and concurrent
//! runs are excluded by the [`LockManager`](lock::LockManager).

pub mod anthropic;
pub mod cli;
pub mod config;
pub mod cost;
pub mod error;
pub mod executor;
pub mod lock;
pub mod orchestrator;
pub mod plan;
pub mod queue;
pub mod rate_limiter;
pub mod state;
pub mod ui;
pub mod worker;

pub use error::DocforgeError;
