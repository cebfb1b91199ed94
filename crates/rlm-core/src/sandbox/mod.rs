//! Sandbox: isolated execution of model-generated snippets.
//!
//! # Modules
//!
//! - [`executor`]: `Executor` / `ExecutorFactory` traits, `ExecutionOutcome`
//! - [`pool`]    : `ExecutorPool` and the scoped `ExecutorLease`
//! - [`process`] : persistent Python driver in a container or local process
//! - [`security`]: `SecurityConfig` forwarded opaquely to the runtime
//! - [`error`]   : `SandboxError` / `PoolError`

pub mod error;
pub mod executor;
pub mod pool;
pub mod process;
pub mod security;

pub use error::{PoolError, PoolResult, SandboxError, SandboxResult};
pub use executor::{
    extract_final_answer, truncate_output, ExecutionOutcome, ExecutionStatus, Executor,
    ExecutorFactory, NoSubcalls, SubcallHandler, SubcallRequest, FINAL_ANSWER_SENTINEL,
};
pub use pool::{ExecutorLease, ExecutorPool, PoolConfig, PoolStats};
pub use process::{ProcessExecutor, ProcessExecutorConfig, ProcessExecutorFactory, RuntimeMode};
pub use security::SecurityConfig;
