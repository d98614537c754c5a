pub mod backoff;
pub mod context;
pub mod error;
pub mod operational;

pub use backoff::AttemptState;
pub use context::{
    compute_context, HookRunner, NoHooks, PrepareDeviceOutput, RegistrationConfig,
    RegistrationContext,
};
pub use error::EngineError;
pub use operational::{BecomeOperational, TaskProgress};
