//! Domain value objects.

mod priority;
mod retry_policy;

pub use priority::Priority;
pub use retry_policy::RetryPolicy;
