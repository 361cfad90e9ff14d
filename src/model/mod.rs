//! Wire and domain types shared by the dispatcher, its workers and the center client.

mod lenient;
mod resource;
mod task;

pub(crate) use lenient::{lenient_string, null_as_default};
pub use resource::{Resource, parse_bundle};
pub use task::{DELETED_FLAG, STATUS_RUNNING, Task};
