//! Domain model (IDs, queue keys, tasks, pollers, unload causes, errors).

pub mod errors;
pub mod ids;
pub mod poller;
pub mod queue_key;
pub mod task;
pub mod unload;

pub use self::errors::{ErrorKind, MatchingError};
pub use self::ids::{RequestId, SequenceId, TaskId};
pub use self::poller::{PollMetadata, PollerIdentity, PollerInfo};
pub use self::queue_key::{QueueKey, TaskQueueKind};
pub use self::task::{
    NamespaceId, PolledTask, Priority, RequestKind, Responder, Task, TaskInfo, TaskSource,
    VersioningTag,
};
pub use self::unload::UnloadCause;
