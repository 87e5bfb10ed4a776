//! autocorrect: serialized request pipeline in front of a long-lived
//! suggestion process.
//!
//! Many concurrent callers are funnelled into one strictly ordered
//! conversation over the process's stdin/stdout. Responses are matched to
//! callers by arrival order alone, so the process must answer every request
//! exactly once and in order.

mod dispatcher;
mod health;
mod queue;
mod version;

pub mod bridge;
pub mod error;
pub mod service;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use dispatcher::{DispatcherHandle, PendingLookup, RestartPolicy};
pub use error::{LookupError, StartupError};
pub use health::{Health, ProcessInfo};
pub use queue::{DispatchState, LookupQueue, LookupResult};
pub use service::{HealthSnapshot, LookupService, ServiceConfig};
pub use supervisor::{
    CommandSpawner, ProcessExit, ProcessHandle, ProcessSpawner, Readiness, SpawnError, Supervisor,
    SupervisorConfig,
};
pub use version::{AUTOCORRECT_VERSION, VersionInfo};
