pub mod dispatcher;
pub mod host;
pub mod log_capture;
pub mod models;
pub mod naming;
pub mod tags;

pub use dispatcher::Dispatcher;
pub use host::HostIdentity;
pub use models::{BackupJob, BackupTarget, Outcome, Phase, RunStatus, TargetReport};
pub use naming::{Slug, slug};
pub use tags::{Tags, job_tag};
