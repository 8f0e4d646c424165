mod job_id;
pub use job_id::JobId;

mod job_state;
pub use job_state::{JobState, ParseStateError};

mod exit_info;
pub use exit_info::ExitInfo;

mod observation;
pub use observation::JobObservation;

mod job_record;
pub use job_record::{Delivery, JobRecord, RejectReason, Transition};

pub mod time_serde;

/// Name of a configured collector endpoint.
///
/// Used as the key of per-endpoint delivery bookkeeping inside [`JobRecord`].
pub type EndpointName = String;

/// Monotonic per-job change counter.
///
/// Collectors apply updates last-write-wins by revision.
pub type Revision = u64;
