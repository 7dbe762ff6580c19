//! Session-scoped event delivery: channel registry, background producer,
//! per-connection stream loop and the coordinator that ties them together.

pub mod config;
pub mod coordinator;
pub mod producer;
pub mod registry;
pub mod stream;

pub use config::EngineConfig;
pub use coordinator::{
    start_parked_sweeper, OpenedSession, SessionCoordinator, SessionOverview, SubmitReceipt,
};
pub use producer::{
    FixedJobSizer, JobOutcome, JobReport, JobSizer, Producer, ProducerJob, RandomJobSizer,
};
pub use registry::{ChannelHandle, DeliveryOutcome, SessionRegistry, Subscription};
pub use stream::{CloseHook, EventStream, StreamState};
