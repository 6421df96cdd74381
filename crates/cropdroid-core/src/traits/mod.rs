//! Capabilities the core consumes from collaborators.

pub mod device;
pub mod mailer;
pub mod store;

pub use device::DeviceClient;
pub use mailer::Mailer;
pub use store::{
    DeviceDataStore, Mutation, PageQuery, Record, RecordPage, RecordStore, Replicator,
};
