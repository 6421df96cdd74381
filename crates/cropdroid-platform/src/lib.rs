//! # CropDroid Platform
//!
//! Farm lifecycle on top of the scheduler: the provisioner that turns a
//! template into a persisted farm graph, and the service registry that
//! owns every running farm and answers the REST surface.
//!
//! ```text
//!   REST ──► ServiceRegistry ──► AuthService / ChannelService / ...
//!                │   ▲
//!     provisioned│   │deprovisioned, tick
//!                ▼   │
//!   Provisioner ─┴───┘      FarmScheduler × N ──► NotificationQueue ──► Mailer
//! ```

pub mod provisioner;
pub mod registry;
pub mod services;

pub use provisioner::{ProvisionParams, Provisioner, default_template};
pub use registry::{ClientFactory, ServiceRegistry};
pub use services::{AuthService, ChannelService, ConditionService, EventService, WorkflowService};
