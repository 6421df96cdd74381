//! # CropDroid Core
//!
//! Shared vocabulary of the farm control plane: the entity model and its
//! hydrated per-farm graph, content-addressed IDs, configuration, the error
//! taxonomy, the explicit `FarmContext`, and the collaborator traits the
//! scheduler consumes (devices, persistence, replication, mail).

pub mod config;
pub mod context;
pub mod error;
pub mod farm_config;
pub mod ids;
pub mod model;
pub mod session;
pub mod traits;
pub mod types;

pub use config::CropDroidConfig;
pub use context::{Clock, FarmContext, ManualClock, SystemClock};
pub use error::{CropDroidError, ErrorKind, Result};
pub use farm_config::{ConfigHandle, FarmConfig};
pub use ids::{IdHasher, IdWidth};
pub use session::{Action, Role, Session};
pub use types::{DeviceSnapshot, Notification, NotificationKind, NotifyPriority};
