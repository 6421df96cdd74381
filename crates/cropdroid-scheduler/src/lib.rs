//! # CropDroid Scheduler
//!
//! Everything that happens inside one farm tick, plus the queue that carries
//! operator notifications out of it.
//!
//! ## Architecture
//! ```text
//! FarmScheduler (tokio interval, one per farm)
//!   ├── poll    DeviceWorker × N in parallel ──→ StateStore (per-farm RwLock)
//!   ├── alarms  AlarmTracker ─────────────────┐
//!   ├── rules   RuleEngine (schedule ∨ conds) │
//!   │             └── bang-bang / pH / oxidizer
//!   ├── act     per-device actuation lock     ├──→ NotificationQueue ──→ Mailer
//!   └── flows   WorkflowExecutor (edge trigger)│       (bounded)        ├── log
//!                 running → waiting → done ───┘                         ├── SMTP
//!                                                                       └── webhook
//! EventLogService ← unreachable / recovered / switch / deferred / workflow
//! ```

pub mod alarms;
pub mod dispatch;
pub mod events;
pub mod farm;
pub mod notify;
pub mod rules;
pub mod schedule;
pub mod state;
pub mod workflow;

#[cfg(test)]
mod fixtures;

pub use alarms::AlarmTracker;
pub use dispatch::{LogMailer, MemoryMailer, SmtpMailer, WebhookMailer, build_mailer};
pub use events::EventLogService;
pub use farm::{FarmScheduler, TickReport};
pub use notify::{NotificationQueue, run_consumer};
pub use rules::{Command, CommandAction, RuleEngine};
pub use state::{StateMap, StateStore};
pub use workflow::{StepReport, WorkerMap, WorkflowExecutor, WorkflowRun};
