//! Content-addressed entity IDs.
//!
//! Every child of a farm gets an ID derived from the fields that identify it,
//! so two nodes materialising the same template converge on identical IDs.
//! The hash is the first eight bytes of SHA-256 over the fields joined with
//! `|`, masked so the value fits the signed integer column of the backend.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Width of persisted IDs. Chosen once per process from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdWidth {
    /// Signed 32-bit SQL engines: 31 usable bits.
    Bits32,
    /// Everything else: 63 usable bits.
    #[default]
    Bits64,
}

impl IdWidth {
    pub fn mask(self) -> u64 {
        match self {
            IdWidth::Bits32 => 0x7fff_ffff,
            IdWidth::Bits64 => 0x7fff_ffff_ffff_ffff,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdHasher {
    width: IdWidth,
}

impl IdHasher {
    pub fn new(width: IdWidth) -> Self {
        Self { width }
    }

    pub fn width(&self) -> IdWidth {
        self.width
    }

    /// `H(parts[0] ‖ parts[1] ‖ …)`.
    pub fn hash(&self, parts: &[&dyn std::fmt::Display]) -> u64 {
        let mut hasher = Sha256::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                hasher.update(b"|");
            }
            hasher.update(part.to_string().as_bytes());
        }
        let digest = hasher.finalize();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[..8]);
        let id = u64::from_be_bytes(buf) & self.width.mask();
        // zero is reserved for "no parent"
        if id == 0 { 1 } else { id }
    }

    pub fn organization_id(&self, name: &str) -> u64 {
        self.hash(&[&"org", &name])
    }

    pub fn farm_id(&self, org_id: u64, farm_name: &str) -> u64 {
        self.hash(&[&org_id, &farm_name])
    }

    pub fn device_id(&self, farm_id: u64, device_type: &str) -> u64 {
        self.hash(&[&farm_id, &device_type])
    }

    pub fn setting_id(&self, device_id: u64, key: &str) -> u64 {
        self.hash(&[&device_id, &"setting", &key])
    }

    pub fn metric_id(&self, device_id: u64, key: &str) -> u64 {
        self.hash(&[&device_id, &"metric", &key])
    }

    pub fn channel_id(&self, device_id: u64, channel_name: &str) -> u64 {
        self.hash(&[&device_id, &channel_name])
    }

    pub fn condition_id(
        &self,
        device_id: u64,
        workflow_id: u64,
        channel_id: u64,
        metric_id: u64,
        comparator: &str,
        threshold: f64,
    ) -> u64 {
        self.hash(&[
            &device_id,
            &workflow_id,
            &channel_id,
            &metric_id,
            &comparator,
            &threshold,
        ])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn schedule_id(
        &self,
        farm_id: u64,
        device_id: u64,
        channel_id: u64,
        start_date: &str,
        end_date: &str,
        frequency: &str,
        count: u32,
    ) -> u64 {
        self.hash(&[
            &farm_id,
            &device_id,
            &channel_id,
            &start_date,
            &end_date,
            &frequency,
            &count,
        ])
    }

    pub fn workflow_id(&self, farm_id: u64, name: &str) -> u64 {
        self.hash(&[&farm_id, &"workflow", &name])
    }

    pub fn workflow_step_id(
        &self,
        workflow_id: u64,
        device_id: u64,
        channel_id: u64,
        duration: u32,
        state: &str,
    ) -> u64 {
        self.hash(&[&workflow_id, &device_id, &channel_id, &duration, &state])
    }

    pub fn permission_id(&self, user_id: u64, farm_id: u64, role_id: u64) -> u64 {
        self.hash(&[&"permission", &user_id, &farm_id, &role_id])
    }

    pub fn event_id(&self, farm_id: u64, nanos: i64, sequence: u64) -> u64 {
        self.hash(&[&"event", &farm_id, &nanos, &sequence])
    }
}
