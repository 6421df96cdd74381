//! Session contract the REST surface presents to the core.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Cultivator,
    Analyst,
}

impl Role {
    pub fn id(&self) -> u64 {
        match self {
            Role::Admin => 1,
            Role::Cultivator => 2,
            Role::Analyst => 3,
        }
    }

    pub fn from_id(id: u64) -> Option<Self> {
        match id {
            1 => Some(Role::Admin),
            2 => Some(Role::Cultivator),
            3 => Some(Role::Analyst),
            _ => None,
        }
    }

    pub fn permits(&self, action: Action) -> bool {
        match self {
            Role::Admin => true,
            Role::Cultivator => matches!(action, Action::View | Action::Actuate),
            Role::Analyst => action == Action::View,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    View,
    Actuate,
    Configure,
    Provision,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::View => "view",
            Action::Actuate => "actuate",
            Action::Configure => "configure",
            Action::Provision => "provision",
        };
        f.write_str(s)
    }
}

/// Authenticated caller, as resolved by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: u64,
    pub org_id: u64,
    pub farm_id: u64,
    pub role: Role,
}
