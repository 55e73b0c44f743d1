//! Call session entities

use crate::domain::session::value_object::Role;
use crate::domain::shared::value_objects::ParticipantId;
use serde::{Deserialize, Serialize};

/// Participant in a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant identifier
    id: ParticipantId,
    /// Role within the family account
    role: Role,
    /// Display name
    display_name: Option<String>,
}

impl Participant {
    pub fn new(id: ParticipantId, role: Role, display_name: Option<String>) -> Self {
        Self {
            id,
            role,
            display_name,
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }
}
