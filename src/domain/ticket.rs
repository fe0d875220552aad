//! Ticket projection.
//!
//! The ticket/project record store is external; the core reads only the
//! fields it needs to build a work queue and never writes back.

use serde::{Deserialize, Serialize};

/// Read-only view of one ticket from the external record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Stable ticket identifier, also used as the logical thread id
    pub id: String,
    /// Short human title
    pub title: String,
    /// Full task description handed to the worker as the prompt body
    pub description: String,
}

impl Ticket {
    /// Create a ticket projection.
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
        }
    }

    /// Render the prompt body submitted for this ticket's primary step.
    pub fn prompt(&self) -> String {
        format!("{}\n\n{}", self.title, self.description)
    }
}
