//! Customer domain events.
//!
//! All customer events go to [`CUSTOMER_TOPIC`] keyed by the customer id, so the
//! dispatcher sees the events for one customer in the order they were written.

use eventing_core::event::Event;
use serde::{Deserialize, Serialize};

/// Topic carrying every customer event.
pub const CUSTOMER_TOPIC: &str = "customer-events";

/// A customer signed up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerCreated {
    /// Customer id
    pub customer_id: String,
    /// Display name
    pub name: String,
    /// Contact email (optional; older producers omit it)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl CustomerCreated {
    /// Create the event without an email.
    #[must_use]
    pub fn new(customer_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            name: name.into(),
            email: None,
        }
    }

    /// Attach an email.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

impl Event for CustomerCreated {
    const EVENT_TYPE: &'static str = "CustomerCreated";
    const TOPIC: &'static str = CUSTOMER_TOPIC;

    fn resource_id(&self) -> String {
        self.customer_id.clone()
    }
}

/// A customer changed their profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerUpdated {
    /// Customer id
    pub customer_id: String,
    /// New display name
    pub name: String,
    /// New contact email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Event for CustomerUpdated {
    const EVENT_TYPE: &'static str = "CustomerUpdated";
    const TOPIC: &'static str = CUSTOMER_TOPIC;

    fn resource_id(&self) -> String {
        self.customer_id.clone()
    }
}

/// A customer closed their account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerDeleted {
    /// Customer id
    pub customer_id: String,
}

impl Event for CustomerDeleted {
    const EVENT_TYPE: &'static str = "CustomerDeleted";
    const TOPIC: &'static str = CUSTOMER_TOPIC;

    fn resource_id(&self) -> String {
        self.customer_id.clone()
    }
}

/// Loose email shape check: one `@`, a non-empty local part, and a dotted domain.
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
}
