//! Fixture events shared by tests across the workspace.

use eventing_core::event::Event;
use serde::{Deserialize, Serialize};

/// Topic of the customer fixtures.
pub const CUSTOMER_TOPIC: &str = "customer-events";

/// Topic of the order fixtures.
pub const ORDER_TOPIC: &str = "order-events";

/// A customer signed up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerCreated {
    /// Customer id
    pub customer_id: String,
    /// Display name
    pub name: String,
}

impl CustomerCreated {
    /// Create the event.
    #[must_use]
    pub fn new(customer_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            name: name.into(),
        }
    }
}

impl Event for CustomerCreated {
    const EVENT_TYPE: &'static str = "CustomerCreated";
    const TOPIC: &'static str = CUSTOMER_TOPIC;

    fn resource_id(&self) -> String {
        self.customer_id.clone()
    }
}

/// A customer changed their name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRenamed {
    /// Customer id
    pub customer_id: String,
    /// New display name
    pub name: String,
}

impl CustomerRenamed {
    /// Create the event.
    #[must_use]
    pub fn new(customer_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            name: name.into(),
        }
    }
}

impl Event for CustomerRenamed {
    const EVENT_TYPE: &'static str = "CustomerRenamed";
    const TOPIC: &'static str = CUSTOMER_TOPIC;

    fn resource_id(&self) -> String {
        self.customer_id.clone()
    }
}

/// An order was placed. Lives on a different topic than the customer events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    /// Order id
    pub order_id: String,
    /// Ordering customer
    pub customer_id: String,
    /// Order total in cents
    pub total_cents: u64,
}

impl OrderPlaced {
    /// Create the event.
    #[must_use]
    pub fn new(order_id: impl Into<String>, customer_id: impl Into<String>, total_cents: u64) -> Self {
        Self {
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            total_cents,
        }
    }
}

impl Event for OrderPlaced {
    const EVENT_TYPE: &'static str = "OrderPlaced";
    const TOPIC: &'static str = ORDER_TOPIC;

    fn resource_id(&self) -> String {
        self.order_id.clone()
    }
}
