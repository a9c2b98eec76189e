//! Customer activity projection.
//!
//! [`CustomerActivityHandler`] keeps the latest known state of every customer it has
//! seen events for. Delivery is at-least-once, so the ids of the most recently
//! applied events are remembered and a replay of one of them is acknowledged without
//! touching the view. The window is bounded; see [`DEFAULT_DEDUP_WINDOW`].

use crate::events::{CustomerCreated, CustomerDeleted, CustomerUpdated, is_valid_email};
use chrono::{DateTime, Utc};
use eventing_core::handler::{EventHandler, HandlerContext, HandlerError, HandlerFuture};
use eventing_core::registry::{EventRegistry, RegistryError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Latest known state of one customer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomerView {
    /// Customer id
    pub customer_id: String,
    /// Display name
    pub name: String,
    /// Contact email
    pub email: Option<String>,
    /// When the customer was created
    pub created_at: DateTime<Utc>,
    /// When the last applied event was raised
    pub updated_at: DateTime<Utc>,
    /// Whether the account was closed
    pub deleted: bool,
    /// Number of events applied to this view
    pub version: u64,
}

/// Number of recently applied event ids remembered for deduplication.
pub const DEFAULT_DEDUP_WINDOW: usize = 10_000;

/// Bounded set of applied event ids; the oldest id is forgotten first.
#[derive(Debug)]
struct RecentEvents {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl RecentEvents {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.ids.remove(&oldest);
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug)]
struct Directory {
    customers: HashMap<String, CustomerView>,
    applied: RecentEvents,
}

impl Default for Directory {
    fn default() -> Self {
        Self::with_window(DEFAULT_DEDUP_WINDOW)
    }
}

impl Directory {
    fn with_window(window: usize) -> Self {
        Self {
            customers: HashMap::new(),
            applied: RecentEvents::new(window),
        }
    }
}

/// Idempotent projection of customer events.
///
/// Cheap to clone; clones share the same view. Register it once per customer event
/// type with [`CustomerActivityHandler::register`].
#[derive(Clone, Debug, Default)]
pub struct CustomerActivityHandler {
    directory: Arc<Mutex<Directory>>,
}

impl CustomerActivityHandler {
    /// Create an empty projection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty projection that remembers the last `window` applied event ids.
    #[must_use]
    pub fn with_dedup_window(window: usize) -> Self {
        Self {
            directory: Arc::new(Mutex::new(Directory::with_window(window))),
        }
    }

    /// Register this handler for every customer event type.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateEventType`] if one of the customer event
    /// types is already registered.
    pub fn register(&self, registry: &mut EventRegistry) -> Result<(), RegistryError> {
        registry
            .register::<CustomerCreated, _>(self.clone())?
            .register::<CustomerUpdated, _>(self.clone())?
            .register::<CustomerDeleted, _>(self.clone())?;
        Ok(())
    }

    /// Current view of a customer, if any event for it was applied.
    #[must_use]
    pub fn customer(&self, customer_id: &str) -> Option<CustomerView> {
        self.lock().customers.get(customer_id).cloned()
    }

    /// Number of customers that are not deleted.
    #[must_use]
    pub fn active_customers(&self) -> usize {
        self.lock().customers.values().filter(|c| !c.deleted).count()
    }

    /// Number of event ids currently remembered for deduplication.
    #[must_use]
    pub fn remembered_events(&self) -> usize {
        self.lock().applied.len()
    }

    fn lock(&self) -> MutexGuard<'_, Directory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `apply` unless `ctx.event_id` was already applied.
    fn apply_once(
        &self,
        ctx: &HandlerContext,
        apply: impl FnOnce(&mut HashMap<String, CustomerView>) -> Result<(), HandlerError>,
    ) -> Result<(), HandlerError> {
        let mut directory = self.lock();
        if directory.applied.contains(&ctx.event_id) {
            tracing::debug!(event_id = %ctx.event_id, "Event already applied, skipping");
            return Ok(());
        }
        apply(&mut directory.customers)?;
        directory.applied.insert(ctx.event_id);
        Ok(())
    }
}

fn check_email(email: Option<&str>) -> Result<(), HandlerError> {
    match email {
        Some(email) if !is_valid_email(email) => {
            Err(HandlerError::fatal(format!("malformed email address '{email}'")))
        }
        _ => Ok(()),
    }
}

impl EventHandler<CustomerCreated> for CustomerActivityHandler {
    fn handle<'a>(&'a self, event: CustomerCreated, ctx: &'a HandlerContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            check_email(event.email.as_deref())?;
            self.apply_once(ctx, |customers| {
                if customers.contains_key(&event.customer_id) {
                    tracing::debug!(customer_id = %event.customer_id, "Customer already known");
                    return Ok(());
                }
                tracing::info!(
                    customer_id = %event.customer_id,
                    correlation_id = %ctx.correlation_id,
                    "Customer created"
                );
                customers.insert(
                    event.customer_id.clone(),
                    CustomerView {
                        customer_id: event.customer_id,
                        name: event.name,
                        email: event.email,
                        created_at: ctx.occurred_at,
                        updated_at: ctx.occurred_at,
                        deleted: false,
                        version: 1,
                    },
                );
                Ok(())
            })
        })
    }
}

impl EventHandler<CustomerUpdated> for CustomerActivityHandler {
    fn handle<'a>(&'a self, event: CustomerUpdated, ctx: &'a HandlerContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            check_email(event.email.as_deref())?;
            self.apply_once(ctx, |customers| {
                // The create may not have been projected yet
                let Some(view) = customers.get_mut(&event.customer_id) else {
                    return Err(HandlerError::recoverable(format!(
                        "customer {} is not known yet",
                        event.customer_id
                    )));
                };
                if view.deleted {
                    tracing::debug!(customer_id = %event.customer_id, "Ignoring update for deleted customer");
                    return Ok(());
                }
                view.name = event.name;
                view.email = event.email;
                view.updated_at = ctx.occurred_at;
                view.version += 1;
                tracing::info!(customer_id = %view.customer_id, version = view.version, "Customer updated");
                Ok(())
            })
        })
    }
}

impl EventHandler<CustomerDeleted> for CustomerActivityHandler {
    fn handle<'a>(&'a self, event: CustomerDeleted, ctx: &'a HandlerContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.apply_once(ctx, |customers| {
                match customers.get_mut(&event.customer_id) {
                    Some(view) if !view.deleted => {
                        view.deleted = true;
                        view.updated_at = ctx.occurred_at;
                        view.version += 1;
                        tracing::info!(customer_id = %event.customer_id, "Customer deleted");
                    }
                    Some(_) => {}
                    None => {
                        tracing::debug!(customer_id = %event.customer_id, "Delete for unknown customer");
                    }
                }
                Ok(())
            })
        })
    }
}
