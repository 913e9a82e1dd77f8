//! Type-indexed publish/subscribe bus.
//!
//! # Guarantees
//!
//! - **Synchronous delivery**: `publish` returns after every handler ran, on
//!   the publishing thread
//! - **Snapshot semantics**: a publish delivers to the subscribers present
//!   when it started; changes made by handlers apply to the next publish
//! - **Fault isolation**: a panicking handler is logged and skipped
//!
//! Handler lists are copy-on-write (`Arc<Vec<_>>`), so a publish holds the
//! table lock only long enough to clone one `Arc`. Handlers may subscribe,
//! unsubscribe or publish from inside a handler.
//!
//! # Example
//!
//! ```ignore
//! use marshal::bus::{EventBusExt, InProcessBus};
//!
//! let bus = InProcessBus::new();
//! let token = bus.subscribe(|event: &DiskSelected| {
//!     tracing::info!(disk = %event.index, "disk selected");
//! });
//!
//! bus.publish(&DiskSelected { index: 1 });
//! bus.unsubscribe(token);
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{trace, warn};

use crate::error::panic_message;

/// Type-erased handler as stored by the bus.
pub type ErasedHandler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// Identifies one subscription. Never reused within a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Object-safe bus contract. Use [`EventBusExt`] for typed access.
pub trait EventBus: Send + Sync {
    /// Register `handler` for events whose type id is `event_type`.
    fn subscribe_erased(
        &self,
        event_type: TypeId,
        event_name: &'static str,
        handler: ErasedHandler,
    ) -> SubscriptionToken;

    /// Deliver `event` to every handler registered for `event_type`.
    ///
    /// Returns how many handlers were in the snapshot.
    fn publish_erased(&self, event_type: TypeId, event: &dyn Any) -> usize;

    /// Remove a subscription. Returns false if the token is unknown.
    fn unsubscribe(&self, token: SubscriptionToken) -> bool;

    /// Remove every subscription.
    fn clear(&self);

    /// Subscriptions across all event types.
    fn subscriber_count(&self) -> usize;

    fn subscriber_count_for_type(&self, event_type: TypeId) -> usize;
}

/// Typed subscribe/publish for any [`EventBus`].
pub trait EventBusExt: EventBus {
    fn subscribe<E, F>(&self, handler: F) -> SubscriptionToken
    where
        E: Any,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe_erased(
            TypeId::of::<E>(),
            type_name::<E>(),
            Arc::new(move |event: &dyn Any| {
                if let Some(event) = event.downcast_ref::<E>() {
                    handler(event);
                }
            }),
        )
    }

    fn publish<E: Any>(&self, event: &E) -> usize {
        self.publish_erased(TypeId::of::<E>(), event)
    }

    fn subscriber_count_for<E: Any>(&self) -> usize {
        self.subscriber_count_for_type(TypeId::of::<E>())
    }
}

impl<B: EventBus + ?Sized> EventBusExt for B {}

// =============================================================================
// InProcessBus
// =============================================================================

#[derive(Clone)]
struct Subscription {
    token: SubscriptionToken,
    event_name: &'static str,
    handler: ErasedHandler,
}

#[derive(Default)]
struct Table {
    handlers: HashMap<TypeId, Arc<Vec<Subscription>>>,
    owners: HashMap<SubscriptionToken, TypeId>,
}

/// Lock-protected in-memory [`EventBus`].
pub struct InProcessBus {
    table: Mutex<Table>,
    next_token: AtomicU64,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
            next_token: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InProcessBus {
    fn subscribe_erased(
        &self,
        event_type: TypeId,
        event_name: &'static str,
        handler: ErasedHandler,
    ) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut table = self.lock();
        Arc::make_mut(table.handlers.entry(event_type).or_default()).push(Subscription {
            token,
            event_name,
            handler,
        });
        table.owners.insert(token, event_type);
        trace!(token = token.0, event = event_name, "subscribed");
        token
    }

    fn publish_erased(&self, event_type: TypeId, event: &dyn Any) -> usize {
        let snapshot = self.lock().handlers.get(&event_type).cloned();
        let Some(subscriptions) = snapshot else {
            return 0;
        };

        for subscription in subscriptions.iter() {
            let handler = &subscription.handler;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                warn!(
                    token = subscription.token.0,
                    event = subscription.event_name,
                    panic = %panic_message(payload.as_ref()),
                    "event handler panicked"
                );
            }
        }
        subscriptions.len()
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut table = self.lock();
        let Some(event_type) = table.owners.remove(&token) else {
            return false;
        };
        let now_empty = match table.handlers.get_mut(&event_type) {
            Some(bucket) => {
                Arc::make_mut(bucket).retain(|s| s.token != token);
                bucket.is_empty()
            }
            None => false,
        };
        if now_empty {
            table.handlers.remove(&event_type);
        }
        trace!(token = token.0, "unsubscribed");
        true
    }

    fn clear(&self) {
        let mut table = self.lock();
        table.handlers.clear();
        table.owners.clear();
    }

    fn subscriber_count(&self) -> usize {
        self.lock().owners.len()
    }

    fn subscriber_count_for_type(&self, event_type: TypeId) -> usize {
        self.lock()
            .handlers
            .get(&event_type)
            .map(|bucket| bucket.len())
            .unwrap_or(0)
    }
}

impl fmt::Debug for InProcessBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.lock();
        f.debug_struct("InProcessBus")
            .field("event_types", &table.handlers.len())
            .field("subscribers", &table.owners.len())
            .finish()
    }
}
