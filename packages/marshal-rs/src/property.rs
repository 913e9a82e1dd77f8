//! Property-change notifications delivered through a dispatcher.
//!
//! View models raise `(property_name)` notifications from whatever thread
//! changed the value; with a dispatcher attached, handlers run on the
//! dispatcher's home thread during its next pump (or inline if the change
//! happened there already).
//!
//! # Example
//!
//! ```ignore
//! let notifier = Arc::new(PropertyChangedNotifier::with_dispatcher(dispatcher.clone()));
//! notifier.add_handler(|name| tracing::debug!(property = name, "refresh"));
//!
//! let status = Property::new("status", String::from("Idle"), notifier.clone());
//! status.set("Copying files".into()); // handler runs on the UI thread
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::error::panic_message;

pub type PropertyChangedHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Holds change handlers and fans notifications out to them.
pub struct PropertyChangedNotifier {
    handlers: Mutex<Vec<PropertyChangedHandler>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl PropertyChangedNotifier {
    /// Notifier that calls handlers on the notifying thread.
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            dispatcher: None,
        }
    }

    /// Notifier that routes every notification through `dispatcher`.
    pub fn with_dispatcher(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            dispatcher: Some(dispatcher),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PropertyChangedHandler>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.lock().push(Arc::new(handler));
    }

    pub fn remove_all_handlers(&self) {
        self.lock().clear();
    }

    pub fn handler_count(&self) -> usize {
        self.lock().len()
    }

    /// Announce that `property_name` changed.
    ///
    /// Handlers registered at the time of the call receive it.
    pub fn notify(&self, property_name: &str) {
        let handlers = self.lock().clone();
        if handlers.is_empty() {
            return;
        }

        match &self.dispatcher {
            Some(dispatcher) => {
                let name = property_name.to_string();
                dispatcher.invoke(Box::new(move || deliver(&handlers, &name)));
            }
            None => deliver(&handlers, property_name),
        }
    }
}

fn deliver(handlers: &[PropertyChangedHandler], property_name: &str) {
    for handler in handlers {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(property_name))) {
            warn!(
                property = property_name,
                panic = %panic_message(payload.as_ref()),
                "property handler panicked"
            );
        }
    }
}

impl Default for PropertyChangedNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PropertyChangedNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyChangedNotifier")
            .field("handlers", &self.handler_count())
            .field("dispatched", &self.dispatcher.is_some())
            .finish()
    }
}

/// Observable value that notifies when it actually changes.
pub struct Property<T> {
    name: String,
    value: Mutex<T>,
    notifier: Arc<PropertyChangedNotifier>,
}

impl<T> Property<T> {
    pub fn new(name: impl Into<String>, initial: T, notifier: Arc<PropertyChangedNotifier>) -> Self {
        Self {
            name: name.into(),
            value: Mutex::new(initial),
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Property<T> {
    pub fn get(&self) -> T {
        self.lock().clone()
    }
}

impl<T: PartialEq> Property<T> {
    /// Store `value`. Returns true and notifies if it differed.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.lock();
            if *current == value {
                return false;
            }
            *current = value;
        }
        self.notifier.notify(&self.name);
        true
    }
}

impl<T: fmt::Debug> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("value", &*self.lock())
            .finish()
    }
}
