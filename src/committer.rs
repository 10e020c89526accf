//! Caller-supplied commit metadata.

use serde_json::Value;
use std::fmt;

/// Metadata recorded with a persist, plus a notification run once the
/// persist is durable.
pub struct Committer {
    metadata: Value,
    on_durable: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Committer {
    pub fn new(metadata: Value) -> Self {
        Self {
            metadata,
            on_durable: None,
        }
    }

    /// A committer carrying no metadata.
    pub fn nil() -> Self {
        Self::new(Value::Null)
    }

    /// Sets the callback invoked after the associated persist is durable.
    pub fn on_durable<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_durable = Some(Box::new(callback));
        self
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    /// Takes over the callback of an `earlier` committer this one
    /// supersedes; both callbacks run, oldest first.
    pub(crate) fn absorb(mut self, earlier: Committer) -> Self {
        self.on_durable = match (earlier.on_durable, self.on_durable.take()) {
            (Some(first), Some(second)) => {
                let both: Box<dyn FnOnce() + Send + 'static> = Box::new(move || {
                    first();
                    second();
                });
                Some(both)
            }
            (first, second) => second.or(first),
        };
        self
    }

    /// Runs the durability callback, consuming the committer.
    pub(crate) fn notify(self) -> Value {
        if let Some(callback) = self.on_durable {
            callback();
        }
        self.metadata
    }
}

impl fmt::Debug for Committer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Committer")
            .field("metadata", &self.metadata)
            .field("on_durable", &self.on_durable.is_some())
            .finish()
    }
}

/// Produces a committer on demand. Called when a persist is scheduled, so the
/// metadata reflects exactly the rows already added.
pub trait CommitterSupplier: Send + Sync {
    fn get(&self) -> Committer;
}

impl<F> CommitterSupplier for F
where
    F: Fn() -> Committer + Send + Sync,
{
    fn get(&self) -> Committer {
        self()
    }
}

/// Supplier for callers that do not track commit metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct NilCommitterSupplier;

impl CommitterSupplier for NilCommitterSupplier {
    fn get(&self) -> Committer {
        Committer::nil()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notify_runs_callback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let committer = Committer::new(json!({"offset": 7})).on_durable(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(committer.metadata(), &json!({"offset": 7}));
        assert_eq!(committer.notify(), json!({"offset": 7}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_absorb_runs_both_callbacks_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let earlier = {
            let order = Arc::clone(&order);
            Committer::new(json!(1)).on_durable(move || order.lock().push("earlier"))
        };
        let later = {
            let order = Arc::clone(&order);
            Committer::new(json!(2)).on_durable(move || order.lock().push("later"))
        };

        assert_eq!(later.absorb(earlier).notify(), json!(2));
        assert_eq!(*order.lock(), vec!["earlier", "later"]);
    }

    #[test]
    fn test_closure_supplier() {
        let events = Arc::new(AtomicUsize::new(3));
        let supplier = {
            let events = Arc::clone(&events);
            move || Committer::new(json!({"eventCount": events.load(Ordering::SeqCst)}))
        };
        assert_eq!(supplier.get().metadata(), &json!({"eventCount": 3}));
        events.store(4, Ordering::SeqCst);
        assert_eq!(supplier.get().metadata(), &json!({"eventCount": 4}));
        assert_eq!(NilCommitterSupplier.get().metadata(), &Value::Null);
    }
}
