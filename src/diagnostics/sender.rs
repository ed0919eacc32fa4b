use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, trace, warn};


/// Informal level at or above which a message is considered a warning.
pub const LEVEL_WARNING: usize = 5;

/// Informal level at or above which a message is considered an error.
pub const LEVEL_ERROR: usize = 10;

/// The function type called to deliver diagnostic messages to a subscriber:
/// `(sender_name, level, message)`. Delegates must not panic; they are
/// invoked synchronously on whatever task published the message.
pub type DiagnosticDelegate = Arc<dyn Fn(&str, usize, &str) + Send + Sync>;


struct Subscription {
    id: u64,
    delegate: DiagnosticDelegate,
    min_level: usize,
}

struct Registry {
    /// Subscriptions in subscription order. Ids are never reused, so an
    ///  unsubscribe handle can only ever remove the subscription it was
    ///  created for.
    subscriptions: Vec<Subscription>,
    next_subscription_id: u64,
    context: Vec<String>,
}

/// A named publisher of diagnostic messages.
///
/// Subscribers register a delegate together with the minimum level they care
/// about and receive every message published at or above that level,
/// synchronously and in subscription order. Levels are informal; see
/// [`LEVEL_WARNING`] and [`LEVEL_ERROR`].
///
/// A stack of context strings can be pushed; each published message is
/// prefixed with the current frames in push order, joined by `": "`.
///
/// Every published message is additionally forwarded as a `tracing` event at
/// the mapped severity, so senders participate in the host application's
/// subscriber without extra wiring.
///
/// Cloning is cheap and shares the subscription registry and context stack.
#[derive(Clone)]
pub struct DiagnosticsSender {
    name: Arc<str>,
    registry: Arc<Mutex<Registry>>,
}

impl DiagnosticsSender {
    pub fn new(name: impl Into<String>) -> DiagnosticsSender {
        DiagnosticsSender {
            name: name.into().into(),
            registry: Arc::new(Mutex::new(Registry {
                subscriptions: Vec::new(),
                next_subscription_id: 0,
                context: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forms a new subscription. The returned handle removes exactly this
    /// subscription when [`SubscriptionHandle::unsubscribe`] is called;
    /// dropping the handle leaves the subscription in place.
    pub fn subscribe(&self, delegate: DiagnosticDelegate, min_level: usize) -> SubscriptionHandle {
        let mut registry = self.lock_registry();
        let id = registry.next_subscription_id;
        registry.next_subscription_id += 1;
        registry.subscriptions.push(Subscription {
            id,
            delegate,
            min_level,
        });
        SubscriptionHandle {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// The lowest minimum level over all current subscribers, or
    /// `usize::MAX` when there are none. Lets a producer skip expensive
    /// message formatting nobody would receive.
    pub fn min_level(&self) -> usize {
        self.lock_registry()
            .subscriptions
            .iter()
            .map(|s| s.min_level)
            .min()
            .unwrap_or(usize::MAX)
    }

    /// Publishes a message to every subscriber whose minimum level is at or
    /// below `level`. The message is prefixed with the current context
    /// frames joined by `": "`.
    pub fn publish(&self, level: usize, message: impl AsRef<str>) {
        let (composed, delegates) = {
            let registry = self.lock_registry();
            let mut composed = String::new();
            for frame in &registry.context {
                composed.push_str(frame);
                composed.push_str(": ");
            }
            composed.push_str(message.as_ref());

            // snapshot the delegates so the registry lock is not held while
            //  they run
            let delegates: Vec<DiagnosticDelegate> = registry
                .subscriptions
                .iter()
                .filter(|s| s.min_level <= level)
                .map(|s| s.delegate.clone())
                .collect();
            (composed, delegates)
        };

        match level {
            LEVEL_ERROR.. => error!(sender = %self.name, "{}", composed),
            LEVEL_WARNING.. => warn!(sender = %self.name, "{}", composed),
            1.. => debug!(sender = %self.name, "{}", composed),
            _ => trace!(sender = %self.name, "{}", composed),
        }

        for delegate in delegates {
            delegate(&self.name, level, &composed);
        }
    }

    /// Returns a delegate that republishes any message it receives on this
    /// sender, with the originating sender's name as an additional prefix
    /// frame. Used to chain senders together.
    pub fn chain(&self) -> DiagnosticDelegate {
        let sender = self.clone();
        Arc::new(move |origin_name: &str, level: usize, message: &str| {
            sender.publish(level, format!("{}: {}", origin_name, message));
        })
    }

    /// Pushes a string onto the contextual information stack.
    pub fn push_context(&self, context: impl Into<String>) {
        self.lock_registry().context.push(context.into());
    }

    /// Removes the top string from the contextual information stack.
    pub fn pop_context(&self) {
        self.lock_registry().context.pop();
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        // a poisoned registry means a delegate panicked while *not* being
        //  called (delegates run outside the lock); continuing is safe
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}


/// Handle removing one subscription from a [`DiagnosticsSender`].
/// `unsubscribe` is idempotent; calling it twice cannot affect a later
/// subscription.
pub struct SubscriptionHandle {
    registry: Weak<Mutex<Registry>>,
    id: u64,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            registry.subscriptions.retain(|s| s.id != self.id);
        }
    }
}
