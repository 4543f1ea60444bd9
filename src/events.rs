//! Synchronous publish/subscribe for transfer lifecycle events.
//!
//! Handlers run on the publishing thread in registration order. The bus
//! snapshots a kind's handler list before dispatch and releases its lock, so
//! a handler may subscribe, clear, or cancel transfers (which publishes
//! again) without deadlocking; such changes take effect from the next
//! publish.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ArchiveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    DownloadStarted,
    Downloading,
    DownloadFinished,
    DownloadCancelled,
    DownloadFailed,
    DownloadQueueStarted,
    DownloadQueueFinished,
    JsonError,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::DownloadCancelled,
        EventKind::Downloading,
        EventKind::DownloadStarted,
        EventKind::DownloadFinished,
        EventKind::DownloadQueueFinished,
        EventKind::DownloadQueueStarted,
        EventKind::DownloadFailed,
        EventKind::JsonError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::DownloadStarted => "downloadStarted",
            EventKind::Downloading => "downloading",
            EventKind::DownloadFinished => "downloadFinished",
            EventKind::DownloadCancelled => "downloadCancelled",
            EventKind::DownloadFailed => "downloadFailed",
            EventKind::DownloadQueueStarted => "downloadQueueStarted",
            EventKind::DownloadQueueFinished => "downloadQueueFinished",
            EventKind::JsonError => "jsonError",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ArchiveError;

    fn from_str(value: &str) -> Result<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| ArchiveError::InvalidEventKind(value.to_string()))
    }
}

/// A published event with its positional payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `total_bytes` is `-1` when the size could not be resolved.
    DownloadStarted { source: String, total_bytes: i64 },
    Downloading { source: String, bytes: u64 },
    DownloadFinished { source: String },
    DownloadCancelled { source: String },
    DownloadFailed {
        source: String,
        destination: PathBuf,
        message: String,
    },
    DownloadQueueStarted,
    DownloadQueueFinished,
    JsonError {
        host: String,
        identity: String,
        response: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DownloadStarted { .. } => EventKind::DownloadStarted,
            Event::Downloading { .. } => EventKind::Downloading,
            Event::DownloadFinished { .. } => EventKind::DownloadFinished,
            Event::DownloadCancelled { .. } => EventKind::DownloadCancelled,
            Event::DownloadFailed { .. } => EventKind::DownloadFailed,
            Event::DownloadQueueStarted => EventKind::DownloadQueueStarted,
            Event::DownloadQueueFinished => EventKind::DownloadQueueFinished,
            Event::JsonError { .. } => EventKind::JsonError,
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            Event::DownloadStarted { source, .. }
            | Event::Downloading { source, .. }
            | Event::DownloadFinished { source }
            | Event::DownloadCancelled { source }
            | Event::DownloadFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    declared: BTreeSet<EventKind>,
    suspended: BTreeSet<EventKind>,
    handlers: BTreeMap<EventKind, Vec<Handler>>,
}

pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new(kinds: &[EventKind]) -> Self {
        let mut registry = Registry::default();
        for kind in kinds {
            registry.declared.insert(*kind);
            registry.handlers.insert(*kind, Vec::new());
        }
        Self {
            registry: Mutex::new(registry),
        }
    }

    /// A bus that recognizes every transfer and listing event.
    pub fn with_all_kinds() -> Self {
        Self::new(&EventKind::ALL)
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.lock().declared.iter().copied().collect()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Result<()>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        ensure_declared(&registry, kind)?;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
        Ok(())
    }

    /// Subscribes by event name, e.g. `"downloadFinished"`.
    pub fn subscribe_named<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(name.parse()?, handler)
    }

    /// Like [`EventBus::subscribe`] but declares `kind` first when the bus
    /// was built without it.
    pub fn subscribe_dynamic<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        if registry.declared.insert(kind) {
            log::warn!("dynamically declared event kind '{kind}'");
        }
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn publish(&self, event: &Event) -> Result<()> {
        let kind = event.kind();
        let handlers = {
            let registry = self.lock();
            ensure_declared(&registry, kind)?;
            if registry.suspended.contains(&kind) {
                return Ok(());
            }
            registry.handlers.get(&kind).cloned().unwrap_or_default()
        };

        for handler in handlers {
            handler(event);
        }
        Ok(())
    }

    pub fn suspend(&self, kind: EventKind) -> Result<()> {
        let mut registry = self.lock();
        ensure_declared(&registry, kind)?;
        registry.suspended.insert(kind);
        Ok(())
    }

    pub fn resume(&self, kind: EventKind) -> Result<()> {
        let mut registry = self.lock();
        ensure_declared(&registry, kind)?;
        registry.suspended.remove(&kind);
        Ok(())
    }

    /// `true` suspends every declared kind, `false` resumes them all.
    pub fn suspend_all(&self, suspend: bool) {
        let mut registry = self.lock();
        let suspended = if suspend {
            registry.declared.clone()
        } else {
            BTreeSet::new()
        };
        registry.suspended = suspended;
    }

    pub fn is_suspended(&self, kind: EventKind) -> bool {
        self.lock().suspended.contains(&kind)
    }

    /// Drops the handlers of `kind`, or of every kind when `None`.
    pub fn clear(&self, kind: Option<EventKind>) -> Result<()> {
        let mut registry = self.lock();
        match kind {
            Some(kind) => {
                ensure_declared(&registry, kind)?;
                registry.handlers.insert(kind, Vec::new());
            }
            None => {
                for handlers in registry.handlers.values_mut() {
                    handlers.clear();
                }
            }
        }
        Ok(())
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.lock().handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Publishes an event the bus is known to declare; failures are logged.
    pub(crate) fn emit(&self, event: Event) {
        if let Err(err) = self.publish(&event) {
            log::error!("dropping {} event: {err}", event.kind());
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_all_kinds()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        f.debug_struct("EventBus")
            .field("declared", &registry.declared)
            .field("suspended", &registry.suspended)
            .finish_non_exhaustive()
    }
}

fn ensure_declared(registry: &Registry, kind: EventKind) -> Result<()> {
    if registry.declared.contains(&kind) {
        Ok(())
    } else {
        Err(ArchiveError::InvalidEventKind(kind.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn finished(source: &str) -> Event {
        Event::DownloadFinished {
            source: source.to_string(),
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::with_all_kinds();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(EventKind::DownloadFinished, move |_| {
                order.lock().unwrap().push(label)
            })
            .unwrap();
        }

        bus.publish(&finished("/a")).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn handlers_only_see_their_kind() {
        let bus = EventBus::with_all_kinds();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.subscribe(EventKind::DownloadStarted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        bus.publish(&finished("/a")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn undeclared_kind_is_rejected() {
        let bus = EventBus::new(&[EventKind::DownloadStarted]);
        let error = bus
            .subscribe(EventKind::JsonError, |_| {})
            .expect_err("jsonError was not declared");
        assert!(matches!(error, ArchiveError::InvalidEventKind(_)));
        assert!(bus.publish(&Event::DownloadQueueStarted).is_err());
        assert!(bus.subscribe_named("downloadPaused", |_| {}).is_err());
    }

    #[test]
    fn dynamic_subscription_declares_the_kind() {
        let bus = EventBus::new(&[EventKind::DownloadStarted]);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.subscribe_dynamic(EventKind::DownloadQueueStarted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&Event::DownloadQueueStarted).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(bus.kinds().contains(&EventKind::DownloadQueueStarted));
    }

    #[test]
    fn suspension_skips_handlers_without_removing_them() {
        let bus = EventBus::with_all_kinds();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.subscribe(EventKind::DownloadFinished, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        bus.suspend(EventKind::DownloadFinished).unwrap();
        bus.publish(&finished("/a")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.handler_count(EventKind::DownloadFinished), 1);

        bus.resume(EventKind::DownloadFinished).unwrap();
        bus.publish(&finished("/a")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn suspended_publish_still_validates_kind() {
        let bus = EventBus::new(&[EventKind::Downloading]);
        bus.suspend_all(true);
        assert!(bus.is_suspended(EventKind::Downloading));
        assert!(bus.publish(&finished("/a")).is_err());

        bus.suspend_all(false);
        assert!(!bus.is_suspended(EventKind::Downloading));
    }

    #[test]
    fn clear_one_kind_or_all() {
        let bus = EventBus::with_all_kinds();
        bus.subscribe(EventKind::DownloadFinished, |_| {}).unwrap();
        bus.subscribe(EventKind::DownloadStarted, |_| {}).unwrap();

        bus.clear(Some(EventKind::DownloadFinished)).unwrap();
        assert_eq!(bus.handler_count(EventKind::DownloadFinished), 0);
        assert_eq!(bus.handler_count(EventKind::DownloadStarted), 1);

        bus.clear(None).unwrap();
        assert_eq!(bus.handler_count(EventKind::DownloadStarted), 0);
    }

    #[test]
    fn handler_may_clear_the_bus_while_dispatching() {
        let bus = Arc::new(EventBus::with_all_kinds());
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_bus = Arc::clone(&bus);
        bus.subscribe(EventKind::DownloadCancelled, move |_| {
            inner_bus.clear(None).unwrap();
        })
        .unwrap();
        let counter = Arc::clone(&hits);
        bus.subscribe(EventKind::DownloadCancelled, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let event = Event::DownloadCancelled {
            source: "/a".to_string(),
        };
        bus.publish(&event).unwrap();
        // the snapshot taken before dispatch still runs to the end
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        bus.publish(&event).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
