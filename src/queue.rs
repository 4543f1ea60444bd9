use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::events::{Event, EventBus};

/// Lifecycle of a single transfer. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferState {
    Queued,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    id: u64,
    pub source: String,
    pub destination: PathBuf,
    pub state: TransferState,
    pub bytes_total: Option<u64>,
    pub bytes_transferred: u64,
}

impl Transfer {
    fn new(id: u64, source: String, destination: PathBuf) -> Self {
        Self {
            id,
            source,
            destination,
            state: TransferState::Queued,
            bytes_total: None,
            bytes_transferred: 0,
        }
    }

    /// Identifier unique within the queue that issued it.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn advance(&mut self, next: TransferState) {
        if self.state.is_terminal() || next <= self.state {
            log::debug!(
                "ignoring transition {:?} -> {next:?} for {}",
                self.state,
                self.source
            );
            return;
        }
        self.state = next;
    }
}

/// Performs one transfer taken from the head of a [`TransferQueue`].
pub trait TransferExecutor {
    /// Runs the transfer to a terminal state.
    fn execute(&self, transfer: &Transfer) -> TransferState;
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Transfer>,
    finished: Vec<Transfer>,
    announced_cancels: HashSet<u64>,
    next_id: u64,
    /// Set while `start` drains the queue; removals are only logged then.
    running: bool,
}

/// FIFO of pending downloads, shared between the driver and event handlers.
///
/// Cloning yields another handle to the same queue. The lock is never held
/// while events are published, so handlers may call back into the queue.
#[derive(Clone)]
pub struct TransferQueue {
    state: Arc<Mutex<QueueState>>,
    bus: Arc<EventBus>,
}

impl TransferQueue {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            bus,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Appends a transfer and returns its id.
    pub fn enqueue(&self, source: impl Into<String>, destination: impl Into<PathBuf>) -> u64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let transfer = Transfer::new(id, source.into(), destination.into());
        log::debug!(
            "queued {} -> {}",
            transfer.source,
            transfer.destination.display()
        );
        state.pending.push_back(transfer);
        id
    }

    /// True when any queued source contains `source`.
    pub fn is_queued(&self, source: &str) -> bool {
        self.lock()
            .pending
            .iter()
            .any(|transfer| transfer.source.contains(source))
    }

    /// Removes the first transfer whose source contains `source`.
    ///
    /// A transfer that is already running notices the removal after its
    /// current chunk and stops. Removals made while [`start`](Self::start)
    /// is not running leave no record behind.
    pub fn remove(&self, source: &str) -> Option<Transfer> {
        let mut state = self.lock();
        let index = state
            .pending
            .iter()
            .position(|transfer| transfer.source.contains(source))?;
        let mut transfer = state.pending.remove(index)?;
        transfer.advance(TransferState::Cancelled);
        if state.running {
            state.finished.push(transfer.clone());
        }
        Some(transfer)
    }

    /// Removes a transfer and announces `downloadCancelled` for it.
    ///
    /// Clears the queue and every event subscription once nothing is left.
    pub fn cancel(&self, source: &str) -> bool {
        let Some(transfer) = self.remove(source) else {
            log::debug!("cancel requested for {source}, which is not queued");
            return false;
        };
        {
            let mut state = self.lock();
            if state.running {
                state.announced_cancels.insert(transfer.id);
            }
        }

        log::info!("cancelled {}", transfer.source);
        self.bus.emit(Event::DownloadCancelled {
            source: transfer.source,
        });

        if self.is_empty() {
            self.clear();
        }
        true
    }

    /// Drops every pending transfer and every event subscription.
    pub fn clear(&self) {
        self.lock().pending.clear();
        if let Err(err) = self.bus.clear(None) {
            log::warn!("could not clear event subscriptions: {err}");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Transfer> {
        self.lock().pending.iter().cloned().collect()
    }

    /// State of the first queued transfer whose source contains `source`.
    pub fn state(&self, source: &str) -> Option<TransferState> {
        self.lock()
            .pending
            .iter()
            .find(|transfer| transfer.source.contains(source))
            .map(|transfer| transfer.state)
    }

    /// Executes queued transfers one at a time until the queue is empty.
    ///
    /// Returns the terminal record of every transfer that left the queue
    /// while it ran, in the order they left.
    pub fn start(&self, executor: &dyn TransferExecutor) -> Vec<Transfer> {
        self.lock().running = true;
        log::info!("download queue started with {} transfer(s)", self.len());
        self.bus.emit(Event::DownloadQueueStarted);

        while let Some(transfer) = self.begin_next() {
            prepare_destination(&transfer);
            let outcome = executor.execute(&transfer);
            if self.finish(transfer.id, outcome).is_some() {
                log::debug!("{} left in queue by executor; removed", transfer.source);
            }
        }

        let finished = {
            let mut state = self.lock();
            state.announced_cancels.clear();
            state.running = false;
            std::mem::take(&mut state.finished)
        };
        log::info!("download queue finished");
        self.bus.emit(Event::DownloadQueueFinished);
        self.clear();
        finished
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.lock().pending.iter().any(|transfer| transfer.id == id)
    }

    pub(crate) fn record_progress(&self, id: u64, total: Option<u64>, transferred: u64) {
        let mut state = self.lock();
        if let Some(transfer) = state.pending.iter_mut().find(|transfer| transfer.id == id) {
            transfer.bytes_total = total;
            transfer.bytes_transferred = transferred;
        }
    }

    /// Moves a transfer out of the queue into the finished log.
    pub(crate) fn finish(&self, id: u64, outcome: TransferState) -> Option<Transfer> {
        let mut state = self.lock();
        let index = state.pending.iter().position(|transfer| transfer.id == id)?;
        let mut transfer = state.pending.remove(index)?;
        transfer.advance(outcome);
        if state.running {
            state.finished.push(transfer.clone());
        }
        Some(transfer)
    }

    /// True once per transfer whose cancellation was already announced.
    pub(crate) fn take_cancel_notice(&self, id: u64) -> bool {
        self.lock().announced_cancels.remove(&id)
    }

    fn begin_next(&self) -> Option<Transfer> {
        let mut state = self.lock();
        let head = state.pending.front_mut()?;
        head.advance(TransferState::InProgress);
        Some(head.clone())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for TransferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferQueue")
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

fn prepare_destination(transfer: &Transfer) {
    if !transfer.destination.is_file() {
        return;
    }
    if let Err(err) = fs::remove_file(&transfer.destination) {
        log::warn!(
            "could not remove existing {}: {err}",
            transfer.destination.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn queue_with_recorder() -> (TransferQueue, Arc<Mutex<Vec<Event>>>) {
        let bus = Arc::new(EventBus::with_all_kinds());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let sink = Arc::clone(&seen);
            bus.subscribe(kind, move |event| sink.lock().unwrap().push(event.clone()))
                .unwrap();
        }
        (TransferQueue::new(bus), seen)
    }

    struct Outcome(TransferState);

    impl TransferExecutor for Outcome {
        fn execute(&self, _transfer: &Transfer) -> TransferState {
            self.0
        }
    }

    #[test]
    fn transfers_run_in_fifo_order() {
        let (queue, _) = queue_with_recorder();
        queue.enqueue("/a/files/1.img", "/tmp/1.img");
        queue.enqueue("/a/files/2.img", "/tmp/2.img");

        let order = Mutex::new(Vec::new());
        struct Recorder<'a>(&'a Mutex<Vec<String>>);
        impl TransferExecutor for Recorder<'_> {
            fn execute(&self, transfer: &Transfer) -> TransferState {
                assert_eq!(transfer.state, TransferState::InProgress);
                self.0.lock().unwrap().push(transfer.source.clone());
                TransferState::Completed
            }
        }

        let finished = queue.start(&Recorder(&order));
        assert_eq!(
            *order.lock().unwrap(),
            vec!["/a/files/1.img".to_string(), "/a/files/2.img".to_string()]
        );
        assert_eq!(finished.len(), 2);
        assert!(finished
            .iter()
            .all(|transfer| transfer.state == TransferState::Completed));
        assert!(queue.is_empty());
    }

    #[test]
    fn membership_and_removal_match_substrings() {
        let (queue, _) = queue_with_recorder();
        queue.enqueue("/projects/P1/experiments/E1/scans/4/files?format=zip", "/tmp/a.zip");
        queue.enqueue("/projects/P1/experiments/E2/scans/1/files/x.dcm", "/tmp/x.dcm");

        assert!(queue.is_queued("E1/scans/4"));
        assert!(!queue.is_queued("E3"));

        let removed = queue.remove("x.dcm").expect("x.dcm is queued");
        assert_eq!(removed.state, TransferState::Cancelled);
        assert_eq!(queue.len(), 1);
        assert!(queue.remove("x.dcm").is_none());
    }

    #[test]
    fn cancel_announces_once_and_clears_when_empty() {
        let (queue, seen) = queue_with_recorder();
        queue.enqueue("/a/files/1.img", "/tmp/1.img");
        queue.enqueue("/a/files/2.img", "/tmp/2.img");

        assert!(queue.cancel("1.img"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Event::DownloadCancelled {
                source: "/a/files/1.img".to_string()
            }]
        );
        assert_eq!(queue.events().handler_count(EventKind::DownloadCancelled), 1);

        assert!(!queue.cancel("1.img"));
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(queue.cancel("2.img"));
        assert!(queue.is_empty());
        assert_eq!(queue.events().handler_count(EventKind::DownloadCancelled), 0);
    }

    #[test]
    fn start_brackets_run_with_queue_events() {
        let (queue, seen) = queue_with_recorder();
        queue.enqueue("/a/files/1.img", "/tmp/1.img");

        let finished = queue.start(&Outcome(TransferState::Failed));

        assert_eq!(finished[0].state, TransferState::Failed);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Event::DownloadQueueStarted, Event::DownloadQueueFinished]
        );
        // subscriptions are dropped once the run is over
        assert_eq!(queue.events().handler_count(EventKind::DownloadQueueStarted), 0);
    }

    #[test]
    fn existing_destination_is_removed_before_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("1.img");
        fs::write(&destination, b"stale").unwrap();

        let (queue, _) = queue_with_recorder();
        queue.enqueue("/a/files/1.img", &destination);

        struct ExpectsFreshDestination;
        impl TransferExecutor for ExpectsFreshDestination {
            fn execute(&self, transfer: &Transfer) -> TransferState {
                assert!(!transfer.destination.exists());
                TransferState::Completed
            }
        }
        queue.start(&ExpectsFreshDestination);
    }

    #[test]
    fn removals_before_start_are_not_reported_by_it() {
        let (queue, seen) = queue_with_recorder();
        queue.enqueue("/a/files/1.img", "/tmp/1.img");
        queue.enqueue("/a/files/2.img", "/tmp/2.img");
        queue.enqueue("/a/files/3.img", "/tmp/3.img");

        assert!(queue.remove("1.img").is_some());
        assert!(queue.cancel("2.img"));
        assert_eq!(seen.lock().unwrap().len(), 1);

        let finished = queue.start(&Outcome(TransferState::Completed));
        let sources: Vec<_> = finished
            .iter()
            .map(|transfer| transfer.source.as_str())
            .collect();
        assert_eq!(sources, vec!["/a/files/3.img"]);

        let state = queue.lock();
        assert!(state.finished.is_empty());
        assert!(state.announced_cancels.is_empty());
        assert!(!state.running);
    }

    #[test]
    fn states_never_move_backwards() {
        let mut transfer = Transfer::new(0, "s".into(), "d".into());
        transfer.advance(TransferState::InProgress);
        transfer.advance(TransferState::Queued);
        assert_eq!(transfer.state, TransferState::InProgress);
        transfer.advance(TransferState::Completed);
        transfer.advance(TransferState::Failed);
        assert_eq!(transfer.state, TransferState::Completed);
    }
}
