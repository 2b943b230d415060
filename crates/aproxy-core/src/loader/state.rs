//! Loader bookkeeping, confined to the loader thread.

use super::{LoaderOptions, Message};
use crate::chunk::{ByteRange, ChunkIndex, ChunkRange};
use crate::future::StreamFuture;
use crate::item::{Item, ItemRef};
use crate::lane::{LaneReport, Priority, WorkerLane};
use crate::queue::ItemQueue;
use crate::storage::Store;
use crate::task::{Task, TaskOutcome};
use crate::upstream::ResolvedStream;
use std::collections::HashSet;
use tokio::sync::mpsc;

pub(super) struct LoaderState {
    store: Store,
    options: LoaderOptions,
    high: ItemQueue,
    low: ItemQueue,
    pending: Vec<StreamFuture>,
    /// Hashes of items with a resolve task in flight.
    resolving: HashSet<String>,
    /// (hash, chunk) pairs with a fetch task in flight.
    fetching: HashSet<(String, u32)>,
    current: Option<ItemRef>,
    in_flight_high: usize,
    resolve_lane: WorkerLane,
    fetch_lane: WorkerLane,
}

impl LoaderState {
    pub(super) fn new(
        store: Store,
        options: LoaderOptions,
        resolve_lane: WorkerLane,
        fetch_lane: WorkerLane,
    ) -> Self {
        LoaderState {
            store,
            options,
            high: ItemQueue::new(),
            low: ItemQueue::new(),
            pending: Vec::new(),
            resolving: HashSet::new(),
            fetching: HashSet::new(),
            current: None,
            in_flight_high: 0,
            resolve_lane,
            fetch_lane,
        }
    }

    /// Process messages until shutdown, then cancel whatever is pending and
    /// hand the lanes back for the caller to stop.
    pub(super) fn run(mut self, mut rx: mpsc::Receiver<Message>) -> (WorkerLane, WorkerLane) {
        while let Some(msg) = rx.blocking_recv() {
            match msg {
                Message::Shutdown => break,
                Message::Request { future, missing } => self.on_request(future, missing),
                Message::Preload { item, missing } => {
                    self.low.add_item(&item, &missing);
                }
                Message::LogPlayback { url } => {
                    let item = self.store.get_metadata(&url);
                    self.submit_playcount(item);
                }
                Message::Report(report) => self.on_report(report),
            }
            self.process_queues();
        }

        drop(rx);
        for future in self.pending.drain(..) {
            future.cancel();
        }
        (self.resolve_lane, self.fetch_lane)
    }

    fn on_request(&mut self, future: StreamFuture, missing: ChunkIndex) {
        let item = ItemRef::clone(future.item());
        self.pending.push(future);
        self.low.remove(&item);

        let switched = self
            .current
            .as_ref()
            .map_or(true, |current| current.hash() != item.hash());
        if switched {
            tracing::debug!(url = item.url(), "current item changed");
            self.current = Some(ItemRef::clone(&item));
            if !self.fetch_lane.drop_low_priority() {
                tracing::debug!("fetch lane busy, low priority tasks kept");
            }
            self.submit_playcount(ItemRef::clone(&item));
        }
        self.high.add_item(&item, &missing);
        // Chunks may have landed between the caller's lookup and now.
        self.fulfill_pending();
    }

    fn on_report(&mut self, report: LaneReport) {
        match report {
            LaneReport::Finished {
                task,
                priority,
                outcome,
            } => {
                self.task_done(&task, priority);
                match (task, outcome) {
                    (Task::Resolve { item }, TaskOutcome::Resolved(resolved)) => {
                        self.on_resolved(item, resolved)
                    }
                    (Task::Fetch { item, chunk }, TaskOutcome::Fetched(data)) => {
                        self.on_fetched(item, chunk, data, priority)
                    }
                    (Task::LogPlayback { item }, _) => {
                        tracing::debug!(url = item.url(), "playback logged");
                    }
                    (task, outcome) => {
                        tracing::error!(?task, ?outcome, "outcome does not match task");
                    }
                }
            }
            LaneReport::GaveUp {
                task,
                priority,
                error,
            } => {
                tracing::warn!(?task, "task gave up: {}", error);
                self.task_done(&task, priority);
                self.resurface(task, priority);
            }
            LaneReport::Dropped { tasks } => {
                tracing::debug!(count = tasks.len(), "low priority tasks dropped");
                for task in tasks {
                    self.task_done(&task, Priority::Low);
                    self.resurface(task, Priority::Low);
                }
            }
        }
    }

    /// Clear in-flight markers for a task that left its lane.
    fn task_done(&mut self, task: &Task, priority: Priority) {
        if priority == Priority::High && !matches!(task, Task::LogPlayback { .. }) {
            self.in_flight_high = self.in_flight_high.saturating_sub(1);
        }
        match task {
            Task::Resolve { item } => {
                self.resolving.remove(item.hash());
            }
            Task::Fetch { item, chunk } => {
                self.fetching.remove(&(item.hash().to_string(), *chunk));
            }
            Task::LogPlayback { .. } => {}
        }
    }

    /// Put work that did not complete back into its queue.
    fn resurface(&mut self, task: Task, priority: Priority) {
        match task {
            Task::Fetch { item, chunk } => {
                if item.is_available() {
                    self.requeue(&item, chunk, priority);
                } else {
                    self.drop_item(&item);
                }
            }
            // The item is still queued; the next pass resolves again.
            Task::Resolve { item } => {
                if !item.is_available() {
                    self.drop_item(&item);
                }
            }
            Task::LogPlayback { item } => {
                tracing::debug!(url = item.url(), "playback not logged");
            }
        }
    }

    fn on_resolved(&mut self, item: ItemRef, resolved: Option<ResolvedStream>) {
        match resolved {
            Some(resolved) => {
                if !self.store.store_metadata(&item, &resolved) {
                    tracing::warn!(url = item.url(), "metadata kept in memory only");
                }
                self.fulfill_pending();
            }
            None => {
                tracing::debug!(url = item.url(), "canceling load of unavailable item");
                self.drop_item(&item);
            }
        }
    }

    fn on_fetched(&mut self, item: ItemRef, chunk: u32, data: Option<Vec<u8>>, priority: Priority) {
        let Some(data) = data else {
            if item.is_available() {
                self.requeue(&item, chunk, priority);
            } else {
                self.drop_item(&item);
            }
            return;
        };

        // Serve exact matches straight from the buffer before touching disk.
        let arrived = self.clip(&item, ChunkRange::new(chunk, 1).byte_range(self.store.chunk_size()));
        self.pending.retain(|f| {
            let exact = f.item().hash() == item.hash()
                && arrived.is_some()
                && Self::clip_to(item.content_length(), f.range()) == arrived;
            if exact {
                f.set_data(data.clone());
            }
            !exact
        });

        if !self.store.append_chunk(item.url(), &data, chunk) {
            let lost = !self
                .store
                .compute_missing_chunks(item.url(), ChunkRange::new(chunk, 1))
                .is_empty();
            if let (true, Some(arrived)) = (lost, arrived) {
                self.settle_from_buffer(&item, arrived, &data);
            }
        }
        self.fulfill_pending();
    }

    /// The chunk at `arrived` could not be stored. Hand its bytes to every
    /// pending future of `item` that starts inside it, possibly short, and
    /// cancel the ones that start earlier but still need it.
    fn settle_from_buffer(&mut self, item: &Item, arrived: ByteRange, data: &[u8]) {
        let length = item.content_length();
        let buffered = arrived.start + data.len() as u64;
        self.pending.retain(|f| {
            if f.item().hash() != item.hash() || f.is_settled() {
                return true;
            }
            let Some(wanted) = Self::clip_to(length, f.range()) else {
                return true;
            };
            if wanted.intersection(&arrived).is_none() {
                return true;
            }
            if wanted.start >= arrived.start && wanted.start < buffered {
                let from = (wanted.start - arrived.start) as usize;
                let to = (wanted.end().min(buffered) - arrived.start) as usize;
                tracing::debug!(future = ?f, "storage unavailable, serving from memory");
                f.set_data(data[from..to].to_vec());
            } else {
                tracing::debug!(future = ?f, "storage unavailable, chunk lost");
                f.cancel();
            }
            false
        });
    }

    /// Settle every pending future whose range is now fully stored; prune
    /// settled, abandoned and unservable ones.
    fn fulfill_pending(&mut self) {
        let cs = self.store.chunk_size();
        let mut ready = Vec::new();
        let mut wanted: Vec<(ItemRef, ChunkIndex)> = Vec::new();
        let store = &self.store;
        let fetching = &self.fetching;

        self.pending.retain(|f| {
            if f.is_settled() {
                return false;
            }
            if f.is_abandoned() {
                tracing::debug!(future = ?f, "requester gone, dropping future");
                return false;
            }
            let item = f.item();
            if !item.is_available() {
                f.cancel();
                return false;
            }
            let length = item.content_length();
            if length > 0 && f.range().start >= length {
                tracing::debug!(future = ?f, length, "range beyond content, canceling");
                f.cancel();
                return false;
            }
            let mut missing = store.compute_missing_chunks(item.url(), f.range().chunk_range(cs));
            if missing.is_empty() {
                ready.push(f.clone());
                return false;
            }
            let in_flight: ChunkIndex = missing
                .iter()
                .filter(|&n| fetching.contains(&(item.hash().to_string(), n)))
                .collect();
            missing.subtract(&in_flight);
            if !missing.is_empty() {
                wanted.push((ItemRef::clone(item), missing));
            }
            true
        });

        for (item, missing) in wanted {
            self.high.add_item(&item, &missing);
        }
        for future in ready {
            let store = self.store.clone();
            tokio::task::spawn_blocking(move || {
                match store.read_bytes(future.item().url(), future.range()) {
                    Ok(data) => {
                        future.set_data(data);
                    }
                    Err(e) => {
                        tracing::warn!(future = ?future, "reading stored range failed: {:#}", e);
                        future.cancel();
                    }
                }
            });
        }
    }

    fn process_queues(&mut self) {
        self.process_queue(Priority::High);
        if self.in_flight_high > 0 {
            tracing::trace!(in_flight = self.in_flight_high, "high priority work in flight, skipping low queue");
            return;
        }
        self.process_queue(Priority::Low);
    }

    fn process_queue(&mut self, priority: Priority) {
        for item in self.queue(priority).items() {
            if !item.is_available() {
                self.queue(priority).remove(&item);
                continue;
            }
            if self.store.complete_file(item.url()).is_some() {
                self.queue(priority).remove(&item);
                continue;
            }
            let redirect_valid = item
                .record()
                .is_redirect_valid(self.options.honor_redirect_expiry);
            let submitted = if redirect_valid {
                match self.next_chunk(priority, &item) {
                    Some(chunk) => self.submit_fetch(item, chunk, priority),
                    None => true,
                }
            } else {
                self.submit_resolve(item, priority)
            };
            if !submitted {
                break;
            }
        }
    }

    /// Pop the lowest queued chunk that is neither stored, in flight, nor
    /// past the end of the content.
    fn next_chunk(&mut self, priority: Priority, item: &Item) -> Option<u32> {
        let cs = self.store.chunk_size();
        loop {
            let chunk = self.queue(priority).pop_first_missing(item)?;
            let record = item.record();
            let beyond = record.last_chunk(cs).map_or(false, |last| chunk > last);
            let busy = self.fetching.contains(&(item.hash().to_string(), chunk));
            if !beyond && !busy && !record.has_chunk(chunk) {
                return Some(chunk);
            }
        }
    }

    /// Returns false when the lane is saturated and the pass should stop.
    fn submit_fetch(&mut self, item: ItemRef, chunk: u32, priority: Priority) -> bool {
        let key = (item.hash().to_string(), chunk);
        let task = Task::Fetch { item, chunk };
        match self.fetch_lane.submit(task, priority) {
            Ok(()) => {
                self.fetching.insert(key);
                if priority == Priority::High {
                    self.in_flight_high += 1;
                }
                true
            }
            Err(task) => {
                tracing::debug!(?task, "fetch lane full");
                let item = ItemRef::clone(task.item());
                self.queue(priority).add_item(&item, &ChunkIndex::from_span(chunk, 1));
                false
            }
        }
    }

    fn submit_resolve(&mut self, item: ItemRef, priority: Priority) -> bool {
        if self.resolving.contains(item.hash()) {
            return true;
        }
        let hash = item.hash().to_string();
        match self.resolve_lane.submit(Task::Resolve { item }, priority) {
            Ok(()) => {
                self.resolving.insert(hash);
                if priority == Priority::High {
                    self.in_flight_high += 1;
                }
                true
            }
            Err(task) => {
                tracing::debug!(?task, "resolve lane full");
                false
            }
        }
    }

    fn submit_playcount(&mut self, item: ItemRef) {
        if !item.is_available() {
            tracing::debug!(url = item.url(), "not logging playback of unavailable item");
            return;
        }
        if let Err(task) = self.resolve_lane.submit(Task::LogPlayback { item }, Priority::Low) {
            tracing::warn!(?task, "could not queue playback log");
        }
    }

    /// Queue `chunk` again, at high priority if a player is waiting on it.
    fn requeue(&mut self, item: &ItemRef, chunk: u32, priority: Priority) {
        let wanted = self.pending.iter().any(|f| {
            f.item().hash() == item.hash()
                && !f.is_settled()
                && f.range().chunk_range(self.store.chunk_size()).to_index().contains(chunk)
        });
        let priority = if wanted { Priority::High } else { priority };
        self.queue(priority).add_item(item, &ChunkIndex::from_span(chunk, 1));
    }

    /// Forget an item that went away upstream.
    fn drop_item(&mut self, item: &Item) {
        self.pending.retain(|f| {
            if f.item().hash() == item.hash() {
                f.cancel();
                false
            } else {
                true
            }
        });
        self.high.remove(item);
        self.low.remove(item);
    }

    fn queue(&mut self, priority: Priority) -> &mut ItemQueue {
        match priority {
            Priority::High => &mut self.high,
            Priority::Low => &mut self.low,
        }
    }

    fn clip(&self, item: &Item, range: ByteRange) -> Option<ByteRange> {
        Self::clip_to(item.content_length(), range)
    }

    fn clip_to(length: u64, range: ByteRange) -> Option<ByteRange> {
        if length == 0 {
            return Some(range);
        }
        range.intersection(&ByteRange::new(0, length))
    }
}
