//! Cell content loading.
//!
//! The policy never talks to a loader directly. It asks the
//! [`LevelStreamer`] to move cells, the streamer issues load requests to a
//! [`CellLoader`], and loaders report back through a [`LoadCompletion`]
//! that sends exactly one [`LoadOutcome`] over a channel. Completions are
//! drained on the tick thread, so a loader may finish on any thread.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::cell::{CellHandle, CellState, LoadResolution, RuntimeCell, RuntimeCellState};
use crate::config::StreamConfig;
use crate::index::CellIndex;

/// Upper bound on completion/visibility passes during a blocking flush.
const MAX_FLUSH_PASSES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub handle: CellHandle,
    pub result: Result<(), String>,
}

/// One-shot completion for a load request. Dropping it unfired reports the
/// load as abandoned, so every request resolves exactly once.
#[derive(Debug)]
pub struct LoadCompletion {
    handle: CellHandle,
    sender: Option<Sender<LoadOutcome>>,
}

impl LoadCompletion {
    fn new(handle: CellHandle, sender: Sender<LoadOutcome>) -> Self {
        Self {
            handle,
            sender: Some(sender),
        }
    }

    pub fn handle(&self) -> CellHandle {
        self.handle
    }

    pub fn complete(mut self, result: Result<(), String>) {
        self.send(result);
    }

    pub fn succeed(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.complete(Err(reason.into()));
    }

    fn send(&mut self, result: Result<(), String>) {
        if let Some(sender) = self.sender.take() {
            let outcome = LoadOutcome {
                handle: self.handle,
                result,
            };
            if sender.send(outcome).is_err() {
                tracing::debug!(handle = ?self.handle, "load completed after streamer shut down");
            }
        }
    }
}

impl Drop for LoadCompletion {
    fn drop(&mut self) {
        self.send(Err("load request abandoned".to_owned()));
    }
}

/// Backend that brings cell content into memory.
pub trait CellLoader {
    /// Start loading; `completion` must eventually fire (or be dropped).
    fn request_load(&mut self, handle: CellHandle, name: &str, completion: LoadCompletion);

    /// Finish all outstanding requests before returning.
    fn flush(&mut self);

    /// Content of an unloaded cell may be freed.
    fn release(&mut self, _handle: CellHandle, _name: &str) {}

    /// Requests issued but not yet completed.
    fn pending(&self) -> usize {
        0
    }
}

/// Completes every request on the spot. Cells named in `failing` fail.
#[derive(Debug, Default)]
pub struct ImmediateLoader {
    failing: HashSet<String>,
    requests: usize,
    releases: usize,
}

impl ImmediateLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> usize {
        self.requests
    }

    pub fn releases(&self) -> usize {
        self.releases
    }
}

impl CellLoader for ImmediateLoader {
    fn request_load(&mut self, _handle: CellHandle, name: &str, completion: LoadCompletion) {
        self.requests += 1;
        if self.failing.contains(name) {
            completion.fail(format!("content for {name} is missing"));
        } else {
            completion.succeed();
        }
    }

    fn flush(&mut self) {}

    fn release(&mut self, _handle: CellHandle, _name: &str) {
        self.releases += 1;
    }
}

#[derive(Debug, Default)]
struct DeferredQueue {
    queue: VecDeque<(String, LoadCompletion)>,
    failing: HashSet<String>,
    released: Vec<String>,
}

impl DeferredQueue {
    fn complete_front(&mut self) -> bool {
        let Some((name, completion)) = self.queue.pop_front() else {
            return false;
        };
        if self.failing.contains(&name) {
            completion.fail(format!("content for {name} is corrupt"));
        } else {
            completion.succeed();
        }
        true
    }
}

/// Queues requests until told to complete them. Clones share the queue, so
/// a test keeps one handle while the subsystem owns another.
#[derive(Debug, Clone, Default)]
pub struct DeferredLoader {
    inner: Rc<RefCell<DeferredQueue>>,
}

impl DeferredLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads of `name` fail until [`DeferredLoader::heal`] is called.
    pub fn fail(&self, name: impl Into<String>) {
        self.inner.borrow_mut().failing.insert(name.into());
    }

    pub fn heal(&self, name: &str) {
        self.inner.borrow_mut().failing.remove(name);
    }

    /// Complete up to `n` queued requests in request order.
    pub fn complete_next(&self, n: usize) -> usize {
        let mut inner = self.inner.borrow_mut();
        (0..n).take_while(|_| inner.complete_front()).count()
    }

    pub fn complete_all(&self) -> usize {
        let mut inner = self.inner.borrow_mut();
        let mut done = 0;
        while inner.complete_front() {
            done += 1;
        }
        done
    }

    pub fn queued(&self) -> Vec<String> {
        self.inner
            .borrow()
            .queue
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn released(&self) -> Vec<String> {
        self.inner.borrow().released.clone()
    }
}

impl CellLoader for DeferredLoader {
    fn request_load(&mut self, _handle: CellHandle, name: &str, completion: LoadCompletion) {
        self.inner
            .borrow_mut()
            .queue
            .push_back((name.to_owned(), completion));
    }

    fn flush(&mut self) {
        self.complete_all();
    }

    fn release(&mut self, _handle: CellHandle, name: &str) {
        self.inner.borrow_mut().released.push(name.to_owned());
    }

    fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellEventKind {
    Loaded,
    /// The cell became part of the live world.
    Shown,
    /// The cell left the live world.
    Hidden,
    Unloaded,
    LoadFailed { attempt: u32, reason: String },
    PermanentlyFailed { attempts: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellEvent {
    pub handle: CellHandle,
    pub cell: String,
    pub kind: CellEventKind,
}

/// Drives cell content and visibility transitions on behalf of the policy.
pub struct LevelStreamer {
    loader: Box<dyn CellLoader>,
    sender: Sender<LoadOutcome>,
    receiver: Receiver<LoadOutcome>,
    loading: HashSet<CellHandle>,
    /// Cells with visibility or unload work outstanding.
    watch: HashSet<CellHandle>,
    activation_order: Vec<CellHandle>,
    current_activation: Option<CellHandle>,
    events: Vec<CellEvent>,
}

impl LevelStreamer {
    pub fn new(loader: Box<dyn CellLoader>) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            loader,
            sender,
            receiver,
            loading: HashSet::new(),
            watch: HashSet::new(),
            activation_order: Vec::new(),
            current_activation: None,
            events: Vec::new(),
        }
    }

    pub fn loading_count(&self) -> usize {
        self.loading.len()
    }

    pub fn is_loading(&self, handle: CellHandle) -> bool {
        self.loading.contains(&handle)
    }

    /// The cell partway through activation, if any.
    pub fn current_activation(&self) -> Option<CellHandle> {
        self.current_activation
    }

    pub fn set_activation_order(&mut self, order: Vec<CellHandle>) {
        self.activation_order = order;
    }

    pub fn drain_events(&mut self) -> Vec<CellEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn load(&mut self, handle: CellHandle, cell: &mut RuntimeCell) -> bool {
        let was = cell.state();
        let changed = cell.load();
        self.after_transition(handle, cell, was);
        changed
    }

    pub fn activate(&mut self, handle: CellHandle, cell: &mut RuntimeCell) -> bool {
        let was = cell.state();
        let changed = cell.activate();
        self.after_transition(handle, cell, was);
        changed
    }

    pub fn deactivate(&mut self, handle: CellHandle, cell: &mut RuntimeCell) -> bool {
        let was = cell.state();
        let changed = cell.deactivate();
        self.after_transition(handle, cell, was);
        changed
    }

    pub fn unload(&mut self, handle: CellHandle, cell: &mut RuntimeCell) -> bool {
        let was = cell.state();
        let changed = cell.unload();
        self.after_transition(handle, cell, was);
        changed
    }

    fn after_transition(&mut self, handle: CellHandle, cell: &RuntimeCell, was: CellState) {
        let now = cell.state();
        if was != CellState::Loading && now == CellState::Loading {
            tracing::debug!(cell = %cell.name, "requesting cell load");
            self.loading.insert(handle);
            let completion = LoadCompletion::new(handle, self.sender.clone());
            self.loader.request_load(handle, &cell.name, completion);
        }
        if self.current_activation == Some(handle) && now != CellState::Activating {
            self.current_activation = None;
        }
        self.watch.insert(handle);
    }

    /// Apply completions that arrived since the last call.
    pub fn drain_completions(&mut self, index: &mut CellIndex, tick: u64, config: &StreamConfig) {
        while let Ok(outcome) = self.receiver.try_recv() {
            self.loading.remove(&outcome.handle);
            let Some(cell) = index.cell_mut(outcome.handle) else {
                tracing::trace!(handle = ?outcome.handle, "completion for a cell that no longer exists");
                continue;
            };
            let reason = outcome.result.as_ref().err().cloned().unwrap_or_default();
            let kind = match cell.on_load_completed(outcome.result, tick, config) {
                LoadResolution::Loaded => {
                    tracing::debug!(cell = %cell.name, "cell loaded");
                    CellEventKind::Loaded
                }
                LoadResolution::Retrying {
                    attempt,
                    retry_at_tick,
                } => {
                    tracing::warn!(cell = %cell.name, attempt, retry_at_tick, %reason, "cell load failed");
                    CellEventKind::LoadFailed { attempt, reason }
                }
                LoadResolution::PermanentlyFailed { attempts } => {
                    tracing::warn!(cell = %cell.name, attempts, %reason, "cell load failed permanently");
                    CellEventKind::PermanentlyFailed { attempts, reason }
                }
                LoadResolution::Stale => continue,
            };
            self.events.push(CellEvent {
                handle: outcome.handle,
                cell: cell.name.clone(),
                kind,
            });
            self.watch.insert(outcome.handle);
        }
    }

    /// Drain completions and do the host-side visibility work: finish
    /// deactivations and unloads, then activate cells in priority order
    /// within the per-tick work budget.
    pub fn process(&mut self, index: &mut CellIndex, tick: u64, config: &StreamConfig) {
        self.drain_completions(index, tick, config);

        let mut watched: Vec<CellHandle> = self.watch.iter().copied().collect();
        watched.sort();

        for &handle in &watched {
            let Some(cell) = index.cell_mut(handle) else {
                continue;
            };
            if cell.finish_deactivation() {
                self.push_event(handle, cell, CellEventKind::Hidden);
            }
            cell.start_pending_unload();
            if cell.state() == CellState::Unloading && cell.finish_unload() {
                self.loader.release(handle, &cell.name);
                self.push_event(handle, cell, CellEventKind::Unloaded);
            }
        }

        self.run_activations(index, &watched, config.activation_work_per_tick);

        self.watch.retain(|&handle| {
            index.cell(handle).is_some_and(|cell| {
                matches!(
                    cell.state(),
                    CellState::Loading
                        | CellState::Activating
                        | CellState::Deactivating
                        | CellState::Unloading
                ) || cell.has_pending_unload()
            })
        });
    }

    fn run_activations(
        &mut self,
        index: &mut CellIndex,
        watched: &[CellHandle],
        budget: Option<u32>,
    ) {
        let mut order: Vec<CellHandle> = Vec::new();
        order.extend(self.current_activation);
        order.extend(self.activation_order.iter().copied());
        order.extend(watched.iter().copied());

        let mut remaining = budget;
        let mut seen = HashSet::new();
        for handle in order {
            if !seen.insert(handle) {
                continue;
            }
            if remaining == Some(0) {
                break;
            }
            let Some(cell) = index.cell_mut(handle) else {
                continue;
            };
            if cell.state() != CellState::Activating {
                continue;
            }
            let cost = (cell.actors.len() as u32).max(1);
            let needed = cost.saturating_sub(cell.activation_work_done);
            let spent = remaining.map_or(needed, |r| r.min(needed));
            cell.activation_work_done += spent;
            if let Some(r) = remaining.as_mut() {
                *r -= spent;
            }
            if cell.activation_work_done >= cost {
                cell.finish_activation();
                if self.current_activation == Some(handle) {
                    self.current_activation = None;
                }
                self.push_event(handle, cell, CellEventKind::Shown);
            } else {
                self.current_activation = Some(handle);
            }
        }
    }

    fn push_event(&mut self, handle: CellHandle, cell: &RuntimeCell, kind: CellEventKind) {
        tracing::trace!(cell = %cell.name, ?kind, "cell event");
        self.events.push(CellEvent {
            handle,
            cell: cell.name.clone(),
            kind,
        });
    }

    /// Bounded synchronous drain of in-flight work, ignoring the per-tick
    /// activation budget.
    pub fn flush(&mut self, index: &mut CellIndex, tick: u64, config: &StreamConfig) {
        let _span = tracing::debug_span!("stream_flush").entered();
        let unbounded = StreamConfig {
            activation_work_per_tick: None,
            ..config.clone()
        };
        for _ in 0..MAX_FLUSH_PASSES {
            self.loader.flush();
            self.process(index, tick, &unbounded);
            if self.loading.is_empty() && self.loader.pending() == 0 {
                break;
            }
        }
    }

    /// Release everything resident and forget outstanding work.
    pub fn teardown(&mut self, index: &mut CellIndex) {
        self.loader.flush();
        while self.receiver.try_recv().is_ok() {}
        for (handle, cell) in index.iter() {
            if cell.runtime_state() != RuntimeCellState::Unloaded {
                self.loader.release(handle, &cell.name);
            }
        }
        self.loading.clear();
        self.watch.clear();
        self.activation_order.clear();
        self.current_activation = None;
    }
}
