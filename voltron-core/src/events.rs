// Event bridge
//
// Parks blocking requests and standing view subscriptions until the host
// reports a state change, then re-submits them to the worker queue in the
// order they were registered. Host hooks may fire on any thread, so the
// bridge only uses a plain mutex and non-blocking queue sends.

use crate::protocol::{ClientId, Request, SubscriptionId, ViewKind};
use crate::types::StopReason;
use crate::worker::{RequestJob, ReplySink, WorkQueue};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::AbortHandle;
use tracing::{debug, info};

pub type WaiterId = u64;

/// Normalised host notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Stopped(StopReason),
    Continued,
    Exited,
}

impl HostEvent {
    /// Stop and exit release parked requests; continuing does not.
    pub fn releases_waiters(&self) -> bool {
        matches!(self, Self::Stopped(_) | Self::Exited)
    }
}

/// Handed to the adaptor's event hook. Holds the bridge weakly so an adaptor
/// outliving its session cannot keep the bridge alive.
#[derive(Clone, Debug)]
pub struct StateNotifier {
    bridge: Weak<EventBridge>,
}

impl StateNotifier {
    pub fn notify(&self, event: HostEvent) {
        match self.bridge.upgrade() {
            Some(bridge) => bridge.notify(event),
            None => debug!("event bridge gone, dropping {:?}", event),
        }
    }

    /// A notifier not connected to any bridge
    pub fn detached() -> Self {
        Self { bridge: Weak::new() }
    }
}

struct Waiter {
    id: WaiterId,
    job: RequestJob,
    timer: Option<AbortHandle>,
}

impl Waiter {
    /// The waiter left the bridge some other way than expiring.
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct ViewSubscription {
    id: SubscriptionId,
    client: ClientId,
    view: ViewKind,
    request: Request,
    sink: ReplySink,
}

#[derive(Default)]
struct BridgeState {
    next_waiter: WaiterId,
    next_subscription: SubscriptionId,
    waiters: VecDeque<Waiter>,
    subscriptions: Vec<ViewSubscription>,
    last_event: Option<HostEvent>,
}

pub struct EventBridge {
    state: Mutex<BridgeState>,
    queue: WorkQueue,
}

impl std::fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBridge")
            .field("pending", &self.pending())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl EventBridge {
    pub fn new(queue: WorkQueue) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BridgeState::default()),
            queue,
        })
    }

    pub fn notifier(self: &Arc<Self>) -> StateNotifier {
        StateNotifier {
            bridge: Arc::downgrade(self),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a blocking request until the next stop or exit.
    pub fn park(&self, job: RequestJob) -> WaiterId {
        let mut state = self.lock();
        state.next_waiter += 1;
        let id = state.next_waiter;
        debug!("client {} parked {} as waiter {}", job.client, job.request.kind.name(), id);
        state.waiters.push_back(Waiter { id, job, timer: None });
        id
    }

    /// Attach the task that will expire waiter `id`. Aborted when the waiter
    /// is released or cancelled first, or right away if that already
    /// happened.
    pub fn arm_timer(&self, id: WaiterId, timer: AbortHandle) {
        let mut state = self.lock();
        match state.waiters.iter_mut().find(|w| w.id == id) {
            Some(waiter) => waiter.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Number of parked waiters with a live timeout.
    pub fn armed_timers(&self) -> usize {
        self.lock().waiters.iter().filter(|w| w.timer.is_some()).count()
    }

    /// Remove a waiter whose timeout elapsed. `None` if it was already
    /// released or cancelled.
    pub fn expire(&self, id: WaiterId) -> Option<RequestJob> {
        let mut state = self.lock();
        let pos = state.waiters.iter().position(|w| w.id == id)?;
        state.waiters.remove(pos).map(|w| w.job)
    }

    pub fn subscribe(
        &self,
        client: ClientId,
        view: ViewKind,
        request: Request,
        sink: ReplySink,
    ) -> SubscriptionId {
        let mut state = self.lock();
        state.next_subscription += 1;
        let id = state.next_subscription;
        info!("client {} subscribed to {} view ({})", client, view, id);
        state.subscriptions.push(ViewSubscription {
            id,
            client,
            view,
            request,
            sink,
        });
        id
    }

    pub fn unsubscribe(&self, client: ClientId, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.subscriptions.len();
        state
            .subscriptions
            .retain(|s| !(s.id == id && s.client == client));
        before != state.subscriptions.len()
    }

    /// Drop everything a disconnecting client left behind. Returns the number
    /// of waiters and subscriptions removed.
    pub fn cancel_client(&self, client: ClientId) -> usize {
        let mut state = self.lock();
        let before = state.waiters.len() + state.subscriptions.len();
        state.waiters.retain_mut(|w| {
            if w.job.client != client {
                return true;
            }
            w.disarm();
            false
        });
        state.subscriptions.retain(|s| s.client != client);
        let removed = before - (state.waiters.len() + state.subscriptions.len());
        if removed > 0 {
            debug!("cancelled {} parked item(s) for client {}", removed, client);
        }
        removed
    }

    /// Fan a host notification out to everything parked.
    pub fn notify(&self, event: HostEvent) {
        let mut state = self.lock();
        state.last_event = Some(event);
        if !event.releases_waiters() {
            debug!("host event {:?}, nothing released", event);
            return;
        }

        let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
        state.subscriptions.retain(|s| !s.sink.is_closed());
        let updates: Vec<RequestJob> = state
            .subscriptions
            .iter()
            .map(|s| RequestJob {
                client: s.client,
                request: s.request.clone(),
                sink: s.sink.clone(),
                subscription: Some(s.id),
            })
            .collect();
        drop(state);

        info!(
            "host event {:?}: releasing {} waiter(s), {} view update(s)",
            event,
            waiters.len(),
            updates.len()
        );
        for mut waiter in waiters {
            waiter.disarm();
            if waiter.job.sink.is_closed() {
                continue;
            }
            self.queue.submit(waiter.job);
        }
        for update in updates {
            self.queue.submit(update);
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn subscriptions_of(&self, client: ClientId) -> Vec<(SubscriptionId, ViewKind)> {
        self.lock()
            .subscriptions
            .iter()
            .filter(|s| s.client == client)
            .map(|s| (s.id, s.view))
            .collect()
    }

    pub fn last_event(&self) -> Option<HostEvent> {
        self.lock().last_event
    }
}
