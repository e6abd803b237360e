// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use sip_core::{Method, Request, Response};
use sip_parse::cseq;
use sip_transport::{TransportPort, TransportTarget};
use smol_str::SmolStr;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

use crate::{
    fsm::{ClientAction, ClientEvent, ClientFsm, ServerAction, ServerEvent, ServerFsm},
    ids::IdGenerator,
    request_branch_id,
    timers::{schedule, TimerDefaults, TimerHandle, TransportAwareTimers},
    top_via, ClientTransactionState, ServerTransactionState, TerminationCause, TransactionError,
    TransactionKey, TransactionTimer,
};

/// What a transaction reports to its owner.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    ProvisionalReceived(Response),
    SuccessReceived(Response),
    ErrorReceived(Response),
    Timeout,
    TransportError,
}

impl TransactionEvent {
    fn from_response(response: Response) -> Self {
        if response.is_provisional() {
            Self::ProvisionalReceived(response)
        } else if response.is_success() {
            Self::SuccessReceived(response)
        } else {
            Self::ErrorReceived(response)
        }
    }
}

/// Owner of a transaction. Every outcome arrives through `on_event`.
#[async_trait]
pub trait TransactionUser: Send + Sync + 'static {
    async fn on_event(&self, key: &TransactionKey, event: TransactionEvent);
}

/// Result of feeding an inbound request to the manager.
pub enum InboundRequest {
    /// No transaction matched; one has been created for it.
    New(ServerTransactionHandle, Request),
    /// A retransmission or a non-2xx ACK, handled inside a transaction.
    Absorbed,
    /// An ACK matching no transaction (ACK for a 2xx), for the dialog layer.
    Ack(Request),
}

struct ScheduledTimer {
    generation: u64,
    _handle: TimerHandle,
}

struct ClientEntry {
    fsm: ClientFsm,
    request: Request,
    target: TransportTarget,
    tu: Arc<dyn TransactionUser>,
    timers: HashMap<TransactionTimer, ScheduledTimer>,
    responses: Vec<Response>,
    user_lock: Arc<AsyncMutex<()>>,
    seq: u64,
}

struct ServerEntry {
    fsm: ServerFsm,
    request: Request,
    target: TransportTarget,
    tu: Option<Arc<dyn TransactionUser>>,
    timers: HashMap<TransactionTimer, ScheduledTimer>,
    responses: Vec<Response>,
}

/// Owns SIP transactions and manages timers/actions.
///
/// Transactions live in two id-keyed tables. Timers carry only the key, the
/// timer name and a generation number; a timer that fires after its
/// transaction is gone or was re-armed is ignored.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn TransportPort>,
    defaults: TimerDefaults,
    ids: Arc<IdGenerator>,
    client: DashMap<TransactionKey, ClientEntry>,
    server: DashMap<TransactionKey, ServerEntry>,
    seq: AtomicU64,
}

impl TransactionManager {
    pub fn new(transport: Arc<dyn TransportPort>, defaults: TimerDefaults) -> Self {
        Self::with_ids(transport, defaults, Arc::new(IdGenerator::new()))
    }

    /// Shares an id generator with the owner (the user agent).
    pub fn with_ids(
        transport: Arc<dyn TransportPort>,
        defaults: TimerDefaults,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                defaults,
                ids,
                client: DashMap::new(),
                server: DashMap::new(),
                seq: AtomicU64::new(1),
            }),
        }
    }

    pub fn timer_defaults(&self) -> TimerDefaults {
        self.inner.defaults
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Starts a client transaction and transmits the request.
    ///
    /// `branch` replaces the top Via branch when given (CANCEL reuses its
    /// INVITE's); otherwise a fresh one is generated.
    pub async fn create_client_transaction(
        &self,
        mut request: Request,
        target: TransportTarget,
        branch: Option<SmolStr>,
        tu: Arc<dyn TransactionUser>,
    ) -> Result<TransactionKey, TransactionError> {
        let via = top_via(request.headers()).ok_or(TransactionError::MissingVia)?;
        let branch = branch.unwrap_or_else(|| self.inner.ids.branch());
        let via = via.with_branch(&branch);
        if let Some(value) = request.headers_mut().get_mut("Via") {
            *value = SmolStr::new(via.to_string());
        }

        let key = TransactionKey::new(branch, request.method().clone(), false);
        if self.inner.client.contains_key(&key) {
            return Err(TransactionError::Duplicate(key));
        }

        let timers = TransportAwareTimers::with_defaults(target.transport, self.inner.defaults);
        let mut fsm = ClientFsm::new(&key.method, timers);
        let actions = fsm.start(&request)?;

        debug!(
            key = %key,
            call_id = request.call_id().unwrap_or_default(),
            %target,
            "starting client transaction"
        );
        let entry = ClientEntry {
            fsm,
            request,
            target,
            tu,
            timers: HashMap::new(),
            responses: Vec::new(),
            user_lock: Arc::new(AsyncMutex::new(())),
            seq: self.next_seq(),
        };
        self.inner.client.insert(key.clone(), entry);
        self.apply_client_actions(&key, actions).await;
        Ok(key)
    }

    /// Feeds a network response into the matching client transaction.
    ///
    /// Matching uses the top Via branch plus the CSeq method. Returns false
    /// when nothing matched; the response has then been dropped.
    pub async fn receive_response(&self, response: Response) -> bool {
        let Some(branch) = top_via(response.headers())
            .and_then(|via| via.branch().map(SmolStr::new))
        else {
            debug!(code = response.code(), "response has no Via branch");
            return false;
        };
        let Some((_, method)) = cseq(response.headers()) else {
            debug!(code = response.code(), "response has no CSeq");
            return false;
        };
        let key = TransactionKey::new(branch, method, false);

        let actions = {
            let Some(mut entry) = self.inner.client.get_mut(&key) else {
                warn!(key = %key, code = response.code(), "no matching client transaction");
                return false;
            };
            entry.responses.push(response.clone());
            let before = entry.fsm.state();
            let actions = entry.fsm.on_event(ClientEvent::Response(response));
            log_client_transition(&key, before, entry.fsm.state());
            actions
        };
        self.apply_client_actions(&key, actions).await;
        true
    }

    /// Routes an inbound request to its server transaction, creating one when
    /// the request is new.
    pub async fn receive_request(
        &self,
        request: Request,
        source: TransportTarget,
    ) -> Result<InboundRequest, TransactionError> {
        let branch = request_branch_id(&request).ok_or(TransactionError::MissingBranch)?;

        if *request.method() == Method::Ack {
            let invite_key = TransactionKey::new(branch, Method::Invite, true);
            if self.inner.server.contains_key(&invite_key) {
                self.server_event(&invite_key, ServerEvent::AckReceived)
                    .await;
                return Ok(InboundRequest::Absorbed);
            }
            return Ok(InboundRequest::Ack(request));
        }

        let key = TransactionKey::new(branch, request.method().clone(), true);
        if self.inner.server.contains_key(&key) {
            debug!(key = %key, "retransmitted request absorbed");
            self.server_event(&key, ServerEvent::RequestRetransmitted)
                .await;
            return Ok(InboundRequest::Absorbed);
        }

        let handle = self.create_server_transaction(&request, source, None)?;
        Ok(InboundRequest::New(handle, request))
    }

    /// Creates a server transaction for `request`, answering toward `target`.
    pub fn create_server_transaction(
        &self,
        request: &Request,
        target: TransportTarget,
        tu: Option<Arc<dyn TransactionUser>>,
    ) -> Result<ServerTransactionHandle, TransactionError> {
        let key = TransactionKey::from_request(request, true).ok_or(TransactionError::MissingBranch)?;
        if self.inner.server.contains_key(&key) {
            return Err(TransactionError::Duplicate(key));
        }

        let timers = TransportAwareTimers::with_defaults(target.transport, self.inner.defaults);
        let mut fsm = ServerFsm::new(&key.method, timers);
        // Server machines emit nothing on start.
        fsm.start()?;
        debug!(key = %key, %target, "server transaction created");

        self.inner.server.insert(
            key.clone(),
            ServerEntry {
                fsm,
                request: request.clone(),
                target,
                tu,
                timers: HashMap::new(),
                responses: Vec::new(),
            },
        );
        Ok(ServerTransactionHandle {
            manager: self.clone(),
            key,
        })
    }

    /// Sends a response through a server transaction.
    pub async fn send_response(
        &self,
        key: &TransactionKey,
        response: Response,
    ) -> Result<(), TransactionError> {
        let actions = {
            let Some(mut entry) = self.inner.server.get_mut(key) else {
                return Err(TransactionError::Unknown(key.clone()));
            };
            let before = entry.fsm.state();
            let actions = entry
                .fsm
                .on_event(ServerEvent::SendResponse(response.clone()));
            if actions.is_empty() {
                debug!(key = %key, code = response.code(), "response refused in current state");
            } else {
                entry.responses.push(response);
            }
            log_server_transition(key, before, entry.fsm.state());
            actions
        };
        self.apply_server_actions(key, actions).await;
        Ok(())
    }

    /// Last response sent or received by a live transaction.
    pub fn last_response(&self, key: &TransactionKey) -> Option<Response> {
        if key.is_server {
            self.inner
                .server
                .get(key)
                .and_then(|e| e.responses.last().cloned())
        } else {
            self.inner
                .client
                .get(key)
                .and_then(|e| e.responses.last().cloned())
        }
    }

    pub fn client_request(&self, key: &TransactionKey) -> Option<Request> {
        self.inner.client.get(key).map(|e| e.request.clone())
    }

    pub fn server_request(&self, key: &TransactionKey) -> Option<Request> {
        self.inner.server.get(key).map(|e| e.request.clone())
    }

    pub fn client_state(&self, key: &TransactionKey) -> Option<ClientTransactionState> {
        self.inner.client.get(key).map(|e| e.fsm.state())
    }

    pub fn server_state(&self, key: &TransactionKey) -> Option<ServerTransactionState> {
        self.inner.server.get(key).map(|e| e.fsm.state())
    }

    /// Live INVITE server transaction for a branch (CANCEL matching).
    pub fn find_server_invite(&self, branch: &str) -> Option<ServerTransactionHandle> {
        let key = TransactionKey::new(branch, Method::Invite, true);
        self.inner
            .server
            .contains_key(&key)
            .then(|| ServerTransactionHandle {
                manager: self.clone(),
                key,
            })
    }

    /// Live client transactions of one method within a call, oldest first.
    pub fn client_keys_for_call(&self, call_id: &str, method: &Method) -> Vec<TransactionKey> {
        let mut found: Vec<(u64, TransactionKey)> = self
            .inner
            .client
            .iter()
            .filter(|e| e.key().method == *method && e.request.call_id() == Some(call_id))
            .map(|e| (e.seq, e.key().clone()))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, key)| key).collect()
    }

    /// Lock serialising event delivery for a client transaction.
    ///
    /// Holding it keeps responses from reaching the owner; call termination
    /// takes it while choosing between CANCEL and BYE.
    pub fn client_lock(&self, key: &TransactionKey) -> Option<Arc<AsyncMutex<()>>> {
        self.inner.client.get(key).map(|e| e.user_lock.clone())
    }

    pub fn client_count(&self) -> usize {
        self.inner.client.len()
    }

    pub fn server_count(&self) -> usize {
        self.inner.server.len()
    }

    /// Drops every transaction. Pending timers are cancelled with them.
    pub fn shutdown(&self) {
        let clients = self.inner.client.len();
        let servers = self.inner.server.len();
        self.inner.client.clear();
        self.inner.server.clear();
        debug!(clients, servers, "transaction manager shut down");
    }

    async fn server_event(&self, key: &TransactionKey, event: ServerEvent) {
        let actions = {
            let Some(mut entry) = self.inner.server.get_mut(key) else {
                return;
            };
            let before = entry.fsm.state();
            let actions = entry.fsm.on_event(event);
            log_server_transition(key, before, entry.fsm.state());
            actions
        };
        self.apply_server_actions(key, actions).await;
    }

    fn client_event(&self, key: &TransactionKey, event: ClientEvent) -> Vec<ClientAction> {
        let Some(mut entry) = self.inner.client.get_mut(key) else {
            return Vec::new();
        };
        let before = entry.fsm.state();
        let actions = entry.fsm.on_event(event);
        log_client_transition(key, before, entry.fsm.state());
        actions
    }

    async fn timer_fired(&self, key: TransactionKey, timer: TransactionTimer, generation: u64) {
        if key.is_server {
            let actions = {
                let Some(mut entry) = self.inner.server.get_mut(&key) else {
                    return;
                };
                if !take_current(&mut entry.timers, timer, generation) {
                    trace!(key = %key, ?timer, "stale timer ignored");
                    return;
                }
                let before = entry.fsm.state();
                let actions = entry.fsm.on_event(ServerEvent::TimerFired(timer));
                log_server_transition(&key, before, entry.fsm.state());
                actions
            };
            self.apply_server_actions(&key, actions).await;
        } else {
            let actions = {
                let Some(mut entry) = self.inner.client.get_mut(&key) else {
                    return;
                };
                if !take_current(&mut entry.timers, timer, generation) {
                    trace!(key = %key, ?timer, "stale timer ignored");
                    return;
                }
                let before = entry.fsm.state();
                let actions = entry.fsm.on_event(ClientEvent::TimerFired(timer));
                log_client_transition(&key, before, entry.fsm.state());
                actions
            };
            self.apply_client_actions(&key, actions).await;
        }
    }

    fn schedule_timer(&self, key: &TransactionKey, timer: TransactionTimer, duration: Duration) {
        let generation = self.next_seq();
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let fired_key = key.clone();
        let arm = || {
            schedule(duration, async move {
                if let Some(inner) = weak.upgrade() {
                    TransactionManager { inner }
                        .timer_fired(fired_key, timer, generation)
                        .await;
                }
            })
        };

        let scheduled = |handle| ScheduledTimer {
            generation,
            _handle: handle,
        };
        if key.is_server {
            if let Some(mut entry) = self.inner.server.get_mut(key) {
                entry.timers.insert(timer, scheduled(arm()));
            }
        } else if let Some(mut entry) = self.inner.client.get_mut(key) {
            entry.timers.insert(timer, scheduled(arm()));
        }
        trace!(key = %key, ?timer, ?duration, "timer armed");
    }

    async fn apply_client_actions(&self, key: &TransactionKey, actions: Vec<ClientAction>) {
        let mut queue: VecDeque<ClientAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                ClientAction::Transmit(bytes) => {
                    let Some(target) = self.inner.client.get(key).map(|e| e.target.clone())
                    else {
                        continue;
                    };
                    if let Err(e) = self.inner.transport.send(&target, bytes).await {
                        warn!(key = %key, %target, error = %e, "client transport send failed");
                        queue.clear();
                        queue.extend(self.client_event(key, ClientEvent::TransportError));
                    }
                }
                ClientAction::Deliver(response) => {
                    self.notify_client(key, TransactionEvent::from_response(response))
                        .await;
                }
                ClientAction::Schedule { timer, duration } => {
                    self.schedule_timer(key, timer, duration);
                }
                ClientAction::Cancel(timer) => {
                    if let Some(mut entry) = self.inner.client.get_mut(key) {
                        entry.timers.remove(&timer);
                    }
                }
                ClientAction::Terminate(cause) => {
                    let Some((_, entry)) = self.inner.client.remove(key) else {
                        continue;
                    };
                    debug!(key = %key, ?cause, "client transaction terminated");
                    let event = match cause {
                        TerminationCause::Completed => None,
                        TerminationCause::Timeout => Some(TransactionEvent::Timeout),
                        TerminationCause::TransportError => Some(TransactionEvent::TransportError),
                    };
                    if let Some(event) = event {
                        let _guard = entry.user_lock.lock().await;
                        entry.tu.on_event(key, event).await;
                    }
                }
            }
        }
    }

    async fn notify_client(&self, key: &TransactionKey, event: TransactionEvent) {
        let Some((tu, lock)) = self
            .inner
            .client
            .get(key)
            .map(|e| (e.tu.clone(), e.user_lock.clone()))
        else {
            return;
        };
        let _guard = lock.lock().await;
        tu.on_event(key, event).await;
    }

    async fn apply_server_actions(&self, key: &TransactionKey, actions: Vec<ServerAction>) {
        let mut queue: VecDeque<ServerAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                ServerAction::Transmit(bytes) => {
                    let Some(target) = self.inner.server.get(key).map(|e| e.target.clone())
                    else {
                        continue;
                    };
                    if let Err(e) = self.inner.transport.send(&target, bytes).await {
                        warn!(key = %key, %target, error = %e, "server transport send failed");
                        queue.clear();
                        let more = self
                            .inner
                            .server
                            .get_mut(key)
                            .map(|mut entry| entry.fsm.on_event(ServerEvent::TransportError))
                            .unwrap_or_default();
                        queue.extend(more);
                    }
                }
                ServerAction::Schedule { timer, duration } => {
                    self.schedule_timer(key, timer, duration);
                }
                ServerAction::Cancel(timer) => {
                    if let Some(mut entry) = self.inner.server.get_mut(key) {
                        entry.timers.remove(&timer);
                    }
                }
                ServerAction::Terminate(cause) => {
                    let Some((_, entry)) = self.inner.server.remove(key) else {
                        continue;
                    };
                    debug!(key = %key, ?cause, "server transaction terminated");
                    let event = match cause {
                        TerminationCause::Completed => None,
                        TerminationCause::Timeout => Some(TransactionEvent::Timeout),
                        TerminationCause::TransportError => Some(TransactionEvent::TransportError),
                    };
                    if let (Some(tu), Some(event)) = (entry.tu, event) {
                        tu.on_event(key, event).await;
                    }
                }
            }
        }
    }
}

/// Removes the timer if `generation` is the one currently armed.
fn take_current(
    timers: &mut HashMap<TransactionTimer, ScheduledTimer>,
    timer: TransactionTimer,
    generation: u64,
) -> bool {
    match timers.get(&timer) {
        Some(current) if current.generation == generation => {
            timers.remove(&timer);
            true
        }
        _ => false,
    }
}

fn log_client_transition(
    key: &TransactionKey,
    before: ClientTransactionState,
    after: ClientTransactionState,
) {
    if before != after {
        debug!(key = %key, from = ?before, to = ?after, "transaction state change");
    }
}

fn log_server_transition(
    key: &TransactionKey,
    before: ServerTransactionState,
    after: ServerTransactionState,
) {
    if before != after {
        debug!(key = %key, from = ?before, to = ?after, "transaction state change");
    }
}

/// A server transaction as seen by the request handlers.
#[derive(Clone)]
pub struct ServerTransactionHandle {
    manager: TransactionManager,
    key: TransactionKey,
}

impl ServerTransactionHandle {
    pub async fn send_response(&self, response: Response) -> Result<(), TransactionError> {
        self.manager.send_response(&self.key, response).await
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn branch(&self) -> &str {
        &self.key.branch
    }

    pub fn last_response(&self) -> Option<Response> {
        self.manager.last_response(&self.key)
    }

    pub fn request(&self) -> Option<Request> {
        self.manager.server_request(&self.key)
    }

    pub fn is_alive(&self) -> bool {
        self.manager.inner.server.contains_key(&self.key)
    }
}
