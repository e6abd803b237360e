// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The four RFC 3261 transaction state machines.
//!
//! Each machine consumes events and returns the actions the runtime must
//! perform. They never touch the network or the clock, which keeps them
//! deterministic under test. Events that are not valid for the current state
//! produce no actions; starting a machine twice is an error.

use std::time::Duration;

use bytes::Bytes;
use sip_core::{Headers, Method, Request, RequestLine, Response};
use sip_parse::{cseq, serialize_request, serialize_response};
use smol_str::SmolStr;

use crate::{
    timers::TransportAwareTimers, ClientInviteState, ClientNonInviteState, ClientTransactionState,
    ServerInviteState, ServerNonInviteState, ServerTransactionState, TransactionError,
    TransactionTimer,
};

/// Why a transaction left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    Completed,
    Timeout,
    TransportError,
}

/// Events that drive either client state machine after `start`.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Response(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by the client state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Transmit(Bytes),
    Deliver(Response),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    Terminate(TerminationCause),
}

/// Events that drive either server state machine after `start`.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    RequestRetransmitted,
    AckReceived,
    SendResponse(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by the server state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    Transmit(Bytes),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    Terminate(TerminationCause),
}

/// Implements RFC 3261 Figure 6 for non-INVITE client transactions.
#[derive(Debug)]
pub struct ClientNonInviteFsm {
    state: ClientNonInviteState,
    timers: TransportAwareTimers,
    e_interval: Duration,
    last_request: Option<Bytes>,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientNonInviteState::Init,
            timers,
            e_interval: timers.t1(),
            last_request: None,
        }
    }

    pub fn state(&self) -> ClientNonInviteState {
        self.state
    }

    /// Sends the request and arms timers E and F.
    pub fn start(&mut self, request: &Request) -> Result<Vec<ClientAction>, TransactionError> {
        if self.state != ClientNonInviteState::Init {
            return Err(TransactionError::AlreadyStarted);
        }
        let bytes = serialize_request(request);
        self.last_request = Some(bytes.clone());
        self.state = ClientNonInviteState::Trying;

        let mut actions = vec![ClientAction::Transmit(bytes)];
        if self.timers.should_retransmit() {
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            });
        }
        actions.push(ClientAction::Schedule {
            timer: TransactionTimer::F,
            duration: self.timers.duration(TransactionTimer::F),
        });
        Ok(actions)
    }

    pub fn on_event(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        use ClientNonInviteState::*;
        match (self.state, event) {
            (Trying | Proceeding, ClientEvent::Response(response)) => {
                if response.is_provisional() {
                    self.state = Proceeding;
                    vec![ClientAction::Deliver(response)]
                } else {
                    self.handle_final(response)
                }
            }
            (Trying | Proceeding, ClientEvent::TimerFired(TransactionTimer::E)) => {
                self.handle_timer_e()
            }
            (Trying | Proceeding, ClientEvent::TimerFired(TransactionTimer::F)) => {
                self.state = Terminated;
                vec![
                    ClientAction::Cancel(TransactionTimer::E),
                    ClientAction::Terminate(TerminationCause::Timeout),
                ]
            }
            (Completed, ClientEvent::TimerFired(TransactionTimer::K)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate(TerminationCause::Completed)]
            }
            (Init | Terminated, ClientEvent::TransportError) => Vec::new(),
            (_, ClientEvent::TransportError) => {
                self.state = Terminated;
                vec![ClientAction::Terminate(TerminationCause::TransportError)]
            }
            // Response retransmissions in Completed are absorbed.
            _ => Vec::new(),
        }
    }

    fn handle_final(&mut self, response: Response) -> Vec<ClientAction> {
        self.state = ClientNonInviteState::Completed;
        vec![
            ClientAction::Cancel(TransactionTimer::E),
            ClientAction::Cancel(TransactionTimer::F),
            ClientAction::Deliver(response),
            ClientAction::Schedule {
                timer: TransactionTimer::K,
                duration: self.timers.duration(TransactionTimer::K),
            },
        ]
    }

    fn handle_timer_e(&mut self) -> Vec<ClientAction> {
        // Proceeding retransmits at T2; Trying doubles up to T2.
        self.e_interval = if self.state == ClientNonInviteState::Proceeding {
            self.timers.t2()
        } else {
            (self.e_interval * 2).min(self.timers.t2())
        };
        match &self.last_request {
            Some(payload) => vec![
                ClientAction::Transmit(payload.clone()),
                ClientAction::Schedule {
                    timer: TransactionTimer::E,
                    duration: self.e_interval,
                },
            ],
            None => Vec::new(),
        }
    }
}

/// Implements RFC 3261 Figure 5 for INVITE client transactions.
///
/// A 2xx terminates the transaction at once; the ACK for it belongs to the
/// dialog. Non-2xx finals are ACKed here.
#[derive(Debug)]
pub struct ClientInviteFsm {
    state: ClientInviteState,
    timers: TransportAwareTimers,
    a_interval: Duration,
    invite: Option<Request>,
    last_invite: Option<Bytes>,
    last_ack: Option<Bytes>,
}

impl ClientInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientInviteState::Init,
            timers,
            a_interval: timers.t1(),
            invite: None,
            last_invite: None,
            last_ack: None,
        }
    }

    pub fn state(&self) -> ClientInviteState {
        self.state
    }

    /// Sends the INVITE and arms timers A and B.
    pub fn start(&mut self, invite: &Request) -> Result<Vec<ClientAction>, TransactionError> {
        if self.state != ClientInviteState::Init {
            return Err(TransactionError::AlreadyStarted);
        }
        let bytes = serialize_request(invite);
        self.last_invite = Some(bytes.clone());
        self.invite = Some(invite.clone());
        self.state = ClientInviteState::Calling;

        let mut actions = vec![ClientAction::Transmit(bytes)];
        if self.timers.should_retransmit() {
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::A,
                duration: self.a_interval,
            });
        }
        actions.push(ClientAction::Schedule {
            timer: TransactionTimer::B,
            duration: self.timers.duration(TransactionTimer::B),
        });
        Ok(actions)
    }

    pub fn on_event(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        use ClientInviteState::*;
        match (self.state, event) {
            (Calling | Proceeding, ClientEvent::Response(response)) => {
                if response.is_provisional() {
                    self.state = Proceeding;
                    vec![
                        ClientAction::Cancel(TransactionTimer::A),
                        ClientAction::Cancel(TransactionTimer::B),
                        ClientAction::Deliver(response),
                    ]
                } else if response.is_success() {
                    self.state = Terminated;
                    vec![
                        ClientAction::Cancel(TransactionTimer::A),
                        ClientAction::Cancel(TransactionTimer::B),
                        ClientAction::Deliver(response),
                        ClientAction::Terminate(TerminationCause::Completed),
                    ]
                } else {
                    self.handle_final_non_2xx(response)
                }
            }
            // Retransmitted non-2xx final: ACK again, do not deliver.
            (Completed, ClientEvent::Response(response)) if response.is_final() => {
                match &self.last_ack {
                    Some(ack) => vec![ClientAction::Transmit(ack.clone())],
                    None => Vec::new(),
                }
            }
            (Calling, ClientEvent::TimerFired(TransactionTimer::A)) => self.handle_timer_a(),
            (Calling, ClientEvent::TimerFired(TransactionTimer::B)) => {
                self.state = Terminated;
                vec![
                    ClientAction::Cancel(TransactionTimer::A),
                    ClientAction::Terminate(TerminationCause::Timeout),
                ]
            }
            (Completed, ClientEvent::TimerFired(TransactionTimer::D)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate(TerminationCause::Completed)]
            }
            (Init | Terminated, ClientEvent::TransportError) => Vec::new(),
            (_, ClientEvent::TransportError) => {
                self.state = Terminated;
                vec![ClientAction::Terminate(TerminationCause::TransportError)]
            }
            _ => Vec::new(),
        }
    }

    fn handle_final_non_2xx(&mut self, response: Response) -> Vec<ClientAction> {
        self.state = ClientInviteState::Completed;
        let mut actions = vec![
            ClientAction::Cancel(TransactionTimer::A),
            ClientAction::Cancel(TransactionTimer::B),
        ];
        if let Some(ack) = self
            .invite
            .as_ref()
            .and_then(|invite| build_non2xx_ack(invite, &response))
        {
            let bytes = serialize_request(&ack);
            self.last_ack = Some(bytes.clone());
            actions.push(ClientAction::Transmit(bytes));
        }
        actions.push(ClientAction::Deliver(response));
        actions.push(ClientAction::Schedule {
            timer: TransactionTimer::D,
            duration: self.timers.duration(TransactionTimer::D),
        });
        actions
    }

    fn handle_timer_a(&mut self) -> Vec<ClientAction> {
        self.a_interval *= 2;
        match &self.last_invite {
            Some(invite) => vec![
                ClientAction::Transmit(invite.clone()),
                ClientAction::Schedule {
                    timer: TransactionTimer::A,
                    duration: self.a_interval,
                },
            ],
            None => Vec::new(),
        }
    }
}

/// Builds the ACK for a 3xx-6xx answer to `invite` (RFC 3261 §17.1.1.3).
///
/// Request-URI, Call-ID, From and Route come from the INVITE, To from the
/// response (it carries the remote tag), and only the INVITE's top Via is kept.
pub fn build_non2xx_ack(invite: &Request, response: &Response) -> Option<Request> {
    let src = invite.headers();
    let (number, _) = cseq(src)?;

    let mut headers = Headers::new();
    headers.push("Via", src.get("Via")?.clone());
    for route in src.get_all("Route") {
        headers.push("Route", route.clone());
    }
    headers.push("Max-Forwards", "70");
    headers.push("From", src.get("From")?.clone());
    headers.push("To", response.headers().get("To")?.clone());
    headers.push("Call-ID", src.get("Call-ID")?.clone());
    headers.push("CSeq", SmolStr::new(format!("{} ACK", number)));

    Request::new(
        RequestLine::new(Method::Ack, invite.uri().clone()),
        headers,
        Bytes::new(),
    )
    .ok()
}

/// Server non-INVITE transaction following RFC 3261 Figure 8.
#[derive(Debug)]
pub struct ServerNonInviteFsm {
    state: ServerNonInviteState,
    timers: TransportAwareTimers,
    last_response: Option<Bytes>,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerNonInviteState::Init,
            timers,
            last_response: None,
        }
    }

    pub fn state(&self) -> ServerNonInviteState {
        self.state
    }

    /// Accepts the request that created the transaction.
    pub fn start(&mut self) -> Result<Vec<ServerAction>, TransactionError> {
        if self.state != ServerNonInviteState::Init {
            return Err(TransactionError::AlreadyStarted);
        }
        self.state = ServerNonInviteState::Trying;
        Ok(Vec::new())
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<ServerAction> {
        use ServerNonInviteState::*;
        match (self.state, event) {
            (Trying | Proceeding, ServerEvent::SendResponse(response)) => {
                let bytes = serialize_response(&response);
                self.last_response = Some(bytes.clone());
                if response.is_provisional() {
                    self.state = Proceeding;
                    vec![ServerAction::Transmit(bytes)]
                } else {
                    self.state = Completed;
                    vec![
                        ServerAction::Transmit(bytes),
                        ServerAction::Schedule {
                            timer: TransactionTimer::J,
                            duration: self.timers.duration(TransactionTimer::J),
                        },
                    ]
                }
            }
            (Proceeding | Completed, ServerEvent::RequestRetransmitted) => {
                match &self.last_response {
                    Some(bytes) => vec![ServerAction::Transmit(bytes.clone())],
                    None => Vec::new(),
                }
            }
            (Completed, ServerEvent::TimerFired(TransactionTimer::J)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate(TerminationCause::Completed)]
            }
            (Init | Terminated, ServerEvent::TransportError) => Vec::new(),
            (_, ServerEvent::TransportError) => {
                self.state = Terminated;
                vec![ServerAction::Terminate(TerminationCause::TransportError)]
            }
            _ => Vec::new(),
        }
    }
}

/// Implements RFC 3261 Figure 7 for INVITE server transactions.
#[derive(Debug)]
pub struct ServerInviteFsm {
    state: ServerInviteState,
    timers: TransportAwareTimers,
    g_interval: Duration,
    last_response: Option<Bytes>,
}

impl ServerInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerInviteState::Init,
            timers,
            g_interval: timers.t1(),
            last_response: None,
        }
    }

    pub fn state(&self) -> ServerInviteState {
        self.state
    }

    /// Accepts the INVITE. Sending 100 Trying is up to the caller.
    pub fn start(&mut self) -> Result<Vec<ServerAction>, TransactionError> {
        if self.state != ServerInviteState::Init {
            return Err(TransactionError::AlreadyStarted);
        }
        self.state = ServerInviteState::Proceeding;
        Ok(Vec::new())
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<ServerAction> {
        use ServerInviteState::*;
        match (self.state, event) {
            (Proceeding, ServerEvent::SendResponse(response)) => self.send_response(response),
            (Proceeding | Completed, ServerEvent::RequestRetransmitted) => {
                match &self.last_response {
                    Some(bytes) => vec![ServerAction::Transmit(bytes.clone())],
                    None => Vec::new(),
                }
            }
            (Completed, ServerEvent::AckReceived) => {
                self.state = Confirmed;
                vec![
                    ServerAction::Cancel(TransactionTimer::G),
                    ServerAction::Cancel(TransactionTimer::H),
                    ServerAction::Schedule {
                        timer: TransactionTimer::I,
                        duration: self.timers.duration(TransactionTimer::I),
                    },
                ]
            }
            (Completed, ServerEvent::TimerFired(TransactionTimer::G)) => self.handle_timer_g(),
            (Completed, ServerEvent::TimerFired(TransactionTimer::H)) => {
                self.state = Terminated;
                vec![
                    ServerAction::Cancel(TransactionTimer::G),
                    ServerAction::Terminate(TerminationCause::Timeout),
                ]
            }
            (Confirmed, ServerEvent::TimerFired(TransactionTimer::I)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate(TerminationCause::Completed)]
            }
            (Init | Terminated, ServerEvent::TransportError) => Vec::new(),
            (_, ServerEvent::TransportError) => {
                self.state = Terminated;
                vec![ServerAction::Terminate(TerminationCause::TransportError)]
            }
            _ => Vec::new(),
        }
    }

    fn send_response(&mut self, response: Response) -> Vec<ServerAction> {
        let bytes = serialize_response(&response);
        self.last_response = Some(bytes.clone());
        if response.is_provisional() {
            return vec![ServerAction::Transmit(bytes)];
        }
        if response.is_success() {
            self.state = ServerInviteState::Terminated;
            return vec![
                ServerAction::Transmit(bytes),
                ServerAction::Terminate(TerminationCause::Completed),
            ];
        }

        self.state = ServerInviteState::Completed;
        self.g_interval = self.timers.t1();
        let mut actions = vec![ServerAction::Transmit(bytes)];
        if self.timers.should_retransmit() {
            actions.push(ServerAction::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            });
        }
        actions.push(ServerAction::Schedule {
            timer: TransactionTimer::H,
            duration: self.timers.duration(TransactionTimer::H),
        });
        actions
    }

    fn handle_timer_g(&mut self) -> Vec<ServerAction> {
        self.g_interval = (self.g_interval * 2).min(self.timers.t2());
        match &self.last_response {
            Some(bytes) => vec![
                ServerAction::Transmit(bytes.clone()),
                ServerAction::Schedule {
                    timer: TransactionTimer::G,
                    duration: self.g_interval,
                },
            ],
            None => Vec::new(),
        }
    }
}

/// Either client machine, picked by method.
#[derive(Debug)]
pub(crate) enum ClientFsm {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

impl ClientFsm {
    pub(crate) fn new(method: &Method, timers: TransportAwareTimers) -> Self {
        if *method == Method::Invite {
            Self::Invite(ClientInviteFsm::new(timers))
        } else {
            Self::NonInvite(ClientNonInviteFsm::new(timers))
        }
    }

    pub(crate) fn start(&mut self, request: &Request) -> Result<Vec<ClientAction>, TransactionError> {
        match self {
            Self::Invite(fsm) => fsm.start(request),
            Self::NonInvite(fsm) => fsm.start(request),
        }
    }

    pub(crate) fn on_event(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        match self {
            Self::Invite(fsm) => fsm.on_event(event),
            Self::NonInvite(fsm) => fsm.on_event(event),
        }
    }

    pub(crate) fn state(&self) -> ClientTransactionState {
        match self {
            Self::Invite(fsm) => ClientTransactionState::Invite(fsm.state()),
            Self::NonInvite(fsm) => ClientTransactionState::NonInvite(fsm.state()),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ServerFsm {
    Invite(ServerInviteFsm),
    NonInvite(ServerNonInviteFsm),
}

impl ServerFsm {
    pub(crate) fn new(method: &Method, timers: TransportAwareTimers) -> Self {
        if *method == Method::Invite {
            Self::Invite(ServerInviteFsm::new(timers))
        } else {
            Self::NonInvite(ServerNonInviteFsm::new(timers))
        }
    }

    pub(crate) fn start(&mut self) -> Result<Vec<ServerAction>, TransactionError> {
        match self {
            Self::Invite(fsm) => fsm.start(),
            Self::NonInvite(fsm) => fsm.start(),
        }
    }

    pub(crate) fn on_event(&mut self, event: ServerEvent) -> Vec<ServerAction> {
        match self {
            Self::Invite(fsm) => fsm.on_event(event),
            Self::NonInvite(fsm) => fsm.on_event(event),
        }
    }

    pub(crate) fn state(&self) -> ServerTransactionState {
        match self {
            Self::Invite(fsm) => ServerTransactionState::Invite(fsm.state()),
            Self::NonInvite(fsm) => ServerTransactionState::NonInvite(fsm.state()),
        }
    }
}
