//! Transaction layer: kinds, states, keys, the four RFC 3261 state
//! machines and the listener surface through which the engine reports
//! protocol events upward.

mod client;
mod server;

use std::fmt;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use crate::dialog::DialogId;
use crate::error::{Error, Result};
use crate::message::{Message, Method, Request, Response};
use crate::timer::{TimerSettings, TimerType};
use crate::transport::ChannelRef;

pub(crate) use client::{InviteClient, NonInviteClient};
pub(crate) use server::{InviteServer, NonInviteServer};

/// The four transaction machine kinds of RFC 3261 section 17.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

impl TransactionKind {
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionKind::InviteClient | TransactionKind::NonInviteClient
        )
    }

    pub fn is_server(&self) -> bool {
        !self.is_client()
    }

    pub fn is_invite(&self) -> bool {
        matches!(
            self,
            TransactionKind::InviteClient | TransactionKind::InviteServer
        )
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::InviteClient => write!(f, "ICT"),
            TransactionKind::NonInviteClient => write!(f, "NICT"),
            TransactionKind::InviteServer => write!(f, "IST"),
            TransactionKind::NonInviteServer => write!(f, "NIST"),
        }
    }
}

/// Transaction states. Each kind uses a subset; transitions only move
/// forward and every path ends in `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Created, not yet started.
    Initial,
    /// ICT: initial request sent, no response yet.
    Calling,
    /// NICT/NIST: request sent/received, no provisional yet.
    Trying,
    /// A provisional response has been sent or received.
    Proceeding,
    /// A final response has been sent or received.
    Completed,
    /// IST only: ACK received, absorbing ACK retransmissions.
    Confirmed,
    /// Finished; the owner may drop the machine.
    Terminated,
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, TransactionState::Terminated)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Initial => write!(f, "Initial"),
            TransactionState::Calling => write!(f, "Calling"),
            TransactionState::Trying => write!(f, "Trying"),
            TransactionState::Proceeding => write!(f, "Proceeding"),
            TransactionState::Completed => write!(f, "Completed"),
            TransactionState::Confirmed => write!(f, "Confirmed"),
            TransactionState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Checks that a transition is legal for the given machine kind.
pub fn validate_transition(
    kind: TransactionKind,
    from: TransactionState,
    to: TransactionState,
) -> Result<()> {
    use TransactionState::*;
    // Any state may jump to Terminated (timeout, transport error, explicit
    // teardown); everything else is kind-specific and forward-only.
    let valid = to == Terminated
        || match kind {
            TransactionKind::InviteClient => matches!(
                (from, to),
                (Initial, Calling) | (Calling, Proceeding) | (Calling, Completed)
                    | (Proceeding, Completed)
            ),
            TransactionKind::NonInviteClient => matches!(
                (from, to),
                (Initial, Trying) | (Trying, Proceeding) | (Trying, Completed)
                    | (Proceeding, Completed)
            ),
            TransactionKind::InviteServer => matches!(
                (from, to),
                (Initial, Proceeding) | (Proceeding, Completed) | (Completed, Confirmed)
            ),
            TransactionKind::NonInviteServer => matches!(
                (from, to),
                (Initial, Trying) | (Trying, Proceeding) | (Trying, Completed)
                    | (Proceeding, Completed)
            ),
        };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidStateTransition(format!(
            "{}: {} -> {}",
            kind, from, to
        )))
    }
}

/// Transaction identity: top Via branch + method + direction.
///
/// ACK is keyed under INVITE so it reaches the INVITE server transaction
/// it acknowledges. CANCEL keeps its own method and therefore its own
/// transaction, as required.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    branch: String,
    method: Method,
    is_server: bool,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: Method, is_server: bool) -> Self {
        let method = match method {
            Method::Ack => Method::Invite,
            other => other,
        };
        Self {
            branch: branch.into(),
            method,
            is_server,
        }
    }

    /// Key for a request, in the given direction.
    pub fn from_request(request: &Request, is_server: bool) -> Result<Self> {
        let branch = request
            .branch()
            .ok_or_else(|| Error::InvalidMessage("request without Via branch".to_string()))?;
        Ok(Self::new(branch, request.method.clone(), is_server))
    }

    /// Key for a received response: branch + CSeq method, client side.
    pub fn from_response(response: &Response) -> Result<Self> {
        let branch = response
            .branch()
            .ok_or_else(|| Error::InvalidMessage("response without Via branch".to_string()))?;
        Ok(Self::new(
            branch,
            response.headers.cseq.method.clone(),
            false,
        ))
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.branch,
            self.method,
            if self.is_server { "server" } else { "client" }
        )
    }
}

/// Generates a Via branch with the RFC 3261 magic cookie.
pub fn gen_branch() -> String {
    format!("z9hG4bK{}", Uuid::new_v4().simple())
}

/// Generates a From/To tag.
pub fn gen_tag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// Callbacks through which the engine reports protocol events. All methods
/// default to no-ops so applications implement only what they observe.
pub trait SignalingListener: Send + Sync {
    /// 1xx received by a client transaction.
    fn on_provisional_response(&self, _key: &TransactionKey, _response: &Response) {}

    /// First final response received by a client transaction.
    fn on_final_response(&self, _key: &TransactionKey, _response: &Response) {}

    /// Timers B/F/H expired: the peer never answered.
    fn on_transaction_timeout(&self, _key: &TransactionKey) {}

    /// The channel failed while the transaction was live.
    fn on_transport_error(&self, _key: &TransactionKey, _error: &Error) {}

    /// The transaction reached `Terminated` and is being dropped.
    fn on_transaction_terminated(&self, _key: &TransactionKey) {}

    /// A request created a fresh server transaction. `dialog` is set when
    /// the request matched an established dialog.
    fn on_new_server_transaction(
        &self,
        _key: &TransactionKey,
        _request: &Request,
        _dialog: Option<&DialogId>,
    ) {
    }

    /// A request (e.g. ACK for a 2xx) was routed to a dialog without
    /// creating a server transaction.
    fn on_in_dialog_request(&self, _dialog: &DialogId, _request: &Request) {}

    /// A response matched no client transaction.
    fn on_stray_response(&self, _response: &Response) {}

    fn on_dialog_created(&self, _dialog: &DialogId) {}

    fn on_dialog_confirmed(&self, _dialog: &DialogId) {}

    fn on_dialog_terminated(&self, _dialog: &DialogId) {}
}

/// Inputs fed to a transaction machine by the provider.
#[derive(Debug)]
pub(crate) enum TxInput {
    /// Client machines: transmit the initial request and arm timers.
    Start,
    /// A response matched this client transaction.
    Response(Response),
    /// A request matched this server transaction (initial delivery is
    /// handled by the provider; this is a retransmission or an ACK).
    Request(Request),
    /// The application sends a response through this server transaction.
    SendResponse(Response),
    /// One of this machine's timers fired.
    Timer(TimerType),
    /// The channel reported a failure for this machine.
    TransportError(String),
}

/// Effects a machine asks its owner to perform. Message transmission
/// happens inside the machine (it owns the channel); timers and listener
/// notifications are the provider's job.
#[derive(Debug)]
pub(crate) enum TxAction {
    /// Arm a one-shot timer for this machine.
    ArmTimer(TimerType, Duration),
    /// From within a `Timer` input only: keep the firing timer alive with
    /// the given interval (phase-aligned with the previous expiry).
    RescheduleCurrentTimer(Duration),
    /// Disarm one timer.
    CancelTimer(TimerType),
    /// Disarm every timer this machine owns.
    CancelAllTimers,
    /// Report a provisional response upward.
    Provisional(Response),
    /// Report the first final response upward.
    Final(Response),
    /// Report a protocol timeout upward.
    TimedOut,
    /// Report a transport failure upward.
    TransportFailed(String),
    /// The machine reached `Terminated`; the owner drops it.
    Terminated,
}

/// State shared by all four machines.
pub(crate) struct TransactionCore {
    pub key: TransactionKey,
    pub kind: TransactionKind,
    pub state: TransactionState,
    pub request: Request,
    pub last_response: Option<Response>,
    pub channel: ChannelRef,
    pub settings: TimerSettings,
    /// Current retransmission interval (timers A/E/G).
    pub retransmit_interval: Duration,
    /// Dialog this transaction belongs to, if any.
    pub dialog: Option<DialogId>,
}

impl TransactionCore {
    pub fn new(
        key: TransactionKey,
        kind: TransactionKind,
        request: Request,
        channel: ChannelRef,
        settings: TimerSettings,
    ) -> Self {
        let retransmit_interval = settings.t1;
        Self {
            key,
            kind,
            state: TransactionState::Initial,
            request,
            last_response: None,
            channel,
            settings,
            retransmit_interval,
            dialog: None,
        }
    }

    pub fn reliable(&self) -> bool {
        self.channel.is_reliable()
    }

    /// Moves to `to`, asserting the transition is in the kind's table.
    pub fn set_state(&mut self, to: TransactionState) {
        if let Err(e) = validate_transition(self.kind, self.state, to) {
            warn!(key = %self.key, error = %e, "illegal state transition requested");
            debug_assert!(false, "illegal state transition");
        }
        tracing::debug!(key = %self.key, from = %self.state, to = %to, "state transition");
        self.state = to;
    }

    /// Sends on the owned channel, mapping failures to the transport error
    /// path. Callers terminate the machine when this returns `Err`.
    pub fn transmit(&self, message: &Message) -> std::result::Result<(), String> {
        match self.channel.send(message) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(key = %self.key, error = %e, "transmit failed");
                Err(e.to_string())
            }
        }
    }

    /// (Re)transmits the transaction's original request.
    pub fn transmit_request(&self) -> std::result::Result<(), String> {
        self.transmit(&Message::Request(self.request.clone()))
    }

    /// Replays the cached last response, if there is one yet.
    pub fn retransmit_last_response(&self) -> std::result::Result<(), String> {
        match &self.last_response {
            Some(response) => self.transmit(&Message::Response(response.clone())),
            None => Ok(()),
        }
    }
}

/// The four machines behind one tagged dispatch surface, so the provider
/// stores them uniformly in its transaction table.
pub(crate) enum TransactionMachine {
    InviteClient(InviteClient),
    NonInviteClient(NonInviteClient),
    InviteServer(InviteServer),
    NonInviteServer(NonInviteServer),
}

impl TransactionMachine {
    pub fn new_client(
        key: TransactionKey,
        request: Request,
        channel: ChannelRef,
        settings: TimerSettings,
    ) -> Self {
        if request.method.is_invite() {
            TransactionMachine::InviteClient(InviteClient::new(key, request, channel, settings))
        } else {
            TransactionMachine::NonInviteClient(NonInviteClient::new(
                key, request, channel, settings,
            ))
        }
    }

    pub fn new_server(
        key: TransactionKey,
        request: Request,
        channel: ChannelRef,
        settings: TimerSettings,
    ) -> Self {
        if request.method.is_invite() {
            TransactionMachine::InviteServer(InviteServer::new(key, request, channel, settings))
        } else {
            TransactionMachine::NonInviteServer(NonInviteServer::new(
                key, request, channel, settings,
            ))
        }
    }

    fn core(&self) -> &TransactionCore {
        match self {
            TransactionMachine::InviteClient(m) => &m.core,
            TransactionMachine::NonInviteClient(m) => &m.core,
            TransactionMachine::InviteServer(m) => &m.core,
            TransactionMachine::NonInviteServer(m) => &m.core,
        }
    }

    fn core_mut(&mut self) -> &mut TransactionCore {
        match self {
            TransactionMachine::InviteClient(m) => &mut m.core,
            TransactionMachine::NonInviteClient(m) => &mut m.core,
            TransactionMachine::InviteServer(m) => &mut m.core,
            TransactionMachine::NonInviteServer(m) => &mut m.core,
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.core().key
    }

    pub fn kind(&self) -> TransactionKind {
        self.core().kind
    }

    pub fn state(&self) -> TransactionState {
        self.core().state
    }

    pub fn request(&self) -> &Request {
        &self.core().request
    }

    pub fn channel(&self) -> &ChannelRef {
        &self.core().channel
    }

    pub fn dialog(&self) -> Option<&DialogId> {
        self.core().dialog.as_ref()
    }

    pub fn set_dialog(&mut self, dialog: DialogId) {
        self.core_mut().dialog = Some(dialog);
    }

    pub fn handle(&mut self, input: TxInput) -> Vec<TxAction> {
        match self {
            TransactionMachine::InviteClient(m) => m.handle(input),
            TransactionMachine::NonInviteClient(m) => m.handle(input),
            TransactionMachine::InviteServer(m) => m.handle(input),
            TransactionMachine::NonInviteServer(m) => m.handle(input),
        }
    }
}
