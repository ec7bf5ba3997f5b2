//! Server transaction machines: INVITE (IST) and non-INVITE (NIST).

use tracing::{debug, trace};

use crate::message::{Message, Method, Request, Response};
use crate::timer::{TimerSettings, TimerType};
use crate::transport::ChannelRef;

use super::{TransactionCore, TransactionKey, TransactionKind, TransactionState, TxAction, TxInput};

/// INVITE server transaction.
///
/// Starts in Proceeding. Provisionals and 2xx flow straight through; a 2xx
/// terminates the transaction right after the send since its
/// retransmission and ACK belong to the dialog layer. A 3xx-6xx moves to
/// Completed, retransmitting on timer G until the ACK arrives (Confirmed,
/// timer I) or timer H gives up.
pub(crate) struct InviteServer {
    pub core: TransactionCore,
}

impl InviteServer {
    pub fn new(
        key: TransactionKey,
        request: Request,
        channel: ChannelRef,
        settings: TimerSettings,
    ) -> Self {
        Self {
            core: TransactionCore::new(key, TransactionKind::InviteServer, request, channel, settings),
        }
    }

    pub fn handle(&mut self, input: TxInput) -> Vec<TxAction> {
        if self.core.state.is_terminated() {
            return Vec::new();
        }
        match input {
            TxInput::Start => {
                self.core.set_state(TransactionState::Proceeding);
                Vec::new()
            }
            TxInput::Request(request) => self.on_request(request),
            TxInput::SendResponse(response) => self.on_send_response(response),
            TxInput::Timer(timer) => self.on_timer(timer),
            TxInput::TransportError(reason) => self.fail(reason),
            other => {
                trace!(key = %self.core.key, ?other, "input ignored");
                Vec::new()
            }
        }
    }

    fn on_request(&mut self, request: Request) -> Vec<TxAction> {
        use TransactionState::*;
        if request.method == Method::Ack {
            return self.on_ack();
        }
        match self.core.state {
            Proceeding | Completed => {
                // Retransmitted INVITE: replay the last response without
                // telling the application.
                if let Err(reason) = self.core.retransmit_last_response() {
                    return self.fail(reason);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_ack(&mut self) -> Vec<TxAction> {
        use TransactionState::*;
        match self.core.state {
            Completed => {
                self.core.set_state(Confirmed);
                vec![
                    TxAction::CancelTimer(TimerType::G),
                    TxAction::CancelTimer(TimerType::H),
                    TxAction::ArmTimer(
                        TimerType::I,
                        self.core
                            .settings
                            .absorption_delay(TimerType::I, self.core.reliable()),
                    ),
                ]
            }
            Confirmed => {
                trace!(key = %self.core.key, "duplicate ACK absorbed");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_send_response(&mut self, response: Response) -> Vec<TxAction> {
        use TransactionState::*;
        if self.core.state != Proceeding {
            debug!(key = %self.core.key, state = %self.core.state, "response dropped, final already sent");
            return Vec::new();
        }
        let status = response.status;
        if let Err(reason) = self.core.transmit(&Message::Response(response.clone())) {
            return self.fail(reason);
        }
        self.core.last_response = Some(response);
        if status.is_provisional() {
            return Vec::new();
        }
        if status.is_success() {
            // 2xx handed to the dialog layer; nothing left to do here.
            self.core.set_state(Terminated);
            return vec![TxAction::CancelAllTimers, TxAction::Terminated];
        }
        self.core.set_state(Completed);
        let mut actions = vec![TxAction::ArmTimer(
            TimerType::H,
            self.core.settings.transaction_timeout(),
        )];
        if let Some(interval) = self.core.settings.retransmit_start(self.core.reliable()) {
            self.core.retransmit_interval = interval;
            actions.push(TxAction::ArmTimer(TimerType::G, interval));
        }
        actions
    }

    fn on_timer(&mut self, timer: TimerType) -> Vec<TxAction> {
        use TransactionState::*;
        match (timer, self.core.state) {
            (TimerType::G, Completed) => {
                if let Err(reason) = self.core.retransmit_last_response() {
                    return self.fail(reason);
                }
                let next = self
                    .core
                    .settings
                    .next_retransmit_interval(self.core.retransmit_interval);
                self.core.retransmit_interval = next;
                vec![TxAction::RescheduleCurrentTimer(next)]
            }
            (TimerType::H, Completed) => {
                // No ACK ever came; the call layer needs to clean up.
                debug!(key = %self.core.key, "timed out waiting for ACK");
                self.core.set_state(Terminated);
                vec![
                    TxAction::TimedOut,
                    TxAction::CancelAllTimers,
                    TxAction::Terminated,
                ]
            }
            (TimerType::I, Confirmed) => {
                self.core.set_state(Terminated);
                vec![TxAction::CancelAllTimers, TxAction::Terminated]
            }
            _ => Vec::new(),
        }
    }

    fn fail(&mut self, reason: String) -> Vec<TxAction> {
        self.core.set_state(TransactionState::Terminated);
        vec![
            TxAction::TransportFailed(reason),
            TxAction::CancelAllTimers,
            TxAction::Terminated,
        ]
    }
}

/// Non-INVITE server transaction.
///
/// Trying until the application responds; retransmitted requests replay
/// the last response (silence while still in Trying). Any final moves to
/// Completed, where timer J absorbs request retransmissions before
/// termination.
pub(crate) struct NonInviteServer {
    pub core: TransactionCore,
}

impl NonInviteServer {
    pub fn new(
        key: TransactionKey,
        request: Request,
        channel: ChannelRef,
        settings: TimerSettings,
    ) -> Self {
        Self {
            core: TransactionCore::new(
                key,
                TransactionKind::NonInviteServer,
                request,
                channel,
                settings,
            ),
        }
    }

    pub fn handle(&mut self, input: TxInput) -> Vec<TxAction> {
        if self.core.state.is_terminated() {
            return Vec::new();
        }
        match input {
            TxInput::Start => {
                self.core.set_state(TransactionState::Trying);
                Vec::new()
            }
            TxInput::Request(request) => self.on_request(request),
            TxInput::SendResponse(response) => self.on_send_response(response),
            TxInput::Timer(timer) => self.on_timer(timer),
            TxInput::TransportError(reason) => self.fail(reason),
            other => {
                trace!(key = %self.core.key, ?other, "input ignored");
                Vec::new()
            }
        }
    }

    fn on_request(&mut self, _request: Request) -> Vec<TxAction> {
        use TransactionState::*;
        match self.core.state {
            Trying => {
                // Nothing sent yet, nothing to replay.
                trace!(key = %self.core.key, "request retransmission absorbed");
                Vec::new()
            }
            Proceeding | Completed => {
                if let Err(reason) = self.core.retransmit_last_response() {
                    return self.fail(reason);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_send_response(&mut self, response: Response) -> Vec<TxAction> {
        use TransactionState::*;
        if !matches!(self.core.state, Trying | Proceeding) {
            debug!(key = %self.core.key, state = %self.core.state, "response dropped, final already sent");
            return Vec::new();
        }
        let status = response.status;
        if let Err(reason) = self.core.transmit(&Message::Response(response.clone())) {
            return self.fail(reason);
        }
        self.core.last_response = Some(response);
        if status.is_provisional() {
            if self.core.state == Trying {
                self.core.set_state(Proceeding);
            }
            return Vec::new();
        }
        self.core.set_state(Completed);
        vec![TxAction::ArmTimer(
            TimerType::J,
            self.core
                .settings
                .absorption_delay(TimerType::J, self.core.reliable()),
        )]
    }

    fn on_timer(&mut self, timer: TimerType) -> Vec<TxAction> {
        match (timer, self.core.state) {
            (TimerType::J, TransactionState::Completed) => {
                self.core.set_state(TransactionState::Terminated);
                vec![TxAction::CancelAllTimers, TxAction::Terminated]
            }
            _ => Vec::new(),
        }
    }

    fn fail(&mut self, reason: String) -> Vec<TxAction> {
        self.core.set_state(TransactionState::Terminated);
        vec![
            TxAction::TransportFailed(reason),
            TxAction::CancelAllTimers,
            TxAction::Terminated,
        ]
    }
}
