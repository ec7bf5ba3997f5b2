//! Client transaction machines: INVITE (ICT) and non-INVITE (NICT).

use tracing::{debug, trace};

use crate::message::{CSeq, Message, Method, Request, Response};
use crate::timer::{TimerSettings, TimerType};
use crate::transport::ChannelRef;

use super::{TransactionCore, TransactionKey, TransactionKind, TransactionState, TxAction, TxInput};

/// ACK for a non-2xx final response: same branch, Call-ID, From and CSeq
/// number as the INVITE, method ACK, To copied from the response so the
/// peer's tag is acknowledged.
fn make_ack(request: &Request, response: &Response) -> Request {
    let mut ack = Request::new(Method::Ack, request.uri.clone());
    ack.headers = request.headers.clone();
    ack.headers.cseq = CSeq::new(request.headers.cseq.seq, Method::Ack);
    ack.headers.to_tag = response.headers.to_tag.clone();
    ack
}

/// INVITE client transaction.
///
/// Calling -> Proceeding on 1xx, -> Completed on 3xx-6xx (ACK sent, late
/// duplicates re-ACKed until timer D), -> Terminated on 2xx, timer B or
/// transport failure. 2xx terminates immediately: its ACK belongs to the
/// dialog layer, not this transaction.
pub(crate) struct InviteClient {
    pub core: TransactionCore,
    /// ACK cached for replay on retransmitted non-2xx finals.
    ack: Option<Request>,
}

impl InviteClient {
    pub fn new(
        key: TransactionKey,
        request: Request,
        channel: ChannelRef,
        settings: TimerSettings,
    ) -> Self {
        Self {
            core: TransactionCore::new(key, TransactionKind::InviteClient, request, channel, settings),
            ack: None,
        }
    }

    pub fn handle(&mut self, input: TxInput) -> Vec<TxAction> {
        if self.core.state.is_terminated() {
            return Vec::new();
        }
        match input {
            TxInput::Start => self.start(),
            TxInput::Response(response) => self.on_response(response),
            TxInput::Timer(timer) => self.on_timer(timer),
            TxInput::TransportError(reason) => self.fail(reason),
            other => {
                trace!(key = %self.core.key, ?other, "input ignored");
                Vec::new()
            }
        }
    }

    fn start(&mut self) -> Vec<TxAction> {
        self.core.set_state(TransactionState::Calling);
        if let Err(reason) = self.core.transmit_request() {
            return self.fail(reason);
        }
        let mut actions = Vec::new();
        if let Some(interval) = self.core.settings.retransmit_start(self.core.reliable()) {
            self.core.retransmit_interval = interval;
            actions.push(TxAction::ArmTimer(TimerType::A, interval));
        }
        actions.push(TxAction::ArmTimer(
            TimerType::B,
            self.core.settings.transaction_timeout(),
        ));
        actions
    }

    fn on_response(&mut self, response: Response) -> Vec<TxAction> {
        use TransactionState::*;
        let status = response.status;
        match self.core.state {
            Calling | Proceeding if status.is_provisional() => {
                let mut actions = Vec::new();
                if self.core.state == Calling {
                    // First provisional stops request retransmission.
                    self.core.set_state(Proceeding);
                    actions.push(TxAction::CancelTimer(TimerType::A));
                }
                self.core.last_response = Some(response.clone());
                actions.push(TxAction::Provisional(response));
                actions
            }
            Calling | Proceeding if status.is_success() => {
                self.core.last_response = Some(response.clone());
                self.core.set_state(Terminated);
                vec![
                    TxAction::Final(response),
                    TxAction::CancelAllTimers,
                    TxAction::Terminated,
                ]
            }
            Calling | Proceeding => {
                // 3xx-6xx: acknowledge, report, then linger on timer D to
                // absorb response retransmissions.
                let ack = make_ack(&self.core.request, &response);
                if let Err(reason) = self.core.transmit(&Message::Request(ack.clone())) {
                    return self.fail(reason);
                }
                self.ack = Some(ack);
                self.core.last_response = Some(response.clone());
                self.core.set_state(Completed);
                vec![
                    TxAction::Final(response),
                    TxAction::CancelTimer(TimerType::A),
                    TxAction::CancelTimer(TimerType::B),
                    TxAction::ArmTimer(
                        TimerType::D,
                        self.core
                            .settings
                            .absorption_delay(TimerType::D, self.core.reliable()),
                    ),
                ]
            }
            Completed if status.is_final() => {
                // Retransmitted final: replay the ACK, stay silent upward.
                if let Some(ack) = self.ack.clone() {
                    if let Err(reason) = self.core.transmit(&Message::Request(ack)) {
                        return self.fail(reason);
                    }
                }
                Vec::new()
            }
            _ => {
                trace!(key = %self.core.key, status = %status, "response absorbed");
                Vec::new()
            }
        }
    }

    fn on_timer(&mut self, timer: TimerType) -> Vec<TxAction> {
        use TransactionState::*;
        match (timer, self.core.state) {
            (TimerType::A, Calling) => {
                if let Err(reason) = self.core.transmit_request() {
                    return self.fail(reason);
                }
                let next = self
                    .core
                    .settings
                    .next_retransmit_interval(self.core.retransmit_interval);
                self.core.retransmit_interval = next;
                vec![TxAction::RescheduleCurrentTimer(next)]
            }
            (TimerType::B, Calling) | (TimerType::B, Proceeding) => {
                debug!(key = %self.core.key, "timed out waiting for final response");
                self.core.set_state(Terminated);
                vec![
                    TxAction::TimedOut,
                    TxAction::CancelAllTimers,
                    TxAction::Terminated,
                ]
            }
            (TimerType::D, Completed) => {
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

/// Non-INVITE client transaction.
///
/// Trying -> Proceeding on 1xx (retransmission continues, clamped at T2),
/// -> Completed on any final (timer K absorbs duplicates), -> Terminated
/// on timer F, timer K or transport failure.
pub(crate) struct NonInviteClient {
    pub core: TransactionCore,
}

impl NonInviteClient {
    pub fn new(
        key: TransactionKey,
        request: Request,
        channel: ChannelRef,
        settings: TimerSettings,
    ) -> Self {
        Self {
            core: TransactionCore::new(
                key,
                TransactionKind::NonInviteClient,
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
            TxInput::Start => self.start(),
            TxInput::Response(response) => self.on_response(response),
            TxInput::Timer(timer) => self.on_timer(timer),
            TxInput::TransportError(reason) => self.fail(reason),
            other => {
                trace!(key = %self.core.key, ?other, "input ignored");
                Vec::new()
            }
        }
    }

    fn start(&mut self) -> Vec<TxAction> {
        self.core.set_state(TransactionState::Trying);
        if let Err(reason) = self.core.transmit_request() {
            return self.fail(reason);
        }
        let mut actions = Vec::new();
        if let Some(interval) = self.core.settings.retransmit_start(self.core.reliable()) {
            self.core.retransmit_interval = interval;
            actions.push(TxAction::ArmTimer(TimerType::E, interval));
        }
        actions.push(TxAction::ArmTimer(
            TimerType::F,
            self.core.settings.transaction_timeout(),
        ));
        actions
    }

    fn on_response(&mut self, response: Response) -> Vec<TxAction> {
        use TransactionState::*;
        let status = response.status;
        match self.core.state {
            Trying | Proceeding if status.is_provisional() => {
                let mut actions = Vec::new();
                if self.core.state == Trying {
                    self.core.set_state(Proceeding);
                }
                self.core.last_response = Some(response.clone());
                actions.push(TxAction::Provisional(response));
                actions
            }
            Trying | Proceeding => {
                self.core.last_response = Some(response.clone());
                self.core.set_state(Completed);
                vec![
                    TxAction::Final(response),
                    TxAction::CancelTimer(TimerType::E),
                    TxAction::CancelTimer(TimerType::F),
                    TxAction::ArmTimer(
                        TimerType::K,
                        self.core
                            .settings
                            .absorption_delay(TimerType::K, self.core.reliable()),
                    ),
                ]
            }
            _ => {
                trace!(key = %self.core.key, status = %status, "response absorbed");
                Vec::new()
            }
        }
    }

    fn on_timer(&mut self, timer: TimerType) -> Vec<TxAction> {
        use TransactionState::*;
        match (timer, self.core.state) {
            (TimerType::E, Trying) => {
                if let Err(reason) = self.core.transmit_request() {
                    return self.fail(reason);
                }
                let next = self
                    .core
                    .settings
                    .next_retransmit_interval(self.core.retransmit_interval);
                self.core.retransmit_interval = next;
                vec![TxAction::RescheduleCurrentTimer(next)]
            }
            (TimerType::E, Proceeding) => {
                // Once a provisional arrived the cadence is flat T2.
                if let Err(reason) = self.core.transmit_request() {
                    return self.fail(reason);
                }
                let t2 = self.core.settings.t2;
                self.core.retransmit_interval = t2;
                vec![TxAction::RescheduleCurrentTimer(t2)]
            }
            (TimerType::F, Trying) | (TimerType::F, Proceeding) => {
                debug!(key = %self.core.key, "timed out waiting for final response");
                self.core.set_state(Terminated);
                vec![
                    TxAction::TimedOut,
                    TxAction::CancelAllTimers,
                    TxAction::Terminated,
                ]
            }
            (TimerType::K, Completed) => {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;
    use crate::transport::{Channel, TransportKind};
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct MockChannel {
        kind: TransportKind,
        sent: Mutex<Vec<Message>>,
    }

    impl MockChannel {
        fn udp() -> Arc<Self> {
            Arc::new(Self {
                kind: TransportKind::Udp,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn tcp() -> Arc<Self> {
            Arc::new(Self {
                kind: TransportKind::Tcp,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Channel for MockChannel {
        fn send(&self, message: &Message) -> crate::error::Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn poll_incoming(&self) -> Option<Message> {
            None
        }
    }

    fn invite(branch: &str) -> Request {
        let mut request = Request::new(Method::Invite, "sip:bob@example.com");
        request.headers.via_branch = Some(branch.to_string());
        request.headers.call_id = "call-1".into();
        request.headers.from_tag = Some("ft".into());
        request.headers.cseq = CSeq::new(1, Method::Invite);
        request
    }

    fn start_ict(channel: Arc<MockChannel>) -> InviteClient {
        let request = invite("z9hG4bKict");
        let key = TransactionKey::from_request(&request, false).unwrap();
        let mut machine = InviteClient::new(key, request, channel, TimerSettings::default());
        machine.handle(TxInput::Start);
        machine
    }

    #[test]
    fn ict_start_arms_retransmit_and_timeout_on_udp() {
        let channel = MockChannel::udp();
        let request = invite("z9hG4bKict");
        let key = TransactionKey::from_request(&request, false).unwrap();
        let mut machine =
            InviteClient::new(key, request, channel.clone(), TimerSettings::default());
        let actions = machine.handle(TxInput::Start);
        assert_eq!(channel.sent_count(), 1);
        assert_eq!(machine.core.state, TransactionState::Calling);
        assert!(matches!(actions[0], TxAction::ArmTimer(TimerType::A, _)));
        assert!(matches!(actions[1], TxAction::ArmTimer(TimerType::B, _)));
    }

    #[test]
    fn ict_reliable_transport_skips_timer_a() {
        let channel = MockChannel::tcp();
        let request = invite("z9hG4bKict");
        let key = TransactionKey::from_request(&request, false).unwrap();
        let mut machine = InviteClient::new(key, request, channel, TimerSettings::default());
        let actions = machine.handle(TxInput::Start);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], TxAction::ArmTimer(TimerType::B, _)));
    }

    #[test]
    fn ict_first_provisional_stops_retransmission() {
        let channel = MockChannel::udp();
        let mut machine = start_ict(channel);
        let response = Response::for_request(&machine.core.request, StatusCode::RINGING);
        let actions = machine.handle(TxInput::Response(response));
        assert_eq!(machine.core.state, TransactionState::Proceeding);
        assert!(actions
            .iter()
            .any(|a| matches!(a, TxAction::CancelTimer(TimerType::A))));
        assert!(actions.iter().any(|a| matches!(a, TxAction::Provisional(_))));
    }

    #[test]
    fn ict_2xx_terminates_immediately() {
        let channel = MockChannel::udp();
        let mut machine = start_ict(channel.clone());
        let response =
            Response::for_request_with_tag(&machine.core.request, StatusCode::OK, "remote");
        let actions = machine.handle(TxInput::Response(response));
        assert_eq!(machine.core.state, TransactionState::Terminated);
        assert!(actions.iter().any(|a| matches!(a, TxAction::Final(_))));
        assert!(actions.iter().any(|a| matches!(a, TxAction::Terminated)));
        // No ACK from the transaction layer for 2xx.
        assert_eq!(channel.sent_count(), 1);
    }

    #[test]
    fn ict_failure_final_is_acked_and_duplicates_reacked() {
        let channel = MockChannel::udp();
        let mut machine = start_ict(channel.clone());
        let response =
            Response::for_request_with_tag(&machine.core.request, StatusCode(486), "remote");
        let actions = machine.handle(TxInput::Response(response.clone()));
        assert_eq!(machine.core.state, TransactionState::Completed);
        assert!(actions
            .iter()
            .any(|a| matches!(a, TxAction::ArmTimer(TimerType::D, _))));
        // INVITE + ACK on the wire.
        assert_eq!(channel.sent_count(), 2);
        {
            let sent = channel.sent.lock().unwrap();
            match &sent[1] {
                Message::Request(ack) => {
                    assert_eq!(ack.method, Method::Ack);
                    assert_eq!(ack.headers.cseq.seq, 1);
                    assert_eq!(ack.to_tag(), Some("remote"));
                }
                other => panic!("expected ACK, got {other}"),
            }
        }
        // A retransmitted 486 is re-ACKed without a second Final report.
        let dup_actions = machine.handle(TxInput::Response(response));
        assert!(dup_actions.is_empty());
        assert_eq!(channel.sent_count(), 3);
    }

    #[test]
    fn ict_timer_a_doubles_until_t2() {
        let channel = MockChannel::udp();
        let mut machine = start_ict(channel.clone());
        let mut intervals = Vec::new();
        for _ in 0..5 {
            let actions = machine.handle(TxInput::Timer(TimerType::A));
            match &actions[0] {
                TxAction::RescheduleCurrentTimer(d) => intervals.push(d.as_millis()),
                other => panic!("expected reschedule, got {other:?}"),
            }
        }
        assert_eq!(intervals, vec![1000, 2000, 4000, 4000, 4000]);
        // Initial send plus five retransmissions.
        assert_eq!(channel.sent_count(), 6);
    }

    #[test]
    fn ict_timer_b_reports_timeout() {
        let channel = MockChannel::udp();
        let mut machine = start_ict(channel);
        let actions = machine.handle(TxInput::Timer(TimerType::B));
        assert_eq!(machine.core.state, TransactionState::Terminated);
        assert!(actions.iter().any(|a| matches!(a, TxAction::TimedOut)));
        assert!(actions.iter().any(|a| matches!(a, TxAction::Terminated)));
    }

    #[test]
    fn nict_final_moves_to_completed_then_k_terminates() {
        let channel = MockChannel::udp();
        let mut request = invite("z9hG4bKnict");
        request.method = Method::Options;
        request.headers.cseq = CSeq::new(1, Method::Options);
        let key = TransactionKey::from_request(&request, false).unwrap();
        let mut machine =
            NonInviteClient::new(key, request, channel.clone(), TimerSettings::default());
        machine.handle(TxInput::Start);
        assert_eq!(machine.core.state, TransactionState::Trying);

        let response = Response::for_request(&machine.core.request, StatusCode::OK);
        let actions = machine.handle(TxInput::Response(response.clone()));
        assert_eq!(machine.core.state, TransactionState::Completed);
        assert!(actions
            .iter()
            .any(|a| matches!(a, TxAction::ArmTimer(TimerType::K, _))));

        // Duplicate final is absorbed, nothing re-sent, nothing reported.
        let dup = machine.handle(TxInput::Response(response));
        assert!(dup.is_empty());
        assert_eq!(channel.sent_count(), 1);

        let end = machine.handle(TxInput::Timer(TimerType::K));
        assert_eq!(machine.core.state, TransactionState::Terminated);
        assert!(end.iter().any(|a| matches!(a, TxAction::Terminated)));
    }

    #[test]
    fn nict_timer_e_flattens_to_t2_in_proceeding() {
        let channel = MockChannel::udp();
        let mut request = invite("z9hG4bKnict2");
        request.method = Method::Register;
        request.headers.cseq = CSeq::new(1, Method::Register);
        let key = TransactionKey::from_request(&request, false).unwrap();
        let mut machine = NonInviteClient::new(key, request, channel, TimerSettings::default());
        machine.handle(TxInput::Start);

        let provisional = Response::for_request(&machine.core.request, StatusCode::TRYING);
        machine.handle(TxInput::Response(provisional));
        assert_eq!(machine.core.state, TransactionState::Proceeding);

        let actions = machine.handle(TxInput::Timer(TimerType::E));
        match &actions[0] {
            TxAction::RescheduleCurrentTimer(d) => assert_eq!(d.as_millis(), 4000),
            other => panic!("expected reschedule, got {other:?}"),
        }
    }
}
