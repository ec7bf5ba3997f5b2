//! Shared test fixtures: a scriptable mock channel and a recording
//! listener.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use signaling_core::{
    Channel, CSeq, DialogId, Error, Message, Method, Request, Response, SignalingListener,
    StatusCode, TransactionKey, TransportKind,
};

/// In-memory channel: records everything the engine sends (with a
/// timestamp) and queues inbound messages for `poll_incoming`.
#[derive(Debug)]
pub struct MockChannel {
    kind: TransportKind,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<(Instant, Message)>>,
    incoming: Mutex<VecDeque<Message>>,
}

impl MockChannel {
    pub fn udp() -> Arc<Self> {
        Arc::new(Self {
            kind: TransportKind::Udp,
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            incoming: Mutex::new(VecDeque::new()),
        })
    }

    pub fn tcp() -> Arc<Self> {
        Arc::new(Self {
            kind: TransportKind::Tcp,
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            incoming: Mutex::new(VecDeque::new()),
        })
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn push_incoming(&self, message: Message) {
        self.incoming.lock().unwrap().push_back(message);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }

    /// Milliseconds since `start` for each send, in order.
    pub fn sent_offsets_ms(&self, start: Instant) -> Vec<u64> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| at.duration_since(start).as_millis() as u64)
            .collect()
    }

    pub fn last_sent(&self) -> Option<Message> {
        self.sent.lock().unwrap().last().map(|(_, m)| m.clone())
    }
}

impl Channel for MockChannel {
    fn send(&self, message: &Message) -> signaling_core::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((Instant::now(), message.clone()));
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn poll_incoming(&self) -> Option<Message> {
        self.incoming.lock().unwrap().pop_front()
    }

    fn peer(&self) -> String {
        "192.0.2.1:5060".to_string()
    }
}

/// Everything the engine reported, flattened for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Provisional(TransactionKey, u16),
    Final(TransactionKey, u16),
    Timeout(TransactionKey),
    TransportError(TransactionKey),
    Terminated(TransactionKey),
    NewServerTransaction(TransactionKey, Method, Option<DialogId>),
    InDialogRequest(DialogId, Method),
    Stray(u16),
    DialogCreated(DialogId),
    DialogConfirmed(DialogId),
    DialogTerminated(DialogId),
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl SignalingListener for RecordingListener {
    fn on_provisional_response(&self, key: &TransactionKey, response: &Response) {
        self.push(Event::Provisional(key.clone(), response.status.as_u16()));
    }

    fn on_final_response(&self, key: &TransactionKey, response: &Response) {
        self.push(Event::Final(key.clone(), response.status.as_u16()));
    }

    fn on_transaction_timeout(&self, key: &TransactionKey) {
        self.push(Event::Timeout(key.clone()));
    }

    fn on_transport_error(&self, key: &TransactionKey, _error: &Error) {
        self.push(Event::TransportError(key.clone()));
    }

    fn on_transaction_terminated(&self, key: &TransactionKey) {
        self.push(Event::Terminated(key.clone()));
    }

    fn on_new_server_transaction(
        &self,
        key: &TransactionKey,
        request: &Request,
        dialog: Option<&DialogId>,
    ) {
        self.push(Event::NewServerTransaction(
            key.clone(),
            request.method.clone(),
            dialog.cloned(),
        ));
    }

    fn on_in_dialog_request(&self, dialog: &DialogId, request: &Request) {
        self.push(Event::InDialogRequest(dialog.clone(), request.method.clone()));
    }

    fn on_stray_response(&self, response: &Response) {
        self.push(Event::Stray(response.status.as_u16()));
    }

    fn on_dialog_created(&self, dialog: &DialogId) {
        self.push(Event::DialogCreated(dialog.clone()));
    }

    fn on_dialog_confirmed(&self, dialog: &DialogId) {
        self.push(Event::DialogConfirmed(dialog.clone()));
    }

    fn on_dialog_terminated(&self, dialog: &DialogId) {
        self.push(Event::DialogTerminated(dialog.clone()));
    }
}

/// Out-of-dialog request with the routing headers filled in.
pub fn request(method: Method, branch: &str, call_id: &str, cseq: u32) -> Request {
    let mut request = Request::new(method.clone(), "sip:bob@example.com");
    request.headers.via_branch = Some(branch.to_string());
    request.headers.call_id = call_id.to_string();
    request.headers.from_uri = "sip:alice@example.com".to_string();
    request.headers.from_tag = Some("alice-tag".to_string());
    request.headers.to_uri = "sip:bob@example.com".to_string();
    request.headers.cseq = CSeq::new(cseq, method);
    request
}

pub fn invite(branch: &str) -> Request {
    request(Method::Invite, branch, "call-1", 1)
}

pub fn tagged_response(request: &Request, status: u16, to_tag: &str) -> Response {
    Response::for_request_with_tag(request, StatusCode(status), to_tag)
}
