//! Provider: the engine façade.
//!
//! Owns every transaction machine and dialog, arms transaction timers on
//! the main loop, routes inbound messages from attached channels and
//! reports protocol events through the [`SignalingListener`]. Machines are
//! plain values in the provider's tables; timers refer to their
//! transaction by key and a fired timer whose transaction is already gone
//! is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::dialog::{Dialog, DialogId, DialogState};
use crate::error::{Error, Result};
use crate::message::{Message, Method, Request, Response, StatusCode};
use crate::scheduler::{EventSet, MainLoop, SourceId, TimeoutResult};
use crate::timer::{TimerSettings, TimerType};
use crate::transaction::{
    gen_branch, SignalingListener, TransactionKey, TransactionMachine, TransactionState, TxAction,
    TxInput,
};
use crate::transport::ChannelRef;

/// Engine configuration. No process-wide defaults: every provider carries
/// its own copy.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub timers: TimerSettings,
    /// Answer a fresh INVITE with 100 Trying before the application sees
    /// it.
    pub auto_respond_trying: bool,
}

struct TxEntry {
    machine: TransactionMachine,
    timers: HashMap<TimerType, SourceId>,
}

struct Core {
    transactions: HashMap<TransactionKey, TxEntry>,
    dialogs: HashMap<DialogId, Dialog>,
    channels: Vec<(SourceId, ChannelRef)>,
}

struct ProviderInner {
    main_loop: MainLoop,
    listener: Arc<dyn SignalingListener>,
    config: EngineConfig,
    core: Mutex<Core>,
}

/// Listener notifications, collected while the provider lock is held and
/// delivered after it is released so listeners may call back in.
enum Notice {
    Provisional(TransactionKey, Response),
    Final(TransactionKey, Response),
    Timeout(TransactionKey),
    TransportError(TransactionKey, Error),
    TransactionTerminated(TransactionKey),
    NewServerTransaction(TransactionKey, Request, Option<DialogId>),
    InDialogRequest(DialogId, Request),
    StrayResponse(Response),
    DialogCreated(DialogId),
    DialogConfirmed(DialogId),
    DialogTerminated(DialogId),
}

/// Cheaply clonable handle to the engine.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl Provider {
    pub fn new(
        main_loop: MainLoop,
        listener: Arc<dyn SignalingListener>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                main_loop,
                listener,
                config,
                core: Mutex::new(Core {
                    transactions: HashMap::new(),
                    dialogs: HashMap::new(),
                    channels: Vec::new(),
                }),
            }),
        }
    }

    pub fn main_loop(&self) -> &MainLoop {
        &self.inner.main_loop
    }

    pub fn timer_settings(&self) -> &TimerSettings {
        &self.inner.config.timers
    }

    fn lock_core(&self) -> std::sync::MutexGuard<'_, Core> {
        match self.inner.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a channel. Its loop source drains `poll_incoming` whenever
    /// the channel marks itself ready; an ERROR event fails every
    /// transaction bound to the channel and drops the source.
    pub fn attach_channel(&self, channel: ChannelRef) -> SourceId {
        let weak = Arc::downgrade(&self.inner);
        let hooked = channel.clone();
        let name = format!("channel {}", channel.peer());
        let source_id = self.inner.main_loop.add_socket_source(&name, move |events| {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return TimeoutResult::Stop,
            };
            let provider = Provider { inner };
            if events.contains(EventSet::ERROR) {
                provider.on_channel_error(&hooked);
                return TimeoutResult::Stop;
            }
            while let Some(message) = hooked.poll_incoming() {
                provider.on_message(message, &hooked);
            }
            TimeoutResult::Continue
        });
        self.lock_core().channels.push((source_id, channel));
        source_id
    }

    /// Creates and starts a client transaction for `request`. A missing
    /// branch is generated. If the request carries both tags and they match
    /// a known dialog, the transaction is bound to it.
    pub fn send_request(&self, mut request: Request, channel: ChannelRef) -> Result<TransactionKey> {
        if request.branch().is_none() {
            request.headers.via_branch = Some(gen_branch());
        }
        let key = TransactionKey::from_request(&request, false)?;
        {
            let mut core = self.lock_core();
            if core.transactions.contains_key(&key) {
                return Err(Error::TransactionExists(key));
            }
            let dialog = self.dialog_of_request(&core, &request);
            let mut machine = TransactionMachine::new_client(
                key.clone(),
                request,
                channel,
                self.inner.config.timers.clone(),
            );
            if let Some(did) = dialog {
                machine.set_dialog(did);
            }
            core.transactions.insert(
                key.clone(),
                TxEntry {
                    machine,
                    timers: HashMap::new(),
                },
            );
        }
        debug!(key = %key, "client transaction created");
        let mut notices = Vec::new();
        {
            let mut core = self.lock_core();
            self.dispatch_locked(&mut core, &key, TxInput::Start, &mut notices);
        }
        self.emit(notices);
        Ok(key)
    }

    /// Sends a response through the server transaction identified by
    /// `key`. Dialog-establishing responses (tagged 1xx/2xx to a
    /// dialog-creating method) create or confirm the server-side dialog;
    /// a 2xx to a BYE tears its dialog down.
    pub fn send_response(&self, key: &TransactionKey, response: Response) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut core = self.lock_core();
            let (method, dialog) = {
                let entry = core
                    .transactions
                    .get(key)
                    .ok_or_else(|| Error::TransactionNotFound(key.clone()))?;
                (
                    entry.machine.request().method.clone(),
                    entry.machine.dialog().cloned(),
                )
            };
            if response.to_tag().is_some()
                && method.creates_dialog()
                && !response.status.is_failure()
            {
                self.note_server_dialog(&mut core, key, &response, &mut notices);
            }
            self.dispatch_locked(
                &mut core,
                key,
                TxInput::SendResponse(response.clone()),
                &mut notices,
            );
            if let Some(did) = dialog {
                if method == Method::Bye && response.status.is_success() {
                    self.terminate_dialog_locked(&mut core, &did, &mut notices);
                } else if response.status.is_failure() && self.is_early(&core, &did) {
                    // A failure final kills the early dialog the
                    // provisionals opened.
                    self.terminate_dialog_locked(&mut core, &did, &mut notices);
                }
            }
        }
        self.emit(notices);
        Ok(())
    }

    /// Builds an in-dialog request (next local CSeq, dialog route set and
    /// identity). The caller sends it with [`Provider::send_request`].
    pub fn create_in_dialog_request(&self, id: &DialogId, method: Method) -> Result<Request> {
        let mut core = self.lock_core();
        let dialog = core
            .dialogs
            .get_mut(id)
            .ok_or_else(|| Error::DialogNotFound(id.to_string()))?;
        if dialog.state() == DialogState::Terminated {
            return Err(Error::DialogNotFound(id.to_string()));
        }
        Ok(dialog.create_request(method))
    }

    /// Drops a transaction without waiting for its machine to finish.
    pub fn terminate_transaction(&self, key: &TransactionKey) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut core = self.lock_core();
            if !core.transactions.contains_key(key) {
                return Err(Error::TransactionNotFound(key.clone()));
            }
            self.finish_transaction(&mut core, key, &mut notices);
        }
        self.emit(notices);
        Ok(())
    }

    /// Ends a dialog explicitly. Later requests for its triple get 481.
    pub fn terminate_dialog(&self, id: &DialogId) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut core = self.lock_core();
            if !core.dialogs.contains_key(id) {
                return Err(Error::DialogNotFound(id.to_string()));
            }
            self.terminate_dialog_locked(&mut core, id, &mut notices);
        }
        self.emit(notices);
        Ok(())
    }

    pub fn transaction_state(&self, key: &TransactionKey) -> Option<TransactionState> {
        self.lock_core()
            .transactions
            .get(key)
            .map(|e| e.machine.state())
    }

    pub fn transaction_count(&self) -> usize {
        self.lock_core().transactions.len()
    }

    pub fn dialog_state(&self, id: &DialogId) -> Option<DialogState> {
        self.lock_core().dialogs.get(id).map(|d| d.state())
    }

    pub fn dialog_ids(&self) -> Vec<DialogId> {
        self.lock_core().dialogs.keys().cloned().collect()
    }

    /// Entry point for inbound messages; normally called from a channel's
    /// readiness callback on the loop thread.
    pub fn on_message(&self, message: Message, channel: &ChannelRef) {
        match message {
            Message::Response(response) => self.on_response(response),
            Message::Request(request) => self.on_request(request, channel),
        }
    }

    fn on_response(&self, response: Response) {
        let key = match TransactionKey::from_response(&response) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "unroutable response dropped");
                return;
            }
        };
        let mut notices = Vec::new();
        {
            let mut core = self.lock_core();
            if !core.transactions.contains_key(&key) {
                trace!(key = %key, "no matching client transaction");
                notices.push(Notice::StrayResponse(response));
            } else {
                self.note_client_dialog(&mut core, &key, &response, &mut notices);
                self.dispatch_locked(&mut core, &key, TxInput::Response(response), &mut notices);
            }
        }
        self.emit(notices);
    }

    fn on_request(&self, request: Request, channel: &ChannelRef) {
        let key = match TransactionKey::from_request(&request, true) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "unroutable request dropped");
                return;
            }
        };
        let mut notices = Vec::new();
        {
            let mut core = self.lock_core();
            if core.transactions.contains_key(&key) {
                // Retransmission, or the ACK for a non-2xx final.
                self.dispatch_locked(&mut core, &key, TxInput::Request(request), &mut notices);
            } else if request.method == Method::Ack {
                // ACK for a 2xx: no transaction, belongs to the dialog.
                match DialogId::for_incoming_request(&request) {
                    Ok(did) if core.dialogs.contains_key(&did) => {
                        notices.push(Notice::InDialogRequest(did, request));
                    }
                    _ => trace!(key = %key, "ACK matched nothing, dropped"),
                }
            } else if request.to_tag().is_some() {
                self.on_in_dialog_request(&mut core, key, request, channel, &mut notices);
            } else {
                self.new_server_transaction(&mut core, key, request, channel, None, &mut notices);
            }
        }
        self.emit(notices);
    }

    fn on_in_dialog_request(
        &self,
        core: &mut Core,
        key: TransactionKey,
        request: Request,
        channel: &ChannelRef,
        notices: &mut Vec<Notice>,
    ) {
        let did = match DialogId::for_incoming_request(&request) {
            Ok(did) => did,
            Err(e) => {
                warn!(error = %e, "tagged request without dialog identity");
                return;
            }
        };
        match core.dialogs.get_mut(&did) {
            None => {
                debug!(dialog = %did, "no such dialog, answering 481");
                let response = Response::for_request(
                    &request,
                    StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
                );
                if let Err(e) = channel.send(&Message::Response(response)) {
                    warn!(error = %e, "failed to send 481");
                }
            }
            Some(dialog) => {
                if let Err(e) = dialog.check_remote_cseq(request.headers.cseq.seq) {
                    debug!(dialog = %did, error = %e, "answering 500");
                    let response =
                        Response::for_request(&request, StatusCode::SERVER_INTERNAL_ERROR);
                    if let Err(e) = channel.send(&Message::Response(response)) {
                        warn!(error = %e, "failed to send 500");
                    }
                    return;
                }
                self.new_server_transaction(
                    core,
                    key,
                    request,
                    channel,
                    Some(did),
                    notices,
                );
            }
        }
    }

    fn new_server_transaction(
        &self,
        core: &mut Core,
        key: TransactionKey,
        request: Request,
        channel: &ChannelRef,
        dialog: Option<DialogId>,
        notices: &mut Vec<Notice>,
    ) {
        let mut machine = TransactionMachine::new_server(
            key.clone(),
            request.clone(),
            channel.clone(),
            self.inner.config.timers.clone(),
        );
        if let Some(did) = &dialog {
            machine.set_dialog(did.clone());
        }
        core.transactions.insert(
            key.clone(),
            TxEntry {
                machine,
                timers: HashMap::new(),
            },
        );
        debug!(key = %key, "server transaction created");
        self.dispatch_locked(core, &key, TxInput::Start, notices);
        notices.push(Notice::NewServerTransaction(
            key.clone(),
            request.clone(),
            dialog,
        ));
        if self.inner.config.auto_respond_trying && request.method.is_invite() {
            let trying = Response::for_request(&request, StatusCode::TRYING);
            self.dispatch_locked(core, &key, TxInput::SendResponse(trying), notices);
        }
    }

    /// Fails every transaction bound to a broken channel.
    fn on_channel_error(&self, channel: &ChannelRef) {
        warn!(peer = %channel.peer(), "channel error, failing its transactions");
        let mut notices = Vec::new();
        {
            let mut core = self.lock_core();
            core.channels
                .retain(|(_, c)| !Arc::ptr_eq(c, channel));
            let keys: Vec<TransactionKey> = core
                .transactions
                .iter()
                .filter(|(_, e)| Arc::ptr_eq(e.machine.channel(), channel))
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                self.dispatch_locked(
                    &mut core,
                    &key,
                    TxInput::TransportError("channel closed".to_string()),
                    &mut notices,
                );
            }
        }
        self.emit(notices);
    }

    /// Timer entry point; the closure armed by `arm_timer` lands here.
    fn on_timer(&self, key: &TransactionKey, timer: TimerType) -> TimeoutResult {
        trace!(key = %key, timer = %timer, "transaction timer fired");
        let mut notices = Vec::new();
        let result = {
            let mut core = self.lock_core();
            self.dispatch_locked(&mut core, key, TxInput::Timer(timer), &mut notices)
        };
        self.emit(notices);
        result
    }

    fn dispatch_locked(
        &self,
        core: &mut Core,
        key: &TransactionKey,
        input: TxInput,
        notices: &mut Vec<Notice>,
    ) -> TimeoutResult {
        let fired = match &input {
            TxInput::Timer(timer) => Some(*timer),
            _ => None,
        };
        let actions = match core.transactions.get_mut(key) {
            Some(entry) => entry.machine.handle(input),
            None => return TimeoutResult::Stop,
        };
        self.apply_actions(core, key, fired, actions, notices)
    }

    fn apply_actions(
        &self,
        core: &mut Core,
        key: &TransactionKey,
        fired: Option<TimerType>,
        actions: Vec<TxAction>,
        notices: &mut Vec<Notice>,
    ) -> TimeoutResult {
        let mut result = TimeoutResult::Stop;
        for action in actions {
            match action {
                TxAction::ArmTimer(timer, delay) => {
                    let id = self.arm_timer(key.clone(), timer, delay);
                    if let Some(entry) = core.transactions.get_mut(key) {
                        if let Some(old) = entry.timers.insert(timer, id) {
                            self.inner.main_loop.remove_source(old);
                        }
                    }
                }
                TxAction::RescheduleCurrentTimer(delay) => {
                    if let (Some(timer), Some(entry)) = (fired, core.transactions.get(key)) {
                        if let Some(&id) = entry.timers.get(&timer) {
                            if self
                                .inner
                                .main_loop
                                .set_timeout(id, delay.as_millis() as i64)
                                .is_ok()
                            {
                                result = TimeoutResult::Continue;
                            }
                        }
                    }
                }
                TxAction::CancelTimer(timer) => {
                    if let Some(entry) = core.transactions.get_mut(key) {
                        if let Some(id) = entry.timers.remove(&timer) {
                            self.inner.main_loop.remove_source(id);
                        }
                    }
                }
                TxAction::CancelAllTimers => {
                    if let Some(entry) = core.transactions.get_mut(key) {
                        for (_, id) in entry.timers.drain() {
                            self.inner.main_loop.remove_source(id);
                        }
                    }
                    result = TimeoutResult::Stop;
                }
                TxAction::Provisional(response) => {
                    notices.push(Notice::Provisional(key.clone(), response));
                }
                TxAction::Final(response) => {
                    let bound = core.transactions.get(key).map(|e| {
                        (
                            e.machine.request().method.clone(),
                            e.machine.dialog().cloned(),
                        )
                    });
                    if let Some((method, Some(did))) = bound {
                        if method == Method::Bye && response.status.is_success() {
                            // A successful BYE answer ends the dialog on
                            // the caller side too.
                            self.terminate_dialog_locked(core, &did, notices);
                        } else if response.status.is_failure() && self.is_early(core, &did) {
                            self.terminate_dialog_locked(core, &did, notices);
                        }
                    }
                    notices.push(Notice::Final(key.clone(), response));
                }
                TxAction::TimedOut => {
                    notices.push(Notice::Timeout(key.clone()));
                }
                TxAction::TransportFailed(reason) => {
                    notices.push(Notice::TransportError(key.clone(), Error::Transport(reason)));
                }
                TxAction::Terminated => {
                    self.finish_transaction(core, key, notices);
                    result = TimeoutResult::Stop;
                }
            }
        }
        result
    }

    fn arm_timer(&self, key: TransactionKey, timer: TimerType, delay: Duration) -> SourceId {
        let weak = Arc::downgrade(&self.inner);
        let name = format!("{} {}", timer, key);
        self.inner.main_loop.create_timeout(delay, &name, move |_| {
            match weak.upgrade() {
                Some(inner) => Provider { inner }.on_timer(&key, timer),
                None => TimeoutResult::Stop,
            }
        })
    }

    fn finish_transaction(
        &self,
        core: &mut Core,
        key: &TransactionKey,
        notices: &mut Vec<Notice>,
    ) {
        if let Some(entry) = core.transactions.remove(key) {
            for (_, id) in entry.timers {
                self.inner.main_loop.remove_source(id);
            }
            debug!(key = %key, "transaction dropped");
            notices.push(Notice::TransactionTerminated(key.clone()));
        }
    }

    fn is_early(&self, core: &Core, id: &DialogId) -> bool {
        core.dialogs
            .get(id)
            .map(|d| d.state() == DialogState::Early)
            .unwrap_or(false)
    }

    fn terminate_dialog_locked(
        &self,
        core: &mut Core,
        id: &DialogId,
        notices: &mut Vec<Notice>,
    ) {
        if let Some(mut dialog) = core.dialogs.remove(id) {
            dialog.terminate();
            notices.push(Notice::DialogTerminated(id.clone()));
        }
    }

    /// Dialog a full-identity outgoing request belongs to, if known.
    fn dialog_of_request(&self, core: &Core, request: &Request) -> Option<DialogId> {
        let local = request.from_tag()?;
        let remote = request.to_tag()?;
        let did = DialogId::new(request.call_id(), local, remote);
        core.dialogs.contains_key(&did).then_some(did)
    }

    /// Dialog bookkeeping for a response arriving at a client transaction:
    /// tagged 1xx/2xx to a dialog-creating method creates an (early)
    /// dialog, a 2xx promotes the matching early one, and a fresh remote
    /// tag forks a parallel dialog.
    fn note_client_dialog(
        &self,
        core: &mut Core,
        key: &TransactionKey,
        response: &Response,
        notices: &mut Vec<Notice>,
    ) {
        if response.to_tag().is_none() || response.status.is_failure() {
            return;
        }
        let entry = match core.transactions.get_mut(key) {
            Some(entry) => entry,
            None => return,
        };
        if !entry.machine.request().method.creates_dialog() {
            return;
        }
        let request = entry.machine.request();
        let (local, remote) = match (request.from_tag(), response.to_tag()) {
            (Some(l), Some(r)) => (l.to_string(), r.to_string()),
            _ => return,
        };
        let did = DialogId::new(request.call_id(), local, remote);
        if let Some(dialog) = core.dialogs.get_mut(&did) {
            if response.status.is_success() {
                let was_early = dialog.state() == DialogState::Early;
                dialog.confirm(response);
                if was_early {
                    notices.push(Notice::DialogConfirmed(did.clone()));
                }
            }
            entry.machine.set_dialog(did);
        } else {
            match Dialog::for_client(entry.machine.request(), response) {
                Ok(dialog) => {
                    let confirmed = dialog.state() == DialogState::Confirmed;
                    core.dialogs.insert(did.clone(), dialog);
                    notices.push(Notice::DialogCreated(did.clone()));
                    if confirmed {
                        notices.push(Notice::DialogConfirmed(did.clone()));
                    }
                    entry.machine.set_dialog(did);
                }
                Err(e) => warn!(key = %key, error = %e, "dialog creation failed"),
            }
        }
    }

    /// Server-side counterpart of [`Provider::note_client_dialog`], driven
    /// by the response the application sends.
    fn note_server_dialog(
        &self,
        core: &mut Core,
        key: &TransactionKey,
        response: &Response,
        notices: &mut Vec<Notice>,
    ) {
        let entry = match core.transactions.get_mut(key) {
            Some(entry) => entry,
            None => return,
        };
        let request = entry.machine.request();
        let (local, remote) = match (response.to_tag(), request.from_tag()) {
            (Some(l), Some(r)) => (l.to_string(), r.to_string()),
            _ => return,
        };
        let did = DialogId::new(request.call_id(), local, remote);
        if let Some(dialog) = core.dialogs.get_mut(&did) {
            if response.status.is_success() {
                let was_early = dialog.state() == DialogState::Early;
                dialog.confirm(response);
                if was_early {
                    notices.push(Notice::DialogConfirmed(did.clone()));
                }
            }
            entry.machine.set_dialog(did);
        } else {
            match Dialog::for_server(entry.machine.request(), response) {
                Ok(dialog) => {
                    let confirmed = dialog.state() == DialogState::Confirmed;
                    core.dialogs.insert(did.clone(), dialog);
                    notices.push(Notice::DialogCreated(did.clone()));
                    if confirmed {
                        notices.push(Notice::DialogConfirmed(did.clone()));
                    }
                    entry.machine.set_dialog(did);
                }
                Err(e) => warn!(key = %key, error = %e, "dialog creation failed"),
            }
        }
    }

    fn emit(&self, notices: Vec<Notice>) {
        let listener = &self.inner.listener;
        for notice in notices {
            match notice {
                Notice::Provisional(key, response) => {
                    listener.on_provisional_response(&key, &response)
                }
                Notice::Final(key, response) => listener.on_final_response(&key, &response),
                Notice::Timeout(key) => listener.on_transaction_timeout(&key),
                Notice::TransportError(key, error) => listener.on_transport_error(&key, &error),
                Notice::TransactionTerminated(key) => listener.on_transaction_terminated(&key),
                Notice::NewServerTransaction(key, request, dialog) => {
                    listener.on_new_server_transaction(&key, &request, dialog.as_ref())
                }
                Notice::InDialogRequest(dialog, request) => {
                    listener.on_in_dialog_request(&dialog, &request)
                }
                Notice::StrayResponse(response) => listener.on_stray_response(&response),
                Notice::DialogCreated(dialog) => listener.on_dialog_created(&dialog),
                Notice::DialogConfirmed(dialog) => listener.on_dialog_confirmed(&dialog),
                Notice::DialogTerminated(dialog) => listener.on_dialog_terminated(&dialog),
            }
        }
    }
}
