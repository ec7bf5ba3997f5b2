//! Dialog layer: identity, lifecycle and in-dialog request bookkeeping.
//!
//! A dialog is keyed by the (Call-ID, local tag, remote tag) triple. Early
//! dialogs appear on the first tagged provisional, are promoted by the
//! matching 2xx, and forked responses with a fresh remote tag create
//! parallel dialogs sharing the Call-ID and local tag.

use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};
use crate::message::{CSeq, Method, Request, Response};
use crate::transaction::gen_branch;

/// Dialog identity triple. "Local" and "remote" are from the owning
/// endpoint's perspective, so both ends derive the same dialog from
/// opposite tag orders.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Identity an incoming mid-dialog request resolves to: our tag is the
    /// To tag, the peer's is the From tag.
    pub fn for_incoming_request(request: &Request) -> Result<Self> {
        let to_tag = request
            .to_tag()
            .ok_or_else(|| Error::InvalidMessage("in-dialog request without To tag".to_string()))?;
        let from_tag = request.from_tag().ok_or_else(|| {
            Error::InvalidMessage("in-dialog request without From tag".to_string())
        })?;
        Ok(Self::new(request.call_id(), to_tag, from_tag))
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Established by a tagged provisional; not yet usable for requests.
    Early,
    /// Established or promoted by a 2xx.
    Confirmed,
    Terminated,
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogState::Early => write!(f, "Early"),
            DialogState::Confirmed => write!(f, "Confirmed"),
            DialogState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// One established (or early) dialog.
#[derive(Debug, Clone)]
pub struct Dialog {
    id: DialogId,
    state: DialogState,
    is_server: bool,
    local_uri: String,
    remote_uri: String,
    /// Peer's Contact; preferred request target for in-dialog requests.
    remote_target: Option<String>,
    local_cseq: u32,
    /// Highest CSeq seen from the peer; `None` until the first in-dialog
    /// request arrives.
    remote_cseq: Option<u32>,
    /// Frozen at creation from Record-Route and never updated afterwards.
    route_set: Vec<String>,
}

impl Dialog {
    /// Dialog seen from the caller: built from the sent request and the
    /// first tagged 1xx/2xx. The route set is the response's Record-Route
    /// reversed, since those entries are listed proxy-closest-to-callee
    /// first.
    pub fn for_client(request: &Request, response: &Response) -> Result<Self> {
        let local_tag = request
            .from_tag()
            .ok_or_else(|| Error::InvalidMessage("request without From tag".to_string()))?;
        let remote_tag = response
            .to_tag()
            .ok_or_else(|| Error::InvalidMessage("untagged response".to_string()))?;
        let id = DialogId::new(request.call_id(), local_tag, remote_tag);
        let mut route_set = response.headers.record_route.clone();
        route_set.reverse();
        let state = if response.status.is_success() {
            DialogState::Confirmed
        } else {
            DialogState::Early
        };
        debug!(dialog = %id, state = %state, "client dialog created");
        Ok(Self {
            id,
            state,
            is_server: false,
            local_uri: request.headers.from_uri.clone(),
            remote_uri: request.headers.to_uri.clone(),
            remote_target: response.headers.contact.clone(),
            local_cseq: request.headers.cseq.seq,
            remote_cseq: None,
            route_set,
        })
    }

    /// Dialog seen from the callee: built from the received request and the
    /// tagged response being sent. The route set is the request's
    /// Record-Route in message order; the request's CSeq seeds the remote
    /// sequence.
    pub fn for_server(request: &Request, response: &Response) -> Result<Self> {
        let local_tag = response
            .to_tag()
            .ok_or_else(|| Error::InvalidMessage("untagged response".to_string()))?;
        let remote_tag = request
            .from_tag()
            .ok_or_else(|| Error::InvalidMessage("request without From tag".to_string()))?;
        let id = DialogId::new(request.call_id(), local_tag, remote_tag);
        let state = if response.status.is_success() {
            DialogState::Confirmed
        } else {
            DialogState::Early
        };
        debug!(dialog = %id, state = %state, "server dialog created");
        Ok(Self {
            id,
            state,
            is_server: true,
            local_uri: request.headers.to_uri.clone(),
            remote_uri: request.headers.from_uri.clone(),
            remote_target: request.headers.contact.clone(),
            local_cseq: 0,
            remote_cseq: Some(request.headers.cseq.seq),
            route_set: request.headers.record_route.clone(),
        })
    }

    pub fn id(&self) -> &DialogId {
        &self.id
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn route_set(&self) -> &[String] {
        &self.route_set
    }

    pub fn remote_target(&self) -> Option<&str> {
        self.remote_target.as_deref()
    }

    pub fn local_cseq(&self) -> u32 {
        self.local_cseq
    }

    pub fn remote_cseq(&self) -> Option<u32> {
        self.remote_cseq
    }

    /// Promotes an early dialog on its 2xx. The route set stays frozen; the
    /// remote target may be refreshed by the 2xx's Contact.
    pub fn confirm(&mut self, response: &Response) {
        if self.state == DialogState::Early {
            debug!(dialog = %self.id, "dialog confirmed");
            self.state = DialogState::Confirmed;
        }
        if response.headers.contact.is_some() {
            self.remote_target = response.headers.contact.clone();
        }
    }

    pub fn terminate(&mut self) {
        if self.state != DialogState::Terminated {
            debug!(dialog = %self.id, "dialog terminated");
            self.state = DialogState::Terminated;
        }
    }

    /// Validates and records the CSeq of an incoming in-dialog request.
    /// The first request seeds the sequence; afterwards anything below the
    /// last seen value is out of order and gets rejected (the engine
    /// answers 500 without touching dialog state).
    pub fn check_remote_cseq(&mut self, cseq: u32) -> Result<()> {
        match self.remote_cseq {
            Some(last) if cseq < last => Err(Error::InvalidMessage(format!(
                "out-of-order CSeq {} (last seen {})",
                cseq, last
            ))),
            _ => {
                self.remote_cseq = Some(cseq);
                Ok(())
            }
        }
    }

    /// Builds an in-dialog request: Call-ID and tags from the dialog,
    /// next local CSeq, target from the peer's Contact (falling back to its
    /// URI) and the frozen route set, with a fresh branch.
    pub fn create_request(&mut self, method: Method) -> Request {
        self.local_cseq += 1;
        let target = self
            .remote_target
            .clone()
            .unwrap_or_else(|| self.remote_uri.clone());
        let mut request = Request::new(method.clone(), target);
        request.headers.via_branch = Some(gen_branch());
        request.headers.call_id = self.id.call_id.clone();
        request.headers.cseq = CSeq::new(self.local_cseq, method);
        request.headers.from_uri = self.local_uri.clone();
        request.headers.from_tag = Some(self.id.local_tag.clone());
        request.headers.to_uri = self.remote_uri.clone();
        request.headers.to_tag = Some(self.id.remote_tag.clone());
        request.headers.route = self.route_set.clone();
        request
    }
}
