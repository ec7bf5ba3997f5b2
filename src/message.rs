//! Parsed-message abstraction consumed by the transaction and dialog layers.
//!
//! Grammar-level parsing and the full URI/header object model live in an
//! external collaborator; this module only models the fields the signaling
//! engine actually routes on: method/status, the top Via branch, Call-ID,
//! CSeq, From/To tags and the Record-Route/Route sequences. Everything else
//! (including the body) is carried opaquely.

use std::fmt;

/// SIP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Subscribe,
    Notify,
    Refer,
    Info,
    Message,
    Update,
    Other(String),
}

impl Method {
    /// INVITE requests select the INVITE transaction machines (ICT/IST);
    /// everything else runs on the non-INVITE machines.
    pub fn is_invite(&self) -> bool {
        matches!(self, Method::Invite)
    }

    /// Methods whose tagged 1xx/2xx responses establish a dialog.
    pub fn creates_dialog(&self) -> bool {
        matches!(self, Method::Invite | Method::Subscribe | Method::Refer)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Register => "REGISTER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Update => "UPDATE",
            Method::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SIP response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const TRYING: StatusCode = StatusCode(100);
    pub const RINGING: StatusCode = StatusCode(180);
    pub const OK: StatusCode = StatusCode(200);
    pub const CALL_OR_TRANSACTION_DOES_NOT_EXIST: StatusCode = StatusCode(481);
    pub const SERVER_INTERNAL_ERROR: StatusCode = StatusCode(500);

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// 1xx responses.
    pub fn is_provisional(&self) -> bool {
        self.0 >= 100 && self.0 < 200
    }

    /// 2xx responses.
    pub fn is_success(&self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// 3xx-6xx responses.
    pub fn is_failure(&self) -> bool {
        self.0 >= 300 && self.0 < 700
    }

    /// Any final (non-1xx) response.
    pub fn is_final(&self) -> bool {
        self.0 >= 200
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Trying",
            180 => "Ringing",
            183 => "Session Progress",
            200 => "OK",
            202 => "Accepted",
            302 => "Moved Temporarily",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            481 => "Call/Transaction Does Not Exist",
            486 => "Busy Here",
            487 => "Request Terminated",
            500 => "Server Internal Error",
            503 => "Service Unavailable",
            603 => "Decline",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CSeq header value: sequence number plus the method of the request the
/// sequence refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        Self { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// The headers the engine routes on, shared by requests and responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    /// Branch parameter of the top-most Via header. Primary transaction key.
    pub via_branch: Option<String>,
    pub call_id: String,
    pub cseq: CSeq,
    pub from_uri: String,
    pub from_tag: Option<String>,
    pub to_uri: String,
    pub to_tag: Option<String>,
    pub contact: Option<String>,
    /// Record-Route values in message order (top-most first).
    pub record_route: Vec<String>,
    /// Route values in message order.
    pub route: Vec<String>,
}

impl Headers {
    fn empty(cseq: CSeq) -> Self {
        Self {
            via_branch: None,
            call_id: String::new(),
            cseq,
            from_uri: String::new(),
            from_tag: None,
            to_uri: String::new(),
            to_tag: None,
            contact: None,
            record_route: Vec::new(),
            route: Vec::new(),
        }
    }
}

/// A parsed SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        let cseq = CSeq::new(1, method.clone());
        Self {
            method,
            uri: uri.into(),
            headers: Headers::empty(cseq),
            body: Vec::new(),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.headers.via_branch.as_deref()
    }

    pub fn call_id(&self) -> &str {
        &self.headers.call_id
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.headers.from_tag.as_deref()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.to_tag.as_deref()
    }
}

/// A parsed SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: status.reason_phrase().to_string(),
            headers: Headers::empty(CSeq::new(1, Method::Invite)),
            body: Vec::new(),
        }
    }

    /// Builds a response for `request`, mirroring the headers a UAS must
    /// copy back: top Via branch, Call-ID, CSeq, From (with tag), To and the
    /// Record-Route set.
    pub fn for_request(request: &Request, status: StatusCode) -> Self {
        let mut response = Response::new(status);
        response.headers.via_branch = request.headers.via_branch.clone();
        response.headers.call_id = request.headers.call_id.clone();
        response.headers.cseq = request.headers.cseq.clone();
        response.headers.from_uri = request.headers.from_uri.clone();
        response.headers.from_tag = request.headers.from_tag.clone();
        response.headers.to_uri = request.headers.to_uri.clone();
        response.headers.to_tag = request.headers.to_tag.clone();
        response.headers.record_route = request.headers.record_route.clone();
        response
    }

    /// Same as [`Response::for_request`] with a To tag set, as needed for
    /// dialog-establishing responses.
    pub fn for_request_with_tag(request: &Request, status: StatusCode, to_tag: &str) -> Self {
        let mut response = Response::for_request(request, status);
        response.headers.to_tag = Some(to_tag.to_string());
        response
    }

    pub fn branch(&self) -> Option<&str> {
        self.headers.via_branch.as_deref()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.to_tag.as_deref()
    }
}

/// Either kind of SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    pub fn method(&self) -> &Method {
        match self {
            Message::Request(r) => &r.method,
            Message::Response(r) => &r.headers.cseq.method,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => write!(f, "{} {}", r.method, r.uri),
            Message::Response(r) => write!(f, "{} {}", r.status, r.reason),
        }
    }
}
