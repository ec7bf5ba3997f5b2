//! # signaling-core
//!
//! A SIP (RFC 3261) signaling engine: the four transaction state machines,
//! dialog matching and the retransmission/timeout policy, all driven by a
//! single cooperative main loop.
//!
//! The crate deliberately stops at the signaling layer. Message parsing and
//! socket I/O are collaborator concerns behind the [`message`] and
//! [`transport`] abstractions; call control sits above the
//! [`SignalingListener`] callbacks.
//!
//! ## Architecture
//!
//! - [`scheduler::MainLoop`] runs timer and socket sources on one thread;
//!   other threads hand work in through `do_later`.
//! - [`provider::Provider`] owns every transaction machine and dialog,
//!   routes inbound messages by transaction key or dialog triple, and arms
//!   the RFC 3261 timers on the loop.
//! - [`transaction`] holds the ICT/NICT/IST/NIST machines; [`timer`] holds
//!   the T1/T2/T4-derived delay policy; [`dialog`] tracks identity triples,
//!   CSeq ordering and frozen route sets.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use signaling_core::{EngineConfig, MainLoop, Provider, SignalingListener};
//!
//! struct App;
//! impl SignalingListener for App {}
//!
//! # async fn run() {
//! let main_loop = MainLoop::new();
//! let provider = Provider::new(main_loop.clone(), Arc::new(App), EngineConfig::default());
//! // provider.attach_channel(...), provider.send_request(...)
//! main_loop.run().await;
//! # }
//! ```

pub mod dialog;
pub mod error;
pub mod message;
pub mod provider;
pub mod scheduler;
pub mod timer;
pub mod transaction;
pub mod transport;

pub use dialog::{Dialog, DialogId, DialogState};
pub use error::{Error, Result};
pub use message::{CSeq, Headers, Message, Method, Request, Response, StatusCode};
pub use provider::{EngineConfig, Provider};
pub use scheduler::{EventSet, MainLoop, Source, SourceId, SourceKind, TimeoutResult};
pub use timer::{TimerSettings, TimerType};
pub use transaction::{
    gen_branch, gen_tag, validate_transition, SignalingListener, TransactionKey, TransactionKind,
    TransactionState,
};
pub use transport::{Channel, ChannelRef, TransportKind};
