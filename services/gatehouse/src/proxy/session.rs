//! Per-connection interception state.
//!
//! A [`Session`] is fed the raw bytes a client sends before any routing
//! decision exists. It keeps them in a bounded hold buffer, re-runs the
//! sniffer chain over the whole buffer on every chunk, and produces exactly
//! one terminal verdict:
//!
//! ```text
//!              +--> Routed       (forward held bytes to a backend)
//! Collecting --+
//!              +--> Passthrough  (release held bytes to the fallback)
//! ```
//!
//! The session performs no I/O of its own. The connection driver acts on the
//! verdict, which keeps the replay-exactly-once rule in one place: held bytes
//! leave the session either in [`Verdict::Release`] or via
//! [`Session::into_held`], and both paths consume them.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

use super::address::Address;
use super::router::{RouteResult, Router, RoutingDecision};
use super::sniff::{ByteCursor, SniffResult, SnifferChain};

/// Hard cap on bytes held before a routing decision.
pub const HOLD_BUFFER_CAP: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The client sent more than [`HOLD_BUFFER_CAP`] bytes without completing
    /// a recognisable handshake.
    #[error("hold buffer overflow: {held} held + {incoming} incoming exceeds {cap} bytes")]
    HoldOverflow {
        held: usize,
        incoming: usize,
        cap: usize,
    },

    /// Bytes arrived after the held buffer was released.
    #[error("session already released its held bytes")]
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Sniffing; no decision yet.
    Collecting,
    /// A route matched; held bytes go to its backend.
    Routed,
    /// No route applies; held bytes went to the pass-through consumer.
    Passthrough,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Collecting => f.write_str("collecting"),
            SessionState::Routed => f.write_str("routed"),
            SessionState::Passthrough => f.write_str("passthrough"),
        }
    }
}

/// What the driver must do after feeding a chunk.
#[derive(Debug)]
pub enum Verdict {
    /// Keep reading from the client.
    NeedMore,
    /// Dial the resolved backend, then replay [`Session::into_held`].
    Forward(RouteResult),
    /// Stop intercepting and hand these exact bytes to the pass-through path.
    Release(Bytes),
}

/// Outcome of one pass of the sniffer chain.
#[derive(Debug)]
enum ChainOutcome {
    Accepted {
        sniffer: &'static str,
        address: Option<Address>,
    },
    Pending,
    Exhausted,
}

/// Interception state for a single client connection.
pub struct Session {
    router: Arc<Router>,
    candidates: SnifferChain,
    held: BytesMut,
    state: SessionState,
}

impl Session {
    pub fn new(router: Arc<Router>, sniffers: SnifferChain) -> Self {
        Self {
            router,
            candidates: sniffers,
            held: BytesMut::with_capacity(HOLD_BUFFER_CAP),
            state: SessionState::Collecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of bytes currently held.
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Names of the sniffers still in the running.
    pub fn candidates(&self) -> Vec<&'static str> {
        self.candidates.iter().map(|s| s.name()).collect()
    }

    /// Append a client chunk and try to reach a decision.
    pub async fn feed(&mut self, chunk: &[u8]) -> Result<Verdict, SessionError> {
        if self.state != SessionState::Collecting {
            return Err(SessionError::Released);
        }
        self.hold(chunk)?;

        match run_chain(&mut self.candidates, &self.held) {
            ChainOutcome::Pending => {
                trace!(held = self.held.len(), "Handshake incomplete");
                Ok(Verdict::NeedMore)
            }
            ChainOutcome::Exhausted => {
                debug!(held = self.held.len(), "No sniffer recognised the handshake");
                Ok(self.release())
            }
            ChainOutcome::Accepted {
                sniffer,
                address: None,
            } => {
                debug!(sniffer, "Handshake carries no address");
                Ok(self.release())
            }
            ChainOutcome::Accepted {
                sniffer,
                address: Some(address),
            } => match self.router.route(&address).await {
                RoutingDecision::Matched(result) => {
                    debug!(
                        sniffer,
                        requested = %address,
                        route_id = %result.route.id,
                        "Handshake routed"
                    );
                    self.state = SessionState::Routed;
                    Ok(Verdict::Forward(result))
                }
                RoutingDecision::NoMatch { reason } => {
                    debug!(sniffer, requested = %address, reason = %reason, "No route");
                    Ok(self.release())
                }
            },
        }
    }

    /// Append bytes to the hold buffer without sniffing.
    ///
    /// Used while a backend dial is in flight; the cap still applies.
    pub fn hold(&mut self, chunk: &[u8]) -> Result<(), SessionError> {
        if self.state == SessionState::Passthrough {
            return Err(SessionError::Released);
        }
        if self.held.len() + chunk.len() > HOLD_BUFFER_CAP {
            return Err(SessionError::HoldOverflow {
                held: self.held.len(),
                incoming: chunk.len(),
                cap: HOLD_BUFFER_CAP,
            });
        }
        self.held.extend_from_slice(chunk);
        Ok(())
    }

    /// Take the held bytes for replay to the backend, ending the session.
    pub fn into_held(self) -> Bytes {
        self.held.freeze()
    }

    fn release(&mut self) -> Verdict {
        self.state = SessionState::Passthrough;
        Verdict::Release(self.held.split().freeze())
    }
}

/// Run every remaining candidate over the whole buffer, dropping rejects.
fn run_chain(candidates: &mut SnifferChain, held: &[u8]) -> ChainOutcome {
    let mut cursor = ByteCursor::new(held);
    let mut idx = 0;

    while idx < candidates.len() {
        cursor.reset();
        let sniffer = &candidates[idx];
        let result = sniffer.sniff(&mut cursor);
        cursor.reset();

        match result {
            SniffResult::Accept(address) => {
                return ChainOutcome::Accepted {
                    sniffer: sniffer.name(),
                    address,
                };
            }
            SniffResult::Reject => {
                trace!(sniffer = sniffer.name(), "Sniffer rejected");
                candidates.remove(idx);
            }
            SniffResult::Incomplete => idx += 1,
        }
    }

    if candidates.is_empty() {
        ChainOutcome::Exhausted
    } else {
        ChainOutcome::Pending
    }
}
