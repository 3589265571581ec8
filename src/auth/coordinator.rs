//! Single-flight refresh guard and pending-request queue.
//!
//! Every request that comes back "token expired" lands here. The first one
//! arms the guard and is told to start the renewal; everyone arriving while
//! the renewal is in flight is queued behind it. When the renewal settles the
//! queue is turned into one dispatch per request, in arrival order, carrying
//! either the new access token or the renewal error. The renewal task runs
//! the dispatches one after the other, so replays reach the API in the order
//! their requests were queued.
//!
//! The guard state sits behind a plain mutex that is never held across an
//! await point, so the "is a renewal running?" check and the enqueue are one
//! step.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::error::RenewalError;

/// Outcome delivered to a queued request
pub type RenewalOutcome = Result<String, RenewalError>;

/// Work a queued request does once its renewal settled
pub type Dispatch = BoxFuture<'static, ()>;

/// One caller blocked behind an in-flight renewal
///
/// `Ok(token)` is the success path (replay with the new token), `Err` the
/// failure path (propagate the renewal error). Consumed exactly once.
pub struct PendingRequest {
    settle: Box<dyn FnOnce(RenewalOutcome) -> Dispatch + Send>,
}

impl PendingRequest {
    pub fn new(settle: impl FnOnce(RenewalOutcome) -> Dispatch + Send + 'static) -> Self {
        Self {
            settle: Box::new(settle),
        }
    }

    pub fn succeed(self, token: String) -> Dispatch {
        (self.settle)(Ok(token))
    }

    pub fn fail(self, error: RenewalError) -> Dispatch {
        (self.settle)(Err(error))
    }
}

/// What the caller has to do after enqueueing
pub enum Admission {
    /// No renewal was running: the caller must start one
    Started,
    /// Queued behind the renewal already in flight
    Joined,
    /// The token the request was sent with was already replaced; the caller
    /// runs the dispatch carrying the newest token itself
    AlreadyRenewed(Dispatch),
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Started => "started",
            Admission::Joined => "joined",
            Admission::AlreadyRenewed(_) => "already_renewed",
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    queue: VecDeque<PendingRequest>,
    /// Successful renewals so far
    generation: u64,
    /// Access token of the last successful renewal in the current session
    last_token: Option<String>,
}

/// Refresh guard owned by one authenticated transport
#[derive(Default)]
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful renewals so far
    ///
    /// Captured when a request is sent so a late "expired" answer for an
    /// already-renewed token can be told apart from a fresh expiry.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().in_flight
    }

    /// Requests waiting on the current renewal
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Queue `request` behind the current renewal cycle.
    ///
    /// `sent_at_generation` is the value of [`generation`](Self::generation)
    /// when the request was sent. Returns [`Admission::Started`] to exactly
    /// one caller per cycle; that caller must run the renewal and call
    /// [`settle`](Self::settle).
    pub fn enqueue(&self, request: PendingRequest, sent_at_generation: u64) -> Admission {
        let mut state = self.lock();

        if !state.in_flight && sent_at_generation < state.generation {
            if let Some(token) = state.last_token.clone() {
                drop(state);
                tracing::debug!("Expired token was already renewed, replaying with current token");
                return Admission::AlreadyRenewed(request.succeed(token));
            }
        }

        state.queue.push_back(request);

        if state.in_flight {
            tracing::debug!(pending = state.queue.len(), "Joined in-flight token renewal");
            Admission::Joined
        } else {
            state.in_flight = true;
            tracing::debug!("Starting token renewal");
            Admission::Started
        }
    }

    /// Finish the current cycle
    ///
    /// Returns the queued requests' dispatches in arrival order. They must be
    /// run in that order.
    pub fn settle(&self, outcome: RenewalOutcome) -> Vec<Dispatch> {
        let queue = {
            let mut state = self.lock();
            match &outcome {
                Ok(token) => {
                    state.generation += 1;
                    state.last_token = Some(token.clone());
                }
                Err(_) => state.last_token = None,
            }
            state.in_flight = false;
            std::mem::take(&mut state.queue)
        };

        tracing::debug!(
            pending = queue.len(),
            success = outcome.is_ok(),
            "Token renewal settled, draining queue"
        );

        match outcome {
            Ok(token) => queue
                .into_iter()
                .map(|request| request.succeed(token.clone()))
                .collect(),
            Err(error) => queue
                .into_iter()
                .map(|request| request.fail(error.clone()))
                .collect(),
        }
    }

    /// Forget the token renewed for the previous session
    ///
    /// Called whenever the session ends or is replaced. A late "expired"
    /// answer for a request of the old session then goes through a renewal
    /// of its own instead of being replayed with the old session's token.
    /// A renewal in flight keeps its queue.
    pub fn reset(&self) {
        let mut state = self.lock();
        if state.last_token.take().is_some() {
            tracing::debug!("Forgot renewed token of the previous session");
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
