//! Session dispatch: drains the session queue and runs each session's
//! request through the action table.
//!
//! Every queued session gets its own task straight away so its request can
//! be reassembled. A semaphore bounds only handler execution: a permit is
//! taken once the request is complete and held until the session is freed.

use crate::action::ActionTable;
use scamp_core::{Reply, Request, ScampError, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

/// Error code sent back when a request names an action nobody registered.
pub const UNKNOWN_ACTION_CODE: &str = "not_found";

/// What happened to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran.
    Handled { action: String, replied: bool },
    /// No handler was registered; an error reply was attempted.
    UnknownAction(String),
    /// The request never arrived intact.
    ReceiveFailed,
    /// The request did not arrive within the timeout.
    TimedOut,
}

/// Consumes the session queue until every sender is gone.
pub struct Dispatcher {
    actions: Arc<ActionTable>,
    permits: Arc<Semaphore>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(actions: Arc<ActionTable>, max_concurrent_sessions: usize, request_timeout: Duration) -> Self {
        Self {
            actions,
            permits: Arc::new(Semaphore::new(max_concurrent_sessions)),
            request_timeout,
        }
    }

    /// Number of session tasks that may still start without waiting.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawn one task per session received on `sessions`.
    pub async fn route_sessions(self, mut sessions: mpsc::Receiver<Session>) {
        info!(actions = self.actions.len(), "session dispatch started");

        while let Some(mut session) = sessions.recv().await {
            let actions = self.actions.clone();
            let permits = self.permits.clone();
            let timeout = self.request_timeout;
            tokio::spawn(async move {
                let request = match receive(&mut session, timeout).await {
                    Ok(request) => request,
                    Err(_) => return,
                };
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                invoke(&actions, session, request).await;
            });
        }

        debug!("session queue closed, dispatch loop exiting");
    }
}

/// Receive one request, invoke its handler, and release the session.
pub async fn handle_session(
    actions: &ActionTable,
    mut session: Session,
    request_timeout: Duration,
) -> DispatchOutcome {
    match receive(&mut session, request_timeout).await {
        Ok(request) => invoke(actions, session, request).await,
        Err(outcome) => outcome,
    }
}

async fn receive(session: &mut Session, request_timeout: Duration) -> Result<Request, DispatchOutcome> {
    let msg_no = session.msg_no();
    let conn_id = session.connection_id();

    debug!(conn_id, msg_no, "waiting for request");
    match session.recv_request_timeout(request_timeout).await {
        Ok(request) => {
            debug!(conn_id, msg_no, action = %request.action, "request came in");
            Ok(request)
        }
        Err(ScampError::Timeout) => {
            debug!(conn_id, msg_no, timeout = ?request_timeout, "request timed out");
            Err(DispatchOutcome::TimedOut)
        }
        Err(e) => {
            debug!(conn_id, msg_no, error = %e, "session abandoned before request");
            Err(DispatchOutcome::ReceiveFailed)
        }
    }
}

async fn invoke(actions: &ActionTable, mut session: Session, request: Request) -> DispatchOutcome {
    let msg_no = session.msg_no();
    let conn_id = session.connection_id();
    let action_name = request.action.clone();
    let outcome = match actions.get(&action_name) {
        Some(handler) => {
            handler(request, &mut session).await;
            let replied = session.has_replied();
            if !replied {
                warn!(action = %action_name, msg_no, "handler returned without replying");
            }
            DispatchOutcome::Handled {
                action: action_name,
                replied,
            }
        }
        None => {
            warn!(action = %action_name, conn_id, msg_no, "unknown action");
            let reply = Reply::error(UNKNOWN_ACTION_CODE, format!("unknown action `{action_name}`"));
            if let Err(e) = session.send_reply(reply).await {
                debug!(msg_no, error = %e, "could not send unknown-action reply");
            }
            DispatchOutcome::UnknownAction(action_name)
        }
    };

    session.free();
    outcome
}
