use std::sync::Arc;
use std::time::Duration;

use negotiation_webrtc::{
    CandidateInit, ConnectionState, Negotiation, NegotiationError, NegotiationEvents,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{AnswerPolicy, FailurePolicy, OfferPolicy};
use crate::protocol::ServerFrame;
use crate::session::{teardown, CloseReason, Outbound, Session, SessionRegistry};
use crate::websocket::AppState;

const GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive one inbound offer through the negotiation capability and send the
/// answer (and, under trickle, each gathered candidate) back through the
/// session's writer.
pub async fn handle_offer(state: &AppState, session: &Arc<Session>, sdp: String) {
    let mut slot = session.negotiation_slot().await;
    if slot.is_some() {
        match state.config.offer_policy {
            OfferPolicy::Reject => {
                warn!(session_id = %session.id, "rejecting offer while negotiation is in progress");
                return;
            }
            OfferPolicy::Replace => {
                info!(session_id = %session.id, "replacing negotiation for renewed offer");
                if let Some(stale) = slot.take() {
                    if let Err(err) = stale.close().await {
                        warn!(session_id = %session.id, error = %err, "stale negotiation close failed");
                    }
                }
            }
        }
    }

    let (handle, events) = match state.negotiator.create(&state.config.ice_servers).await {
        Ok(created) => created,
        Err(err) => {
            drop(slot);
            warn!(session_id = %session.id, error = %err, "negotiation setup failed");
            abandon(state, session, None).await;
            return;
        }
    };
    *slot = Some(handle.clone());
    drop(slot);

    // Teardown may have raced the install; close what it can no longer see.
    if !state.registry.contains(session.id) {
        if let Some(orphan) = session.take_negotiation().await {
            let _ = orphan.close().await;
        }
        return;
    }

    let NegotiationEvents { candidates, states } = events;
    spawn_state_watcher(state.registry.clone(), session.clone(), &handle, states);

    let answer = match exchange_descriptions(&handle, &sdp).await {
        Ok(answer) => answer,
        Err(err) => {
            warn!(session_id = %session.id, error = %err, "offer negotiation failed");
            abandon(state, session, Some(&handle)).await;
            return;
        }
    };

    match state.config.answer_policy {
        AnswerPolicy::Trickle => {
            session.enqueue(Outbound::Frame(ServerFrame::Answer { sdp: answer }));
            // Candidates start flowing only after the answer is queued, so
            // the client never sees one before its answer.
            spawn_candidate_pump(session.clone(), candidates);
        }
        AnswerPolicy::Vanilla => {
            // A peer connection closed by teardown never finishes gathering.
            let gathered = tokio::select! {
                _ = session.shutdown.notified() => {
                    debug!(session_id = %session.id, "session closed while gathering");
                    return;
                }
                gathered = timeout(GATHERING_TIMEOUT, handle.wait_gathering_complete()) => gathered,
            };
            if gathered.is_err() {
                warn!(session_id = %session.id, "candidate gathering timed out");
                abandon(state, session, Some(&handle)).await;
                return;
            }
            match handle.local_description().await {
                Some(sdp) => {
                    session.enqueue(Outbound::Frame(ServerFrame::Answer { sdp }));
                }
                None => {
                    warn!(session_id = %session.id, "local description missing after gathering");
                    abandon(state, session, Some(&handle)).await;
                    return;
                }
            }
        }
    }

    info!(session_id = %session.id, "answer dispatched");
}

/// Forward a remote candidate to the session's negotiation, if one exists.
/// Candidates racing ahead of the offer round-trip are dropped.
pub async fn handle_candidate(session: &Arc<Session>, candidate: CandidateInit) {
    let Some(handle) = session.current_negotiation().await else {
        debug!(session_id = %session.id, "dropping candidate before negotiation started");
        return;
    };
    if let Err(err) = handle.add_remote_candidate(candidate).await {
        warn!(session_id = %session.id, error = %err, "remote candidate rejected");
    }
}

async fn exchange_descriptions(
    handle: &Arc<dyn Negotiation>,
    offer_sdp: &str,
) -> Result<String, NegotiationError> {
    handle.set_remote_offer(offer_sdp).await?;
    let answer = handle.create_answer().await?;
    handle.set_local_answer(&answer).await?;
    Ok(answer)
}

/// A failed negotiation attempt either frees the slot so the client can
/// retry over the same session, or recycles the whole session. Only the
/// failed attempt's own handle is cleared; a replacement that landed in
/// the slot meanwhile stays installed.
async fn abandon(
    state: &AppState,
    session: &Arc<Session>,
    attempt: Option<&Arc<dyn Negotiation>>,
) {
    match state.config.failure_policy {
        FailurePolicy::KeepOpen => {
            let Some(attempt) = attempt else {
                return;
            };
            let mut slot = session.negotiation_slot().await;
            let ours = slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, attempt));
            let handle = if ours { slot.take() } else { None };
            drop(slot);
            if let Some(handle) = handle {
                if let Err(err) = handle.close().await {
                    warn!(session_id = %session.id, error = %err, "abandoned negotiation close failed");
                }
            }
        }
        FailurePolicy::CloseSession => {
            teardown(&state.registry, session, CloseReason::NegotiationFailed).await;
        }
    }
}

/// Recycle the session when its negotiation reaches a terminal state. The
/// check against the installed handle keeps the Closed echo of a close the
/// relay issued itself (abandon, replace, teardown) from taking the
/// session down.
fn spawn_state_watcher(
    registry: SessionRegistry,
    session: Arc<Session>,
    handle: &Arc<dyn Negotiation>,
    mut states: mpsc::UnboundedReceiver<ConnectionState>,
) {
    // Weak: the watcher must not keep the handle and its state sender
    // alive by itself.
    let watched = Arc::downgrade(handle);
    tokio::spawn(async move {
        while let Some(state) = states.recv().await {
            debug!(session_id = %session.id, %state, "negotiation state changed");
            if state.is_terminal() {
                let ours = match (watched.upgrade(), session.current_negotiation().await) {
                    (Some(watched), Some(current)) => Arc::ptr_eq(&watched, &current),
                    _ => false,
                };
                if ours {
                    teardown(&registry, &session, CloseReason::NegotiationFailed).await;
                }
                break;
            }
        }
    });
}

fn spawn_candidate_pump(
    session: Arc<Session>,
    mut candidates: mpsc::UnboundedReceiver<Option<CandidateInit>>,
) {
    tokio::spawn(async move {
        while let Some(item) = candidates.recv().await {
            let Some(candidate) = item else {
                debug!(session_id = %session.id, "candidate gathering complete");
                break;
            };
            if !session.enqueue(Outbound::Frame(ServerFrame::Ice { candidate })) {
                break;
            }
        }
    });
}
