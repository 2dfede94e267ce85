//! Call-signaling engine
//!
//! Per-call state machine keyed by session ID, with ICE-candidate buffering
//! until both offer and answer have been delivered. Terminal states schedule
//! the session for removal after a short delay; the removal is tolerant of a
//! session that is already gone.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::message::{CallSignal, SignalFrame};
use crate::profile::ProfileCache;
use crate::router::OutboundSink;

/// Delay between a terminal transition and session removal
const CLEANUP_DELAY: Duration = Duration::from_secs(5);

/// Call lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Offered,
    Ringing,
    Answered,
    Connected,
    Renegotiating,
    Rejected,
    Ended,
    Busy,
    Timeout,
}

impl CallState {
    /// Terminal states schedule the session for removal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Rejected | CallState::Ended | CallState::Busy | CallState::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Offered => "OFFERED",
            CallState::Ringing => "RINGING",
            CallState::Answered => "ANSWERED",
            CallState::Connected => "CONNECTED",
            CallState::Renegotiating => "RENEGOTIATING",
            CallState::Rejected => "REJECTED",
            CallState::Ended => "ENDED",
            CallState::Busy => "BUSY",
            CallState::Timeout => "TIMEOUT",
        }
    }
}

/// One active call
#[derive(Debug, Clone)]
pub struct CallSession {
    pub session_id: String,
    /// "audio" | "video"
    pub call_type: Option<String>,
    pub initiated_by: String,
    pub participants: HashSet<String>,
    pub state: CallState,
}

impl CallSession {
    fn new(session_id: &str, call_type: Option<String>, from: &str, to: &str) -> Self {
        let mut participants = HashSet::new();
        if !from.is_empty() {
            participants.insert(from.to_string());
        }
        if !to.is_empty() {
            participants.insert(to.to_string());
        }
        Self {
            session_id: session_id.to_string(),
            call_type,
            initiated_by: from.to_string(),
            participants,
            state: CallState::Offered,
        }
    }

    /// Roster sorted for a stable wire representation
    fn roster(&self) -> Vec<String> {
        let mut roster: Vec<String> = self.participants.iter().cloned().collect();
        roster.sort();
        roster
    }
}

/// Candidates held back until both sides of the handshake have been delivered
#[derive(Debug, Default)]
struct IceBuffer {
    offer_delivered: bool,
    answer_delivered: bool,
    pending: Vec<Value>,
}

/// The signaling engine
pub struct CallEngine {
    sessions: Arc<DashMap<String, CallSession>>,
    ice: Arc<DashMap<String, IceBuffer>>,
    sink: Arc<dyn OutboundSink>,
    profiles: Arc<ProfileCache>,
    cleanup_delay: Duration,
}

impl CallEngine {
    pub fn new(sink: Arc<dyn OutboundSink>, profiles: Arc<ProfileCache>) -> Self {
        Self::with_cleanup_delay(sink, profiles, CLEANUP_DELAY)
    }

    pub fn with_cleanup_delay(
        sink: Arc<dyn OutboundSink>,
        profiles: Arc<ProfileCache>,
        cleanup_delay: Duration,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ice: Arc::new(DashMap::new()),
            sink,
            profiles,
            cleanup_delay,
        }
    }

    /// Current state of a call session, if it still exists
    pub fn session(&self, session_id: &str) -> Option<CallSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Process one inbound signal frame
    pub async fn handle(&self, frame: SignalFrame) {
        if frame.signal == CallSignal::IceCandidate {
            self.handle_ice_candidate(frame).await;
            return;
        }

        let from = frame.from.clone().unwrap_or_default();
        let Some(to) = frame.to.clone() else {
            warn!(signal = frame.signal.as_str(), "signal without a target dropped");
            return;
        };
        let Some(session_id) = frame.session_id.clone() else {
            warn!(signal = frame.signal.as_str(), "signal without a session id dropped");
            return;
        };

        info!(
            signal = frame.signal.as_str(),
            from = %from,
            to = %to,
            session_id = %session_id,
            "signal received"
        );

        let mut resp = Map::new();
        resp.insert("signal".into(), Value::String(frame.signal.as_str().into()));
        resp.insert("from".into(), Value::String(from.clone()));
        resp.insert("to".into(), Value::String(to.clone()));
        resp.insert("sessionId".into(), Value::String(session_id.clone()));
        if let Some(payload) = frame.payload.clone() {
            resp.insert("payload".into(), payload);
        }
        if let Some(call_type) = frame.call_type.clone() {
            resp.insert("callType".into(), Value::String(call_type));
        }

        // Signals are forwarded with the caller's identity attached when the
        // profile is reachable; an unreachable profile service never blocks a
        // call.
        if !from.is_empty() {
            if let Some(profile) = self.profiles.get_or_load(&from).await {
                let name = profile.display_name();
                if let Some(mobile) = profile.mobile {
                    resp.insert("senderMobile".into(), Value::String(mobile));
                }
                if !name.is_empty() {
                    resp.insert("senderName".into(), Value::String(name));
                }
            }
        }

        let mut terminal = false;
        {
            // state mutation happens under the session entry; the guard is
            // dropped before any forward
            match frame.signal {
                CallSignal::Offer => {
                    let session =
                        CallSession::new(&session_id, frame.call_type.clone(), &from, &to);
                    self.sessions.insert(session_id.clone(), session);
                    self.ice
                        .entry(session_id.clone())
                        .or_default()
                        .offer_delivered = true;
                    info!(session_id = %session_id, "call session created");
                }
                _ => {
                    let Some(mut session) = self.sessions.get_mut(&session_id) else {
                        warn!(
                            signal = frame.signal.as_str(),
                            session_id = %session_id,
                            "signal for unknown call session dropped"
                        );
                        return;
                    };

                    match frame.signal {
                        CallSignal::Ringing => session.state = CallState::Ringing,
                        CallSignal::Answer => {
                            session.state = CallState::Answered;
                            self.ice
                                .entry(session_id.clone())
                                .or_default()
                                .answer_delivered = true;
                        }
                        CallSignal::Connected => {
                            session.state = CallState::Connected;
                            resp.insert("state".into(), Value::String("CONNECTED".into()));
                            resp.insert(
                                "participants".into(),
                                Value::from(session.roster()),
                            );
                            if let Some(call_type) = session.call_type.clone() {
                                resp.insert("callType".into(), Value::String(call_type));
                            }
                        }
                        CallSignal::Renegotiate => {
                            session.state = CallState::Renegotiating;
                            resp.insert("state".into(), Value::String("RENEGOTIATING".into()));
                            resp.insert(
                                "participants".into(),
                                Value::from(session.roster()),
                            );
                            if let Some(call_type) = session.call_type.clone() {
                                resp.insert("callType".into(), Value::String(call_type));
                            }
                            resp.insert("renegotiate".into(), Value::Bool(true));
                        }
                        CallSignal::Reject => {
                            session.state = CallState::Rejected;
                            resp.insert("state".into(), Value::String("REJECTED".into()));
                            terminal = true;
                        }
                        CallSignal::End => {
                            session.state = CallState::Ended;
                            resp.insert("state".into(), Value::String("ENDED".into()));
                            terminal = true;
                        }
                        CallSignal::Busy => {
                            session.state = CallState::Busy;
                            terminal = true;
                        }
                        CallSignal::Timeout => {
                            session.state = CallState::Timeout;
                            terminal = true;
                        }
                        CallSignal::ParticipantAdd => {
                            let Some(new_participant) = frame.new_participant.clone() else {
                                warn!(session_id = %session_id, "participant add without newParticipant dropped");
                                return;
                            };
                            session.participants.insert(new_participant);
                            resp.insert(
                                "participants".into(),
                                Value::from(session.roster()),
                            );
                        }
                        CallSignal::ParticipantRemove => {
                            let Some(user_id) = frame.user_id.clone() else {
                                warn!(session_id = %session_id, "participant remove without userId dropped");
                                return;
                            };
                            session.participants.remove(&user_id);
                            resp.insert(
                                "participants".into(),
                                Value::from(session.roster()),
                            );
                        }
                        CallSignal::Offer | CallSignal::IceCandidate => unreachable!(),
                    }

                    debug!(
                        session_id = %session_id,
                        state = session.state.as_str(),
                        "call session updated"
                    );
                }
            }
        }

        let payload = Value::Object(resp).to_string();
        self.sink.forward(&from, &to, payload).await;

        // buffered candidates go out after the answer itself
        if frame.signal == CallSignal::Answer {
            self.flush_candidates(&session_id, &from, &to).await;
        }

        if terminal {
            self.schedule_cleanup(&session_id);
        }
    }

    /// Forward the candidate immediately once both handshake halves have been
    /// delivered; buffer it in arrival order otherwise
    async fn handle_ice_candidate(&self, frame: SignalFrame) {
        let from = frame.from.clone().unwrap_or_default();
        let Some(to) = frame.to.clone() else {
            warn!("ICE candidate without a target dropped");
            return;
        };
        let Some(session_id) = frame.session_id.clone() else {
            warn!("ICE candidate without a session id dropped");
            return;
        };

        let mut candidate = Map::new();
        candidate.insert("signal".into(), Value::String("ICE_CANDIDATE".into()));
        candidate.insert("from".into(), Value::String(from.clone()));
        candidate.insert("to".into(), Value::String(to.clone()));
        candidate.insert("sessionId".into(), Value::String(session_id.clone()));
        if let Some(payload) = frame.payload.clone() {
            candidate.insert("payload".into(), payload);
        }
        let candidate = Value::Object(candidate);

        let ready = {
            let mut buffer = self.ice.entry(session_id.clone()).or_default();
            if buffer.offer_delivered && buffer.answer_delivered {
                true
            } else {
                debug!(
                    session_id = %session_id,
                    offer = buffer.offer_delivered,
                    answer = buffer.answer_delivered,
                    "buffering ICE candidate"
                );
                buffer.pending.push(candidate.clone());
                false
            }
        };

        if ready {
            self.sink.forward(&from, &to, candidate.to_string()).await;
        }
    }

    /// Drain buffered candidates in arrival order
    async fn flush_candidates(&self, session_id: &str, from: &str, to: &str) {
        let drained = match self.ice.get_mut(session_id) {
            Some(mut buffer) => std::mem::take(&mut buffer.pending),
            None => return,
        };
        if drained.is_empty() {
            return;
        }
        info!(session_id, count = drained.len(), "flushing buffered ICE candidates");
        for candidate in drained {
            self.sink.forward(from, to, candidate.to_string()).await;
        }
    }

    /// Remove the session after the cleanup delay. The removal fires on its
    /// original schedule; a session already gone is a no-op.
    fn schedule_cleanup(&self, session_id: &str) {
        let sessions = self.sessions.clone();
        let ice = self.ice.clone();
        let session_id = session_id.to_string();
        let delay = self.cleanup_delay;

        info!(session_id = %session_id, delay_ms = delay.as_millis() as u64, "call session scheduled for removal");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sessions.remove(&session_id).is_some() {
                info!(session_id = %session_id, "call session removed");
            }
            ice.remove(&session_id);
        });
    }
}
