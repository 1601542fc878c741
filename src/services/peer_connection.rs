//! I/O-free negotiation and channel state machine for one endpoint.
//!
//! The transport that produces session descriptions and opens the data
//! channel lives outside this module. The embedding endpoint feeds transport
//! events in and executes the [`PeerAction`]s that come back.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    dto::{channel::ChannelMessage, signal::SignalPayload},
    state::sessions::ConnectionId,
};

/// Connectivity of the network path to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPathState {
    /// Nothing negotiated yet.
    New,
    /// Negotiation started; the transport is probing paths.
    Connecting,
    /// A path is usable. The channel may still be opening.
    Connected,
    /// The transport gave up on every path.
    Failed,
    /// Closed by either side.
    Closed,
}

/// Offer/answer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No description exchanged.
    Idle,
    /// Local offer relayed, waiting for the answer.
    OfferSent,
    /// Remote offer applied, waiting for the local answer.
    OfferReceived,
    /// Local answer relayed.
    AnswerSent,
    /// Remote answer applied.
    AnswerReceived,
}

/// Data channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not usable yet; outgoing messages are queued.
    Connecting,
    /// Messages are transmitted immediately.
    Open,
    /// Terminal.
    Closed,
}

/// Which side of the offer/answer exchange this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Sends the offer.
    Offerer,
    /// Answers the remote offer.
    Answerer,
}

/// Work for the embedding endpoint, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerAction {
    /// Send a negotiation payload to `to` through the signaling relay.
    Relay {
        /// Recipient connection id.
        to: ConnectionId,
        /// Payload to wrap in `signal:relay`.
        payload: SignalPayload,
    },
    /// Hand the remote offer or answer to the transport.
    ApplyRemoteDescription {
        /// Remote peer.
        peer_id: ConnectionId,
        /// The offer or answer.
        payload: SignalPayload,
    },
    /// Hand a remote candidate to the transport.
    AddRemoteCandidate {
        /// Remote peer.
        peer_id: ConnectionId,
        /// The candidate.
        payload: SignalPayload,
    },
    /// Write a message on the open channel.
    Transmit {
        /// Remote peer.
        to: ConnectionId,
        /// Message to serialize onto the channel.
        message: ChannelMessage,
    },
    /// Close the transport channel.
    CloseChannel {
        /// Remote peer.
        peer_id: ConnectionId,
    },
    /// The peer is gone for good. Emitted once per connection.
    Departed {
        /// Remote peer.
        peer_id: ConnectionId,
    },
}

/// Per-connection failures. None of them affect other peers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PeerError {
    /// Message sent after the channel closed.
    #[error("channel to `{0}` is not open")]
    ChannelNotOpen(ConnectionId),
    /// The path failed before the channel could be used.
    #[error("negotiation with `{peer_id}` failed: {reason}")]
    NegotiationFailed {
        /// Remote peer.
        peer_id: ConnectionId,
        /// Transport states at the time of failure.
        reason: String,
    },
    /// Negotiation message that does not fit the current state.
    #[error("unexpected {kind} from `{peer_id}` while {state:?}")]
    UnexpectedSignal {
        /// Remote peer.
        peer_id: ConnectionId,
        /// Payload kind (`offer`, `answer`).
        kind: &'static str,
        /// Negotiation state when it arrived.
        state: NegotiationState,
    },
    /// Relayed data that is not a negotiation payload.
    #[error("invalid negotiation payload from `{peer_id}`: {reason}")]
    InvalidPayload {
        /// Sender.
        peer_id: ConnectionId,
        /// Parse or validation failure.
        reason: String,
    },
    /// No state machine for this peer.
    #[error("unknown peer `{0}`")]
    UnknownPeer(ConnectionId),
}

/// State machine for the connection to a single remote peer.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    peer_id: ConnectionId,
    role: PeerRole,
    path: NetworkPathState,
    negotiation: NegotiationState,
    channel: ChannelState,
    announcement: Option<ChannelMessage>,
    outbox: VecDeque<ChannelMessage>,
    remote_description_set: bool,
    pending_candidates: Vec<SignalPayload>,
    yields_to_remote_offers: bool,
    departed: bool,
}

impl PeerConnection {
    /// New connection. `announcement` is transmitted first when the channel opens.
    pub fn new(
        peer_id: impl Into<ConnectionId>,
        role: PeerRole,
        announcement: Option<ChannelMessage>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            role,
            path: NetworkPathState::New,
            negotiation: NegotiationState::Idle,
            channel: ChannelState::Connecting,
            announcement,
            outbox: VecDeque::new(),
            remote_description_set: false,
            pending_candidates: Vec::new(),
            yields_to_remote_offers: false,
            departed: false,
        }
    }

    /// When our offer crosses one from the peer, drop ours and answer theirs.
    ///
    /// Exactly one side of a pair should yield; the other keeps its offer and
    /// ignores the crossing one.
    pub fn yielding(mut self) -> Self {
        self.yields_to_remote_offers = true;
        self
    }

    /// Remote connection id.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current side of the exchange.
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Network path sub-state.
    pub fn path_state(&self) -> NetworkPathState {
        self.path
    }

    /// Negotiation sub-state.
    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation
    }

    /// Channel sub-state.
    pub fn channel_state(&self) -> ChannelState {
        self.channel
    }

    /// Whether the departure was already reported.
    pub fn has_departed(&self) -> bool {
        self.departed
    }

    /// Messages waiting for the channel to open.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// The transport produced our offer.
    pub fn local_offer(&mut self, sdp: String) -> Result<Vec<PeerAction>, PeerError> {
        if self.role != PeerRole::Offerer || self.negotiation != NegotiationState::Idle {
            return Err(self.unexpected("offer"));
        }
        self.negotiation = NegotiationState::OfferSent;
        self.path = NetworkPathState::Connecting;
        debug!(peer = %self.peer_id, "offer sent");
        Ok(vec![PeerAction::Relay {
            to: self.peer_id.clone(),
            payload: SignalPayload::Offer { sdp },
        }])
    }

    /// The transport produced our answer to the remote offer.
    pub fn local_answer(&mut self, sdp: String) -> Result<Vec<PeerAction>, PeerError> {
        if self.negotiation != NegotiationState::OfferReceived {
            return Err(self.unexpected("answer"));
        }
        self.negotiation = NegotiationState::AnswerSent;
        debug!(peer = %self.peer_id, "answer sent");
        Ok(vec![PeerAction::Relay {
            to: self.peer_id.clone(),
            payload: SignalPayload::Answer { sdp },
        }])
    }

    /// The transport gathered a local candidate.
    pub fn local_candidate(&mut self, candidate: SignalPayload) -> Vec<PeerAction> {
        if self.departed {
            return Vec::new();
        }
        vec![PeerAction::Relay {
            to: self.peer_id.clone(),
            payload: candidate,
        }]
    }

    /// Negotiation payload relayed from the peer.
    pub fn handle_signal(&mut self, payload: SignalPayload) -> Result<Vec<PeerAction>, PeerError> {
        if self.departed {
            debug!(peer = %self.peer_id, kind = payload.kind(), "signal after departure ignored");
            return Ok(Vec::new());
        }

        match payload {
            SignalPayload::Offer { .. } => {
                match (self.role, self.negotiation) {
                    (PeerRole::Answerer, NegotiationState::Idle) => {}
                    (PeerRole::Offerer, NegotiationState::OfferSent)
                        if self.yields_to_remote_offers =>
                    {
                        debug!(peer = %self.peer_id, "offers crossed; answering the remote one");
                        self.role = PeerRole::Answerer;
                    }
                    (PeerRole::Offerer, NegotiationState::OfferSent) => {
                        debug!(peer = %self.peer_id, "offers crossed; keeping ours");
                        return Ok(Vec::new());
                    }
                    _ => return Err(self.unexpected("offer")),
                }
                self.negotiation = NegotiationState::OfferReceived;
                self.path = NetworkPathState::Connecting;
                Ok(self.remote_description(payload))
            }
            SignalPayload::Answer { .. } => {
                if self.negotiation != NegotiationState::OfferSent {
                    return Err(self.unexpected("answer"));
                }
                self.negotiation = NegotiationState::AnswerReceived;
                Ok(self.remote_description(payload))
            }
            SignalPayload::Candidate { .. } => {
                if self.remote_description_set {
                    Ok(vec![PeerAction::AddRemoteCandidate {
                        peer_id: self.peer_id.clone(),
                        payload,
                    }])
                } else {
                    self.pending_candidates.push(payload);
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Path state reported by the transport.
    pub fn on_path_state(&mut self, state: NetworkPathState) -> Vec<PeerAction> {
        if self.departed {
            return Vec::new();
        }
        self.path = state;
        match state {
            NetworkPathState::Failed => {
                let err = PeerError::NegotiationFailed {
                    peer_id: self.peer_id.clone(),
                    reason: format!(
                        "network path failed (negotiation {:?}, channel {:?})",
                        self.negotiation, self.channel
                    ),
                };
                warn!(error = %err, "peer connection failed");
                self.teardown()
            }
            NetworkPathState::Closed => self.teardown(),
            NetworkPathState::Connected => {
                info!(peer = %self.peer_id, "network path connected");
                Vec::new()
            }
            NetworkPathState::New | NetworkPathState::Connecting => Vec::new(),
        }
    }

    /// Channel state reported by the transport.
    pub fn on_channel_state(&mut self, state: ChannelState) -> Vec<PeerAction> {
        if self.departed {
            return Vec::new();
        }
        match (self.channel, state) {
            (ChannelState::Connecting, ChannelState::Open) => {
                self.channel = ChannelState::Open;
                info!(peer = %self.peer_id, queued = self.outbox.len(), "channel open");
                let mut actions = Vec::with_capacity(self.outbox.len() + 1);
                if let Some(announcement) = self.announcement.take() {
                    actions.push(self.transmit(announcement));
                }
                while let Some(message) = self.outbox.pop_front() {
                    actions.push(self.transmit(message));
                }
                actions
            }
            (_, ChannelState::Closed) => {
                self.channel = ChannelState::Closed;
                self.teardown()
            }
            (current, next) => {
                debug!(peer = %self.peer_id, ?current, ?next, "ignoring channel transition");
                Vec::new()
            }
        }
    }

    /// Queue `message` until open, transmit it when open, refuse it once closed.
    pub fn send(&mut self, message: ChannelMessage) -> Result<Vec<PeerAction>, PeerError> {
        match self.channel {
            ChannelState::Connecting => {
                self.outbox.push_back(message);
                Ok(Vec::new())
            }
            ChannelState::Open => Ok(vec![self.transmit(message)]),
            ChannelState::Closed => {
                let err = PeerError::ChannelNotOpen(self.peer_id.clone());
                warn!(error = %err, kind = message.kind(), "dropping channel message");
                Err(err)
            }
        }
    }

    fn transmit(&self, message: ChannelMessage) -> PeerAction {
        PeerAction::Transmit {
            to: self.peer_id.clone(),
            message,
        }
    }

    fn remote_description(&mut self, payload: SignalPayload) -> Vec<PeerAction> {
        self.remote_description_set = true;
        let mut actions = vec![PeerAction::ApplyRemoteDescription {
            peer_id: self.peer_id.clone(),
            payload,
        }];
        actions.extend(
            self.pending_candidates
                .drain(..)
                .map(|payload| PeerAction::AddRemoteCandidate {
                    peer_id: self.peer_id.clone(),
                    payload,
                }),
        );
        actions
    }

    fn teardown(&mut self) -> Vec<PeerAction> {
        if self.departed {
            return Vec::new();
        }
        self.departed = true;
        if self.path != NetworkPathState::Failed {
            self.path = NetworkPathState::Closed;
        }
        self.outbox.clear();
        self.pending_candidates.clear();
        self.announcement = None;

        let mut actions = Vec::with_capacity(2);
        if self.channel != ChannelState::Closed {
            self.channel = ChannelState::Closed;
            actions.push(PeerAction::CloseChannel {
                peer_id: self.peer_id.clone(),
            });
        }
        info!(peer = %self.peer_id, "peer departed");
        actions.push(PeerAction::Departed {
            peer_id: self.peer_id.clone(),
        });
        actions
    }

    fn unexpected(&self, kind: &'static str) -> PeerError {
        PeerError::UnexpectedSignal {
            peer_id: self.peer_id.clone(),
            kind,
            state: self.negotiation,
        }
    }
}

/// One [`PeerConnection`] per remote peer of a local endpoint.
#[derive(Debug, Clone)]
pub struct PeerConnectionManager {
    local_id: ConnectionId,
    announcement: Option<ChannelMessage>,
    yielding: bool,
    peers: HashMap<ConnectionId, PeerConnection>,
}

impl PeerConnectionManager {
    /// `announcement` is sent first on every channel this endpoint opens.
    pub fn new(local_id: impl Into<ConnectionId>, announcement: Option<ChannelMessage>) -> Self {
        Self {
            local_id: local_id.into(),
            announcement,
            yielding: false,
            peers: HashMap::new(),
        }
    }

    /// Every connection of this manager yields on crossed offers. See [`PeerConnection::yielding`].
    pub fn yielding(mut self) -> Self {
        self.yielding = true;
        self
    }

    /// Connection id of this endpoint.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Re-key this endpoint after its signaling connection changed.
    pub fn set_local_id(&mut self, local_id: impl Into<ConnectionId>) {
        self.local_id = local_id.into();
    }

    /// State machine for `peer_id`, if any.
    pub fn peer(&self, peer_id: &str) -> Option<&PeerConnection> {
        self.peers.get(peer_id)
    }

    /// Ids of every tracked peer.
    pub fn peer_ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.peers.keys()
    }

    /// Number of tracked peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is tracked.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Start negotiating with `peer_id` as the offerer.
    pub fn connect(&mut self, peer_id: &str, sdp: String) -> Result<Vec<PeerAction>, PeerError> {
        if !self.peers.contains_key(peer_id) {
            let peer = self.new_peer(peer_id, PeerRole::Offerer);
            self.peers.insert(peer_id.to_string(), peer);
        }
        self.with_peer(peer_id, |peer| peer.local_offer(sdp))
    }

    /// Relayed `data` from `from`. An offer from an unknown peer creates an answering connection.
    pub fn handle_relayed(
        &mut self,
        from: &str,
        data: serde_json::Value,
    ) -> Result<Vec<PeerAction>, PeerError> {
        let payload =
            SignalPayload::from_value(data).map_err(|err| PeerError::InvalidPayload {
                peer_id: from.to_string(),
                reason: err.to_string(),
            })?;
        self.handle_signal(from, payload)
    }

    /// Parsed negotiation payload from `from`.
    pub fn handle_signal(
        &mut self,
        from: &str,
        payload: SignalPayload,
    ) -> Result<Vec<PeerAction>, PeerError> {
        if !self.peers.contains_key(from) {
            if !matches!(payload, SignalPayload::Offer { .. }) {
                return Err(PeerError::UnknownPeer(from.to_string()));
            }
            let peer = self.new_peer(from, PeerRole::Answerer);
            self.peers.insert(from.to_string(), peer);
        }
        self.with_peer(from, |peer| peer.handle_signal(payload))
    }

    /// The transport produced the answer for `peer_id`.
    pub fn local_answer(&mut self, peer_id: &str, sdp: String) -> Result<Vec<PeerAction>, PeerError> {
        self.with_peer(peer_id, |peer| peer.local_answer(sdp))
    }

    /// The transport gathered a candidate for `peer_id`.
    pub fn local_candidate(
        &mut self,
        peer_id: &str,
        candidate: SignalPayload,
    ) -> Result<Vec<PeerAction>, PeerError> {
        self.with_peer(peer_id, |peer| Ok(peer.local_candidate(candidate)))
    }

    /// Path state of `peer_id` reported by the transport.
    pub fn on_path_state(
        &mut self,
        peer_id: &str,
        state: NetworkPathState,
    ) -> Result<Vec<PeerAction>, PeerError> {
        self.with_peer(peer_id, |peer| Ok(peer.on_path_state(state)))
    }

    /// Channel state of `peer_id` reported by the transport.
    pub fn on_channel_state(
        &mut self,
        peer_id: &str,
        state: ChannelState,
    ) -> Result<Vec<PeerAction>, PeerError> {
        self.with_peer(peer_id, |peer| Ok(peer.on_channel_state(state)))
    }

    /// Send to one peer.
    pub fn send(
        &mut self,
        peer_id: &str,
        message: ChannelMessage,
    ) -> Result<Vec<PeerAction>, PeerError> {
        self.with_peer(peer_id, |peer| peer.send(message))
    }

    /// Send to every peer; peers whose channel is closed are skipped.
    pub fn broadcast(&mut self, message: &ChannelMessage) -> Vec<PeerAction> {
        self.peers
            .values_mut()
            .filter_map(|peer| peer.send(message.clone()).ok())
            .flatten()
            .collect()
    }

    /// Drop every connection, reporting each departure.
    pub fn close_all(&mut self) -> Vec<PeerAction> {
        let actions = self
            .peers
            .values_mut()
            .flat_map(|peer| peer.on_path_state(NetworkPathState::Closed))
            .collect();
        self.peers.clear();
        actions
    }

    fn new_peer(&self, peer_id: &str, role: PeerRole) -> PeerConnection {
        let peer = PeerConnection::new(peer_id, role, self.announcement.clone());
        if self.yielding {
            peer.yielding()
        } else {
            peer
        }
    }

    fn with_peer<F>(&mut self, peer_id: &str, f: F) -> Result<Vec<PeerAction>, PeerError>
    where
        F: FnOnce(&mut PeerConnection) -> Result<Vec<PeerAction>, PeerError>,
    {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.to_string()))?;
        let actions = f(peer)?;
        if peer.has_departed() {
            self.peers.remove(peer_id);
        }
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn joined(name: &str) -> ChannelMessage {
        ChannelMessage::ParticipantJoined { name: name.into() }
    }

    fn candidate(line: &str) -> SignalPayload {
        SignalPayload::Candidate {
            candidate: line.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    fn transmitted(actions: &[PeerAction]) -> Vec<&ChannelMessage> {
        actions
            .iter()
            .filter_map(|action| match action {
                PeerAction::Transmit { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn nothing_is_transmitted_before_open_and_queue_flushes_in_order() {
        let mut peer = PeerConnection::new("host", PeerRole::Offerer, Some(joined("Ada")));
        peer.local_offer("v=0".into()).unwrap();

        let first = ChannelMessage::ClockSyncRequest { client_time: 1.0 };
        let second = ChannelMessage::ClockSyncRequest { client_time: 2.0 };
        assert!(peer.send(first.clone()).unwrap().is_empty());
        assert!(peer.send(second.clone()).unwrap().is_empty());
        assert!(peer.on_path_state(NetworkPathState::Connected).is_empty());
        assert_eq!(peer.queued(), 2);

        let actions = peer.on_channel_state(ChannelState::Open);
        assert_eq!(transmitted(&actions), vec![&joined("Ada"), &first, &second]);
        assert_eq!(peer.queued(), 0);

        let third = ChannelMessage::ClockSyncRequest { client_time: 3.0 };
        assert_eq!(transmitted(&peer.send(third.clone()).unwrap()), vec![&third]);

        // Reopening does not announce twice.
        assert!(peer.on_channel_state(ChannelState::Open).is_empty());
    }

    #[test]
    fn offer_answer_exchange() {
        let mut offerer = PeerConnection::new("host", PeerRole::Offerer, None);
        let mut answerer = PeerConnection::new("guest", PeerRole::Answerer, None);

        let PeerAction::Relay { payload: offer, .. } =
            offerer.local_offer("offer-sdp".into()).unwrap().remove(0)
        else {
            panic!("expected relay");
        };
        let applied = answerer.handle_signal(offer).unwrap();
        assert!(matches!(applied[0], PeerAction::ApplyRemoteDescription { .. }));
        assert_eq!(answerer.negotiation_state(), NegotiationState::OfferReceived);

        let PeerAction::Relay { payload: answer, .. } =
            answerer.local_answer("answer-sdp".into()).unwrap().remove(0)
        else {
            panic!("expected relay");
        };
        assert_eq!(answerer.negotiation_state(), NegotiationState::AnswerSent);
        offerer.handle_signal(answer).unwrap();
        assert_eq!(offerer.negotiation_state(), NegotiationState::AnswerReceived);
    }

    #[test]
    fn out_of_order_signals_are_rejected() {
        let mut offerer = PeerConnection::new("host", PeerRole::Offerer, None);
        let err = offerer
            .handle_signal(SignalPayload::Answer { sdp: "x".into() })
            .unwrap_err();
        assert!(matches!(err, PeerError::UnexpectedSignal { kind: "answer", .. }));

        let mut answerer = PeerConnection::new("guest", PeerRole::Answerer, None);
        assert!(answerer.local_answer("x".into()).is_err());
        assert!(answerer.local_offer("x".into()).is_err());
    }

    #[test]
    fn crossed_offers_resolve_to_a_single_exchange() {
        let mut host = PeerConnectionManager::new("host", None).yielding();
        let mut guest = PeerConnectionManager::new("p1", Some(joined("Ada")));
        host.connect("p1", "host-offer".into()).unwrap();
        guest.connect("host", "guest-offer".into()).unwrap();

        // The yielding side answers the remote offer.
        let actions = host
            .handle_signal("p1", SignalPayload::Offer { sdp: "guest-offer".into() })
            .unwrap();
        assert!(matches!(actions[0], PeerAction::ApplyRemoteDescription { .. }));
        let peer = host.peer("p1").unwrap();
        assert_eq!(peer.role(), PeerRole::Answerer);
        assert_eq!(peer.negotiation_state(), NegotiationState::OfferReceived);

        // The other side keeps its own offer and waits for the answer.
        let ignored = guest
            .handle_signal("host", SignalPayload::Offer { sdp: "host-offer".into() })
            .unwrap();
        assert!(ignored.is_empty());
        assert_eq!(
            guest.peer("host").unwrap().negotiation_state(),
            NegotiationState::OfferSent
        );

        let PeerAction::Relay { payload: answer, .. } =
            host.local_answer("p1", "answer-sdp".into()).unwrap().remove(0)
        else {
            panic!("expected relay");
        };
        guest.handle_signal("host", answer).unwrap();
        assert_eq!(
            guest.peer("host").unwrap().negotiation_state(),
            NegotiationState::AnswerReceived
        );
    }

    #[test]
    fn second_offer_after_the_exchange_is_rejected_even_when_yielding() {
        let mut peer = PeerConnection::new("p1", PeerRole::Offerer, None).yielding();
        peer.local_offer("v=0".into()).unwrap();
        peer.handle_signal(SignalPayload::Answer { sdp: "a".into() })
            .unwrap();
        let err = peer
            .handle_signal(SignalPayload::Offer { sdp: "again".into() })
            .unwrap_err();
        assert!(matches!(err, PeerError::UnexpectedSignal { kind: "offer", .. }));
    }

    #[test]
    fn early_candidates_wait_for_the_remote_description() {
        let mut answerer = PeerConnection::new("guest", PeerRole::Answerer, None);
        assert!(answerer.handle_signal(candidate("c1")).unwrap().is_empty());
        assert!(answerer.handle_signal(candidate("c2")).unwrap().is_empty());

        let actions = answerer
            .handle_signal(SignalPayload::Offer { sdp: "v=0".into() })
            .unwrap();
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[0], PeerAction::ApplyRemoteDescription { .. }));
        assert_eq!(
            actions[2],
            PeerAction::AddRemoteCandidate {
                peer_id: "guest".into(),
                payload: candidate("c2")
            }
        );

        let later = answerer.handle_signal(candidate("c3")).unwrap();
        assert!(matches!(later[0], PeerAction::AddRemoteCandidate { .. }));
    }

    #[test]
    fn failure_tears_down_exactly_once() {
        let mut peer = PeerConnection::new("p", PeerRole::Answerer, None);
        peer.handle_signal(SignalPayload::Offer { sdp: "v=0".into() })
            .unwrap();
        peer.on_channel_state(ChannelState::Open);

        let actions = peer.on_path_state(NetworkPathState::Failed);
        assert_eq!(
            actions,
            vec![
                PeerAction::CloseChannel {
                    peer_id: "p".into()
                },
                PeerAction::Departed {
                    peer_id: "p".into()
                },
            ]
        );
        assert_eq!(peer.path_state(), NetworkPathState::Failed);
        assert!(peer.on_path_state(NetworkPathState::Closed).is_empty());
        assert!(peer.on_channel_state(ChannelState::Closed).is_empty());
        assert_eq!(
            peer.send(ChannelMessage::GameStarted),
            Err(PeerError::ChannelNotOpen("p".into()))
        );
    }

    #[test]
    fn channel_close_drops_the_queue_without_a_second_close() {
        let mut peer = PeerConnection::new("p", PeerRole::Offerer, Some(joined("Ada")));
        peer.send(ChannelMessage::GameStarted).unwrap();

        let actions = peer.on_channel_state(ChannelState::Closed);
        assert_eq!(
            actions,
            vec![PeerAction::Departed {
                peer_id: "p".into()
            }]
        );
        assert_eq!(peer.queued(), 0);
    }

    #[test]
    fn manager_creates_answerers_for_offers_and_forgets_departed_peers() {
        let mut host = PeerConnectionManager::new("host", None);

        let err = host
            .handle_relayed("p1", json!({"type": "answer", "sdp": "x"}))
            .unwrap_err();
        assert_eq!(err, PeerError::UnknownPeer("p1".into()));

        let err = host.handle_relayed("p1", json!({"type": "hello"})).unwrap_err();
        assert!(matches!(err, PeerError::InvalidPayload { .. }));

        host.handle_relayed("p1", json!({"type": "offer", "sdp": "v=0"}))
            .unwrap();
        assert_eq!(host.peer("p1").unwrap().role(), PeerRole::Answerer);

        let actions = host.on_path_state("p1", NetworkPathState::Closed).unwrap();
        assert!(actions.contains(&PeerAction::Departed {
            peer_id: "p1".into()
        }));
        assert!(host.is_empty());
    }

    #[test]
    fn broadcast_skips_nothing_while_connecting_and_reaches_open_peers() {
        let mut host = PeerConnectionManager::new("host", None);
        for id in ["a", "b"] {
            host.handle_signal(id, SignalPayload::Offer { sdp: "v=0".into() })
                .unwrap();
        }
        host.on_channel_state("a", ChannelState::Open).unwrap();

        let actions = host.broadcast(&ChannelMessage::GameReset);
        assert_eq!(transmitted(&actions).len(), 1);
        assert_eq!(host.peer("b").unwrap().queued(), 1);

        let flushed = host.on_channel_state("b", ChannelState::Open).unwrap();
        assert_eq!(transmitted(&flushed), vec![&ChannelMessage::GameReset]);
    }
}
