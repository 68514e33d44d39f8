// Peer-to-peer negotiation engine.
//
// Each endpoint of a media pair runs one `PeerNegotiator`: the host side
// instantiates one per viewer (see `PeerTable`), the viewer side exactly one.
// The two instances never share memory — they talk only through relayed
// `media-offer` / `media-answer` / `ice-candidate` envelopes — and resolve
// simultaneous offers deterministically through their fixed polite/impolite
// roles.
//
// The platform peer link (the browser/OS WebRTC capability that actually
// moves media) sits behind the `MediaLink` trait; the engine mutates only
// its own per-pair state and holds no locks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::protocol::CandidatePayload;

// ─── Link abstraction ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("media link error: {0}")]
pub struct LinkError(pub String);

/// Identifier for one outbound track on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(pub u64);

/// Handle to a local media input produced by the external capture
/// capability (a microphone stream, a screen-share stream, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Description {
    pub kind: SdpKind,
    pub sdp: String,
}

/// The platform peer connection, as seen by the negotiation engine.
///
/// Implementations wrap whatever actually carries the media; the engine
/// only cares about description/candidate plumbing, the outbound track set,
/// and whether the signaling exchange is currently settled.
pub trait MediaLink {
    /// `true` while no description exchange is pending.
    fn signaling_stable(&self) -> bool;
    fn create_offer(&mut self) -> Result<String, LinkError>;
    fn create_answer(&mut self) -> Result<String, LinkError>;
    fn set_local_description(&mut self, description: &Description) -> Result<(), LinkError>;
    fn set_remote_description(&mut self, description: &Description) -> Result<(), LinkError>;
    fn add_remote_candidate(&mut self, candidate: &CandidatePayload) -> Result<(), LinkError>;
    fn add_track(&mut self, input: &str, stream: &StreamHandle) -> Result<TrackId, LinkError>;
    fn replace_track(&mut self, track: TrackId, stream: &StreamHandle) -> Result<(), LinkError>;
    fn remove_track(&mut self, track: TrackId) -> Result<(), LinkError>;
    fn restart_ice(&mut self) -> Result<(), LinkError>;
    fn close(&mut self);
}

// ─── Roles and states ───────────────────────────────────────────────────────

/// Collision role, fixed for the lifetime of a pair.
///
/// Both sides derive it the same way — the initiating (host) side is
/// impolite, the viewer side polite — so the assignment is symmetric
/// knowledge without any handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Yields on an offer collision.
    Polite,
    /// Ignores the colliding offer and lets its own proceed.
    Impolite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

/// Signal received from the peer, unwrapped from its envelope.
#[derive(Debug, Clone)]
pub enum Signal {
    Offer(String),
    Answer(String),
    Candidate(CandidatePayload),
}

/// Signal to relay to the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Offer(String),
    Answer(String),
}

// ─── Per-pair negotiator ────────────────────────────────────────────────────

/// One directed end of a media pair.
pub struct PeerNegotiator<L: MediaLink> {
    peer_id: String,
    role: Role,
    link: L,
    state: LinkState,
    making_offer: bool,
    ignore_offer: bool,
    remote_description_set: bool,
    pending_candidates: Vec<CandidatePayload>,
    tracks: HashMap<String, (TrackId, StreamHandle)>,
    last_failure: Option<Instant>,
    failure_window: Duration,
}

impl<L: MediaLink> PeerNegotiator<L> {
    pub fn new(peer_id: &str, role: Role, link: L, failure_window: Duration) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            role,
            link,
            state: LinkState::Idle,
            making_offer: false,
            ignore_offer: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            tracks: HashMap::new(),
            last_failure: None,
            failure_window,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The only failure surface this engine has: there is no caller to
    /// throw to, so outcomes are read off this state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Reconcile the outbound track set with the currently available named
    /// inputs: new inputs are added, vanished ones removed, and an input
    /// whose underlying stream merely swapped is replaced in place so a
    /// device switch does not trigger a renegotiation round.
    pub fn sync_inputs(
        &mut self,
        inputs: &[(String, StreamHandle)],
    ) -> Result<Vec<Outgoing>, LinkError> {
        if self.state == LinkState::Closed {
            return Ok(Vec::new());
        }

        let mut structural_change = false;

        for (name, stream) in inputs {
            match self.tracks.get_mut(name) {
                None => {
                    let track = self.link.add_track(name, stream)?;
                    self.tracks.insert(name.clone(), (track, stream.clone()));
                    structural_change = true;
                }
                Some((track, current)) if current != stream => {
                    self.link.replace_track(*track, stream)?;
                    *current = stream.clone();
                }
                Some(_) => {}
            }
        }

        let vanished: Vec<String> = self
            .tracks
            .keys()
            .filter(|name| !inputs.iter().any(|(n, _)| n == *name))
            .cloned()
            .collect();
        for name in vanished {
            if let Some((track, _)) = self.tracks.remove(&name) {
                self.link.remove_track(track)?;
                structural_change = true;
            }
        }

        if structural_change {
            Ok(self.renegotiate()?.into_iter().collect())
        } else {
            Ok(Vec::new())
        }
    }

    pub fn handle_signal(&mut self, signal: Signal) -> Result<Vec<Outgoing>, LinkError> {
        if self.state == LinkState::Closed {
            return Ok(Vec::new());
        }
        match signal {
            Signal::Offer(sdp) => self.handle_offer(sdp),
            Signal::Answer(sdp) => self.handle_answer(sdp),
            Signal::Candidate(candidate) => self.handle_candidate(candidate),
        }
    }

    fn handle_offer(&mut self, sdp: String) -> Result<Vec<Outgoing>, LinkError> {
        let collision = self.making_offer || !self.link.signaling_stable();
        self.ignore_offer = self.role == Role::Impolite && collision;
        if self.ignore_offer {
            debug!(peer_id = %self.peer_id, "offer collision, ignoring remote offer");
            return Ok(Vec::new());
        }

        // The polite side yields: applying the remote offer as authoritative
        // implicitly rolls back any offer of our own still in flight.
        if collision {
            debug!(peer_id = %self.peer_id, "offer collision, yielding to remote offer");
            self.making_offer = false;
        }

        self.link.set_remote_description(&Description {
            kind: SdpKind::Offer,
            sdp,
        })?;
        self.remote_description_set = true;
        self.flush_pending_candidates()?;

        let answer = self.link.create_answer()?;
        self.link.set_local_description(&Description {
            kind: SdpKind::Answer,
            sdp: answer.clone(),
        })?;
        if self.state == LinkState::Idle {
            self.state = LinkState::Negotiating;
        }
        Ok(vec![Outgoing::Answer(answer)])
    }

    fn handle_answer(&mut self, sdp: String) -> Result<Vec<Outgoing>, LinkError> {
        if !self.making_offer {
            debug!(peer_id = %self.peer_id, "stale answer with no offer in flight, dropping");
            return Ok(Vec::new());
        }

        self.link.set_remote_description(&Description {
            kind: SdpKind::Answer,
            sdp,
        })?;
        self.remote_description_set = true;
        self.making_offer = false;
        self.ignore_offer = false;
        self.flush_pending_candidates()?;
        Ok(Vec::new())
    }

    fn handle_candidate(&mut self, candidate: CandidatePayload) -> Result<Vec<Outgoing>, LinkError> {
        // Candidates trailing an ignored offer stay ignored with it.
        if self.ignore_offer {
            return Ok(Vec::new());
        }
        // Too early: hold until a remote description lands.
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return Ok(Vec::new());
        }
        self.link.add_remote_candidate(&candidate)?;
        Ok(Vec::new())
    }

    fn flush_pending_candidates(&mut self) -> Result<(), LinkError> {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.link.add_remote_candidate(&candidate)?;
        }
        Ok(())
    }

    fn renegotiate(&mut self) -> Result<Option<Outgoing>, LinkError> {
        // One offer in flight at a time; the next settle re-evaluates.
        if self.making_offer {
            return Ok(None);
        }
        let sdp = self.link.create_offer()?;
        self.link.set_local_description(&Description {
            kind: SdpKind::Offer,
            sdp: sdp.clone(),
        })?;
        self.making_offer = true;
        if matches!(self.state, LinkState::Idle | LinkState::Failed) {
            self.state = LinkState::Negotiating;
        }
        Ok(Some(Outgoing::Offer(sdp)))
    }

    /// The transport reported the link is up.
    pub fn handle_link_connected(&mut self) {
        if self.state != LinkState::Closed {
            self.state = LinkState::Connected;
            self.last_failure = None;
        }
    }

    /// The transport reported terminal failure. The first failure gets one
    /// unconditional restart-negotiation attempt; a second failure inside
    /// the window escalates to `Closed` and the pair is done.
    pub fn handle_link_failed(&mut self) -> Result<Vec<Outgoing>, LinkError> {
        if self.state == LinkState::Closed {
            return Ok(Vec::new());
        }

        let now = Instant::now();
        let repeated = self
            .last_failure
            .map(|at| now.duration_since(at) < self.failure_window)
            .unwrap_or(false);
        self.last_failure = Some(now);

        if repeated {
            warn!(peer_id = %self.peer_id, "repeated link failure, closing pair");
            self.close();
            return Ok(Vec::new());
        }

        debug!(peer_id = %self.peer_id, "link failed, attempting restart");
        self.state = LinkState::Failed;
        self.link.restart_ice()?;
        // The restart offer supersedes whatever was in flight.
        self.making_offer = false;
        Ok(self.renegotiate()?.into_iter().collect())
    }

    pub fn close(&mut self) {
        self.state = LinkState::Closed;
        self.pending_candidates.clear();
        self.link.close();
    }
}

// ─── Peer table (host side: one negotiator per viewer) ──────────────────────

/// The set of pairs one endpoint maintains.
///
/// A pair springs into existence the first time a signal references an
/// unknown peer and is discarded when that peer announces departure.
pub struct PeerTable<L: MediaLink> {
    role: Role,
    failure_window: Duration,
    peers: HashMap<String, PeerNegotiator<L>>,
}

impl<L: MediaLink> PeerTable<L> {
    pub fn new(role: Role, failure_window: Duration) -> Self {
        Self {
            role,
            failure_window,
            peers: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerNegotiator<L>> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerNegotiator<L>> {
        self.peers.get_mut(peer_id)
    }

    /// Route a signal to the peer's negotiator, creating the pair on first
    /// contact with `make_link`.
    pub fn handle_signal(
        &mut self,
        peer_id: &str,
        signal: Signal,
        make_link: impl FnOnce() -> L,
    ) -> Result<Vec<Outgoing>, LinkError> {
        let role = self.role;
        let failure_window = self.failure_window;
        let negotiator = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerNegotiator::new(peer_id, role, make_link(), failure_window));
        negotiator.handle_signal(signal)
    }

    /// Re-sync every pair's track set; returns the offers to relay,
    /// labelled with their target peer. A link error on one pair does not
    /// stop the others.
    pub fn sync_inputs(&mut self, inputs: &[(String, StreamHandle)]) -> Vec<(String, Outgoing)> {
        let mut outgoing = Vec::new();
        for (peer_id, negotiator) in &mut self.peers {
            match negotiator.sync_inputs(inputs) {
                Ok(messages) => {
                    outgoing.extend(messages.into_iter().map(|m| (peer_id.clone(), m)));
                }
                Err(e) => warn!(peer_id = %peer_id, error = %e, "track sync failed"),
            }
        }
        outgoing
    }

    /// The peer announced departure (or the transport was closed for it).
    pub fn remove(&mut self, peer_id: &str) {
        if let Some(mut negotiator) = self.peers.remove(peer_id) {
            negotiator.close();
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
