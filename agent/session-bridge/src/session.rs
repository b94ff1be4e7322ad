//! Per-connection session state.
//!
//! A `Session` is built from the join acknowledgement and thrown away as a
//! whole when the connection ends. Nothing carries over into the next epoch.

use std::collections::{HashMap, HashSet};

use crate::transport::{PeerInfo, TrackInfo, TrackKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerRole {
    CameraPublisher,
    Controller,
    Other(String),
}

impl PeerRole {
    pub fn parse(role: Option<&str>) -> Self {
        match role {
            Some("camera") | Some("camera_publisher") => PeerRole::CameraPublisher,
            Some("controller") | Some("operator")     => PeerRole::Controller,
            Some(other) => PeerRole::Other(other.to_string()),
            None        => PeerRole::Other(String::new()),
        }
    }

    /// Matches a configured role name against this role.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            PeerRole::CameraPublisher => name == "camera" || name == "camera_publisher",
            PeerRole::Controller      => name == "controller" || name == "operator",
            PeerRole::Other(r)        => r == name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemotePeer {
    pub identity: String,
    pub role:     PeerRole,
    /// Published tracks, keyed by sid.
    pub tracks:   HashMap<String, TrackInfo>,
}

impl RemotePeer {
    fn from_info(info: PeerInfo) -> Self {
        Self {
            role:     PeerRole::parse(info.role.as_deref()),
            tracks:   info.tracks.into_iter().map(|t| (t.sid.clone(), t)).collect(),
            identity: info.identity,
        }
    }
}

/// A remote track valid only for the session epoch it was created in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackHandle {
    pub epoch:    u64,
    pub identity: String,
    pub role:     PeerRole,
    pub sid:      String,
    pub kind:     TrackKind,
    pub name:     String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEvent {
    /// Subscribed and ready for consumption.
    Available(TrackHandle),
    /// Unpublished by its owner, or the owner left.
    Removed(TrackHandle),
    /// The session with this epoch is gone; every handle carrying it is stale.
    Invalidated { epoch: u64 },
}

#[derive(Debug)]
pub struct Session {
    pub epoch:          u64,
    pub local_identity: String,
    peers:              HashMap<String, RemotePeer>,
    subscribed:         HashSet<String>,
}

impl Session {
    pub fn new(epoch: u64, local_identity: String, peers: Vec<PeerInfo>) -> Self {
        let mut session = Self {
            epoch,
            local_identity,
            peers: HashMap::new(),
            subscribed: HashSet::new(),
        };
        for info in peers {
            session.peer_joined(info);
        }
        session
    }

    /// Insert (or replace) a peer. The local participant is never tracked.
    pub fn peer_joined(&mut self, info: PeerInfo) -> bool {
        if info.identity == self.local_identity {
            return false;
        }
        let peer = RemotePeer::from_info(info);
        self.peers.insert(peer.identity.clone(), peer);
        true
    }

    pub fn peer_left(&mut self, identity: &str) -> Option<RemotePeer> {
        let peer = self.peers.remove(identity)?;
        for sid in peer.tracks.keys() {
            self.subscribed.remove(sid);
        }
        Some(peer)
    }

    pub fn track_published(&mut self, identity: &str, track: TrackInfo) -> bool {
        match self.peers.get_mut(identity) {
            Some(peer) => {
                peer.tracks.insert(track.sid.clone(), track);
                true
            }
            None => false,
        }
    }

    pub fn track_unpublished(&mut self, identity: &str, sid: &str) -> Option<TrackHandle> {
        let peer = self.peers.get_mut(identity)?;
        let track = peer.tracks.remove(sid)?;
        self.subscribed.remove(sid);
        let peer = &self.peers[identity];
        Some(self.handle(peer, &track))
    }

    pub fn mark_subscribed(&mut self, sid: &str) -> bool {
        self.subscribed.insert(sid.to_string())
    }

    pub fn is_subscribed(&self, sid: &str) -> bool {
        self.subscribed.contains(sid)
    }

    pub fn peer(&self, identity: &str) -> Option<&RemotePeer> {
        self.peers.get(identity)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn handle(&self, peer: &RemotePeer, track: &TrackInfo) -> TrackHandle {
        TrackHandle {
            epoch:    self.epoch,
            identity: peer.identity.clone(),
            role:     peer.role.clone(),
            sid:      track.sid.clone(),
            kind:     track.kind.clone(),
            name:     track.name.clone(),
        }
    }
}
