//! Connectivity monitor.
//!
//! The platform reports link changes through [`ConnectivityMonitor::report`]
//! (or sets a state directly); the monitor classifies them into three states
//! and notifies listeners synchronously whenever the state changes.

use crate::events::{ListenerId, ListenerSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Fast, reliable link.
    Online,
    /// Slow or metered link.
    Poor,
    /// Unreachable.
    Offline,
}

impl ConnectivityState {
    /// Classify a platform link report.
    ///
    /// Wi-Fi, wired and 4G/5G cellular links count as online; any other
    /// connected link is poor.
    pub fn classify(link: &LinkInfo) -> Self {
        if !link.connected {
            return ConnectivityState::Offline;
        }
        match link.kind {
            LinkKind::Wifi | LinkKind::Ethernet => ConnectivityState::Online,
            LinkKind::Cellular(CellularGeneration::G4 | CellularGeneration::G5) => {
                ConnectivityState::Online
            }
            LinkKind::Cellular(_) | LinkKind::Unknown => ConnectivityState::Poor,
        }
    }

    pub fn is_online(self) -> bool {
        self == ConnectivityState::Online
    }

    /// Whether a sync may run in this state.
    pub fn allows_sync(self, sync_on_poor: bool) -> bool {
        match self {
            ConnectivityState::Online => true,
            ConnectivityState::Poor => sync_on_poor,
            ConnectivityState::Offline => false,
        }
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Online => write!(f, "online"),
            ConnectivityState::Poor => write!(f, "poor"),
            ConnectivityState::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellularGeneration {
    G2,
    G3,
    G4,
    G5,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Wifi,
    Ethernet,
    Cellular(CellularGeneration),
    Unknown,
}

/// What the platform knows about the current link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub connected: bool,
    pub kind: LinkKind,
}

impl LinkInfo {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            kind: LinkKind::Unknown,
        }
    }

    pub fn wifi() -> Self {
        Self {
            connected: true,
            kind: LinkKind::Wifi,
        }
    }

    pub fn cellular(generation: CellularGeneration) -> Self {
        Self {
            connected: true,
            kind: LinkKind::Cellular(generation),
        }
    }
}

/// A state transition, as delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityChange {
    pub previous: ConnectivityState,
    pub current: ConnectivityState,
}

impl ConnectivityChange {
    /// Coming back from `offline` straight to `online`.
    pub fn is_reconnect(&self) -> bool {
        self.previous == ConnectivityState::Offline && self.current == ConnectivityState::Online
    }
}

/// Tracks the current connectivity state.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: RwLock<ConnectivityState>,
    listeners: ListenerSet<ConnectivityChange>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Offline)
    }
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        Self {
            state: RwLock::new(initial),
            listeners: ListenerSet::new(),
        }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.state.read()
    }

    /// Set the state; listeners hear about it only if it changed.
    ///
    /// Returns the previous state.
    pub fn set_state(&self, state: ConnectivityState) -> ConnectivityState {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            info!(%previous, current = %state, "Connectivity changed");
            self.listeners.notify(&ConnectivityChange {
                previous,
                current: state,
            });
        }
        previous
    }

    /// Feed a platform link report.
    pub fn report(&self, link: LinkInfo) -> ConnectivityState {
        self.set_state(ConnectivityState::classify(&link))
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectivityChange) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }
}
