use serde::{Deserialize, Serialize};

/// Network role of the world running the streaming update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetMode {
    #[default]
    Standalone,
    Client,
    ListenServer,
    DedicatedServer,
}

/// Facts about the hosting world that steer streaming decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldContext {
    pub net_mode: NetMode,
    /// Before the match starts loads are not budgeted.
    pub match_started: bool,
}

impl WorldContext {
    pub fn standalone() -> Self {
        Self {
            net_mode: NetMode::Standalone,
            match_started: true,
        }
    }

    /// Servers stream from data-layer state rather than source proximity.
    pub fn is_server(&self) -> bool {
        matches!(self.net_mode, NetMode::ListenServer | NetMode::DedicatedServer)
    }

    pub fn is_standalone(&self) -> bool {
        self.net_mode == NetMode::Standalone
    }
}
