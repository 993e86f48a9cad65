//! Shared test harness: an isolated Open Peer Power instance plus mock
//! entities.

pub mod mock_entity;

use std::sync::Arc;

use opp_core::units::UnitSystem;
use opp_entity::{Customize, OpenPeerPower};
use tempfile::TempDir;

/// An isolated instance backed by a temporary config directory
pub struct TestOpenPeerPower {
    pub opp: Arc<OpenPeerPower>,
    _config_dir: TempDir,
}

impl TestOpenPeerPower {
    pub fn new() -> Self {
        Self::with_options(UnitSystem::default(), Customize::new())
    }

    pub fn with_options(units: UnitSystem, customize: Customize) -> Self {
        let config_dir = TempDir::new().expect("temp config dir");
        let opp = OpenPeerPower::with_options(config_dir.path(), units, customize);
        Self {
            opp,
            _config_dir: config_dir,
        }
    }

    /// Assert that an entity is in a specific state
    pub fn assert_state(&self, entity_id: &str, expected: &str) {
        let state = self.opp.states.get_state(entity_id);
        assert_eq!(
            state.as_deref(),
            Some(expected),
            "Expected entity {} to be in state '{}', but was {:?}",
            entity_id,
            expected,
            state
        );
    }
}

impl Default for TestOpenPeerPower {
    fn default() -> Self {
        Self::new()
    }
}
