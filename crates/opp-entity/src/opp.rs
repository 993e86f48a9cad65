//! The `OpenPeerPower` handle: the collaborators a running instance
//! provides to every entity cell.

use std::path::Path;
use std::sync::Arc;

use opp_core::units::UnitSystem;
use opp_event_bus::EventBus;
use opp_registries::Registries;
use opp_state_store::StateStore;

use crate::customize::Customize;
use crate::dispatcher::Dispatcher;

/// The shared handle to a running Open Peer Power instance
pub struct OpenPeerPower {
    /// Event bus for pub/sub communication
    pub bus: Arc<EventBus>,
    /// State store for entity states
    pub states: Arc<StateStore>,
    /// Entity and device registries
    pub registries: Arc<Registries>,
    /// Signal dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Per-entity attribute overrides, read-only after construction
    pub customize: Arc<Customize>,
    /// Configured display unit system
    pub units: UnitSystem,
}

impl OpenPeerPower {
    /// Create an instance with default units and no customize overrides
    pub fn new(config_dir: impl AsRef<Path>) -> Arc<Self> {
        Self::with_options(config_dir, UnitSystem::default(), Customize::new())
    }

    /// Create an instance with explicit units and customize table
    pub fn with_options(
        config_dir: impl AsRef<Path>,
        units: UnitSystem,
        customize: Customize,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let states = Arc::new(StateStore::new(bus.clone()));
        let registries = Arc::new(Registries::new(config_dir));

        Arc::new(Self {
            bus,
            states,
            registries,
            dispatcher: Arc::new(Dispatcher::new()),
            customize: Arc::new(customize),
            units,
        })
    }
}
