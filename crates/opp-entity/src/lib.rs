//! Entity lifecycle and state publication for Open Peer Power
//!
//! An [`Entity`] describes what a device reports; an [`EntityCell`] owns its
//! lifecycle (attachment to the running instance, state writes, removal);
//! an [`EntityPlatform`] batches cells for one (domain, platform) pair and
//! drives polling. The [`OpenPeerPower`] handle bundles the collaborators
//! every cell needs: state store, event bus, registries, dispatcher, and
//! the customize table.

pub mod cell;
pub mod customize;
pub mod dispatcher;
pub mod entity;
pub mod opp;
pub mod platform;

pub use cell::{EntityCell, LifecycleStage, SLOW_UPDATE_WARNING};
pub use customize::Customize;
pub use dispatcher::{signal_handler, Dispatcher, SignalGuard, SignalHandler};
pub use entity::{Entity, UpdatePolicy};
pub use opp::OpenPeerPower;
pub use platform::{EntityPlatform, SCAN_INTERVAL};
