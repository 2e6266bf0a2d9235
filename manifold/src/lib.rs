#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! `manifold` is the routing core of the busbar message-bus daemon: a
//! single-threaded broker that accepts stream connections, hands each one a
//! unique name, and routes typed messages between clients either directly
//! (unicast to the primary owner of a name), by subscription fan-out, or on
//! demand after activating a service provider process.

/// Reserved name of the daemon-internal pseudo-peer implementing the
/// management method surface.
pub const DRIVER_NAME: &str = "org.busbar.Bus";

/// Interface carried by all driver methods and signals.
pub const DRIVER_INTERFACE: &str = "org.busbar.Bus";

/// Sentinel destination addressing every subscriber / active connection.
pub const BROADCAST_NAME: &str = "org.busbar.Broadcast";

/// Interface of daemon-local signals that must never reach a peer.
pub const LOCAL_INTERFACE: &str = "org.busbar.Local";

/// Prefix shared by every error name the daemon puts on the wire.
pub const ERROR_PREFIX: &str = "org.busbar.Bus.Error.";

/// Slot index of a connection in the connection arena. Slots are recycled;
/// unique names are not.
pub type ConnId = usize;

pub mod activation;
pub mod bus;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod driver;
pub mod logging;
pub mod mainloop;
pub mod matcher;
pub mod message;
pub mod net;
pub mod policy;
pub mod registry;
pub mod support;
pub mod txn;
