//! Asynchronous master to slave replication
//!
//! The master runs one [`ReplicationLink`] per connected slave. A link copies
//! the whole keyspace when the slave is new or has fallen out of the binlog
//! window, then streams binlog entries in sequence order. The slave applies
//! them through a [`ReplicaConsumer`] that persists its cursor.

pub mod consumer;
pub mod link;
pub mod master;
pub mod protocol;
pub mod registry;
pub mod slave;

pub use consumer::ReplicaConsumer;
pub use link::{LinkState, ReplicationLink, Step};
pub use master::MasterService;
pub use protocol::{Message, MessageKind, ReplicationCodec, SyncMethod};
pub use registry::{ReplicaRegistry, ReplicaStatus, SessionId};
pub use slave::SlaveClient;
