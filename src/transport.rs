//! The networking capability the engine broadcasts through.
//!
//! The engine only ever gossips; it never addresses an individual peer. Inbound delivery is the
//! host's responsibility: the host registers a handler per node and, on delivery, pushes the
//! message into that node's engine through its [`MessageHandle`](crate::engine::MessageHandle).
//! The engine counts its own vote by inserting every outbound message into its own log before
//! gossiping, so a transport must not loop a message back to its sender.

use std::sync::Arc;

use crate::messages::MessageReq;
use crate::types::NodeID;

/// Inbound delivery callback: invoked by the transport with the recipient and the message.
pub type TransportHandler = Arc<dyn Fn(&NodeID, &MessageReq) + Send + Sync>;

/// A broadcast network connecting the validators.
pub trait Transport: Send + Sync {
    /// Deliver `msg` to every registered node other than its sender.
    fn gossip(&self, msg: &MessageReq);

    /// Register the inbound delivery handler for `id`.
    fn register(&self, id: NodeID, handler: TransportHandler);
}
