//! Observation hooks on the engine's progress.
//!
//! Every message the engine consumes flows through [`StateNotifier::read_next_message`], and
//! every round timeout through [`StateNotifier::handle_timeout`]. The default notifier is a plain
//! pass-through; the test harness substitutes notifiers that record both streams to a trace file,
//! or that detect when a replayed engine has drained its queue.

use crate::messages::{MessageReq, MsgType};
use crate::types::{NodeID, View};

/// The engine-side view a notifier reads messages through.
pub trait MessageReader {
    /// Pop the next protocol-relevant message per the log's priority policy, together with the
    /// messages discarded as stale by this read.
    fn read_message_with_discards(&mut self) -> (Option<MessageReq>, Vec<MessageReq>);

    /// Whether any undelivered message remains queued for this engine (in the current sequence
    /// or buffered for a future one).
    fn has_messages(&self) -> bool;
}

pub trait StateNotifier: Send + Sync {
    /// Called when the round timer of node `to` expires while it waits in the state that consumes
    /// `msg_type` messages.
    fn handle_timeout(&self, to: &NodeID, msg_type: MsgType, view: View);

    /// Produce the next message for the engine to process. Implementations normally delegate to
    /// [`MessageReader::read_message_with_discards`]; interposing here is what allows a recorded
    /// trace to be replayed deterministically.
    fn read_next_message(
        &self,
        reader: &mut dyn MessageReader,
    ) -> (Option<MessageReq>, Vec<MessageReq>);
}

/// The pass-through notifier used when nothing is observing the engine.
pub struct DefaultStateNotifier;

impl StateNotifier for DefaultStateNotifier {
    fn handle_timeout(&self, _to: &NodeID, _msg_type: MsgType, _view: View) {}

    fn read_next_message(
        &self,
        reader: &mut dyn MessageReader,
    ) -> (Option<MessageReq>, Vec<MessageReq>) {
        reader.read_message_with_discards()
    }
}
