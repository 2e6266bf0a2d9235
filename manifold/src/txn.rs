//! The per-message transaction.
//!
//! Every incoming message is processed under one `Transaction`. Outgoing
//! messages are *staged* (with their outbound quota already reserved on the
//! target channel) and registry/matcher mutations pair themselves with an
//! inverse `UndoOp`. On commit the staged sends move onto the target
//! channels in stage order and the undo list is discarded; on cancel the
//! reservations are returned, nothing is sent, and the undo ops are applied
//! newest-first, restoring the observable state to what it was before
//! dispatch began.
//!
//! A transaction is consumed by `commit` or `cancel`, so staging into a
//! terminated transaction is impossible by construction.

use crate::matcher::MatchRule;
use crate::message::Message;
use crate::ConnId;
use std::rc::Rc;

/// One staged outgoing message. `reserved` is the outbound quota claimed on
/// the target channel at stage time; commit debits it, cancel returns it.
pub struct StagedSend {
    pub conn: ConnId,
    pub msg: Rc<Message>,
    pub reserved: usize,
}

/// Inverse of one registry/matcher/bookkeeping mutation. Applied in LIFO
/// order on cancel by the subsystems that performed the original mutation.
#[derive(Debug, Clone)]
pub enum UndoOp {
    /// Undo an owner-queue append: drop `conn` from `name`'s queue,
    /// removing the entry if the queue empties.
    RemoveOwner { name: String, conn: ConnId },
    /// Undo an owner-queue removal: reinsert `conn` at `index`, recreating
    /// the entry (with the recorded replacement flag) if it was unlinked.
    InsertOwnerAt {
        name: String,
        conn: ConnId,
        index: usize,
        prohibit_replacement: bool,
    },
    /// Undo a change of an entry's replacement flag.
    SetProhibitReplacement { name: String, value: bool },
    /// Undo the connection-side record of a name acquisition.
    ForgetOwnedName { conn: ConnId, name: String },
    /// Undo the connection-side record of a name release.
    RememberOwnedName { conn: ConnId, name: String },
    /// Undo a match-rule insertion.
    RemoveRule { rule_id: u64 },
    /// Undo a match-rule removal by restoring the removed rule at its old
    /// position with its old id.
    RestoreRule {
        rule_id: u64,
        index: usize,
        rule: Box<MatchRule>,
    },
}

pub struct Transaction {
    sends: Vec<StagedSend>,
    undo: Vec<UndoOp>,
    created_services: Vec<String>,
}

impl Transaction {
    #[inline]
    pub fn new() -> Transaction {
        Transaction {
            sends: Vec::new(),
            undo: Vec::new(),
            created_services: Vec::new(),
        }
    }

    /// Stage a send whose quota has already been reserved on `conn`.
    #[inline]
    pub fn stage(&mut self, conn: ConnId, msg: Rc<Message>, reserved: usize) {
        self.sends.push(StagedSend { conn, msg, reserved });
    }

    /// Record the inverse of a mutation performed under this transaction.
    #[inline]
    pub fn add_undo(&mut self, op: UndoOp) {
        self.undo.push(op);
    }

    /// Note that a previously-absent name appeared, so the dispatcher can
    /// run the activation service-created hook after the handler returns.
    #[inline]
    pub fn note_service_created(&mut self, name: &str) {
        self.created_services.push(name.to_string());
    }

    #[inline]
    pub fn take_created_services(&mut self) -> Vec<String> {
        std::mem::replace(&mut self.created_services, Vec::new())
    }

    #[inline]
    pub fn staged_count(&self) -> usize {
        self.sends.len()
    }

    #[inline]
    pub fn has_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    /// Commit: hand back the staged sends in stage order. Undo ops are
    /// discarded without being applied.
    #[inline]
    pub fn commit(self) -> Vec<StagedSend> {
        self.sends
    }

    /// Cancel: hand back the staged sends (so their reservations can be
    /// returned) and the undo ops, newest first.
    pub fn cancel(self) -> (Vec<StagedSend>, Vec<UndoOp>) {
        let mut undo = self.undo;
        undo.reverse();
        (self.sends, undo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::{DRIVER_INTERFACE, DRIVER_NAME};

    fn msg() -> Rc<Message> {
        Rc::new(Message::method_call(DRIVER_NAME, DRIVER_INTERFACE, "Hello"))
    }

    #[test]
    fn test_commit_preserves_stage_order() {
        let mut txn = Transaction::new();
        txn.stage(3, msg(), 10);
        txn.stage(1, msg(), 20);
        txn.stage(3, msg(), 30);
        txn.add_undo(UndoOp::RemoveOwner {
            name: "org.example.A".to_string(),
            conn: 1,
        });

        assert_eq!(txn.staged_count(), 3);
        assert!(txn.has_undo());

        let sends = txn.commit();
        let order: Vec<_> = sends.iter().map(|send| (send.conn, send.reserved)).collect();
        assert_eq!(order, vec![(3, 10), (1, 20), (3, 30)]);
    }

    #[test]
    fn test_cancel_reverses_undo() {
        let mut txn = Transaction::new();
        txn.stage(0, msg(), 16);
        txn.add_undo(UndoOp::RemoveOwner {
            name: "a".to_string(),
            conn: 0,
        });
        txn.add_undo(UndoOp::ForgetOwnedName {
            conn: 0,
            name: "a".to_string(),
        });

        let (sends, undo) = txn.cancel();
        assert_eq!(sends.len(), 1);
        assert_eq!(undo.len(), 2);

        match &undo[0] {
            UndoOp::ForgetOwnedName { conn, name } => {
                assert_eq!(*conn, 0);
                assert_eq!(name, "a");
            }
            other => panic!("Unexpected first undo op {:?}", other),
        }
        match &undo[1] {
            UndoOp::RemoveOwner { .. } => (),
            other => panic!("Unexpected second undo op {:?}", other),
        }
    }

    #[test]
    fn test_created_service_notes_drain() {
        let mut txn = Transaction::new();
        txn.note_service_created("org.example.Spawned");

        assert_eq!(txn.take_created_services(), vec!["org.example.Spawned"]);
        assert!(txn.take_created_services().is_empty());
    }
}
