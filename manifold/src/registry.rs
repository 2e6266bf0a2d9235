//! The name registry: maps name strings to service entries with ordered
//! owner queues, and issues the per-connection unique names.
//!
//! All mutations run under the active transaction: each one records its
//! exact inverse as an `UndoOp` (after passing the memory checkpoint, so
//! rollback itself cannot fail) and stages its notifications (the
//! owner-changed broadcast, the acquired/lost unicasts and the
//! service-created note consumed by activation) instead of emitting
//! anything directly.

use crate::connection::Connections;
use crate::driver;
use crate::logging;
use crate::policy::Policy;
use crate::support::{BusError, BusResult, ErrorKind, MemGuard};
use crate::txn::{Transaction, UndoOp};
use crate::ConnId;
use indexmap::IndexMap;

/// RequestName flag: the caller refuses to be replaced while primary.
pub const NAME_FLAG_PROHIBIT_REPLACEMENT: u32 = 0x1;
/// RequestName flag: the caller wants to replace the current primary.
pub const NAME_FLAG_REPLACE_EXISTING: u32 = 0x2;

/// Outcome of an acquire, also its wire reply code.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AcquireResult {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

impl AcquireResult {
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// A registered name and its owner queue. The queue head is the primary
/// owner; the rest wait in acquisition order. An entry with an empty queue
/// never exists: the registry unlinks it in the same step.
pub struct ServiceEntry {
    name: String,
    owners: Vec<ConnId>,
    prohibit_replacement: bool,
}

impl ServiceEntry {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn primary_owner(&self) -> ConnId {
        self.owners[0]
    }

    #[inline]
    pub fn owners(&self) -> &[ConnId] {
        &self.owners
    }

    #[inline]
    pub fn prohibits_replacement(&self) -> bool {
        self.prohibit_replacement
    }
}

pub struct Registry {
    services: IndexMap<String, ServiceEntry>,
    major: u32,
    minor: u32,
    log: logging::Logger,
}

impl Registry {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Registry {
        let registry_log = match log.into() {
            Some(log) => log.new(logging::o!("subsystem" => "registry")),
            _ => logging::null(),
        };

        Registry {
            services: IndexMap::new(),
            major: 1,
            minor: 0,
            log: registry_log,
        }
    }

    /// Next unique name in the `:major.minor` sequence. Never reissued for
    /// the lifetime of the process; exhaustion of the whole space is fatal.
    pub fn next_unique_name(&mut self) -> String {
        let name = format!(":{}.{}", self.major, self.minor);

        match self.minor.checked_add(1) {
            Some(minor) => self.minor = minor,
            None => {
                self.minor = 0;
                self.major = self
                    .major
                    .checked_add(1)
                    .expect("Unique name space exhausted");
            }
        }

        name
    }

    #[inline]
    pub fn lookup(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    #[inline]
    pub fn primary_owner(&self, name: &str) -> Option<ConnId> {
        self.services.get(name).map(|entry| entry.primary_owner())
    }

    /// Snapshot of all registered name strings, in registration order.
    pub fn list(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    fn validate_well_known(name: &str) -> BusResult<()> {
        if name.is_empty() {
            return Err(BusError::new(ErrorKind::InvalidArgs, "empty name"));
        }

        if name.starts_with(':') {
            return Err(BusError::new(
                ErrorKind::InvalidArgs,
                format!("name \"{}\" uses the unique-name prefix", name),
            ));
        }

        Ok(())
    }

    /// Returns the existing entry for `name` or creates one with
    /// `requester` as sole owner, staging the owner-changed broadcast, the
    /// acquired unicast and the service-created note into `txn`.
    pub fn ensure(
        &mut self,
        name: &str,
        requester: ConnId,
        conns: &mut Connections,
        policy: &Policy,
        txn: &mut Transaction,
        mem: &mut MemGuard,
    ) -> BusResult<()> {
        if self.services.contains_key(name) {
            return Ok(());
        }

        mem.check()?;

        self.services.insert(
            name.to_string(),
            ServiceEntry {
                name: name.to_string(),
                owners: vec![requester],
                prohibit_replacement: false,
            },
        );
        txn.add_undo(UndoOp::RemoveOwner {
            name: name.to_string(),
            conn: requester,
        });

        conns.record_owned_name(requester, name);
        txn.add_undo(UndoOp::ForgetOwnedName {
            conn: requester,
            name: name.to_string(),
        });

        driver::stage_name_owner_changed(conns, policy, txn, mem, name, None, Some(requester))?;
        driver::stage_name_acquired(conns, txn, mem, requester, name)?;
        txn.note_service_created(name);

        logging::debug!(self.log, "name registered";
                        "name" => name,
                        "owner" => requester);

        Ok(())
    }

    /// Flip the replacement flag of an existing entry, recording the undo.
    pub fn set_prohibit_replacement(
        &mut self,
        name: &str,
        value: bool,
        txn: &mut Transaction,
    ) -> bool {
        match self.services.get_mut(name) {
            Some(entry) if entry.prohibit_replacement != value => {
                txn.add_undo(UndoOp::SetProhibitReplacement {
                    name: name.to_string(),
                    value: entry.prohibit_replacement,
                });
                entry.prohibit_replacement = value;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// RequestName semantics for a well-known name.
    pub fn acquire(
        &mut self,
        name: &str,
        requester: ConnId,
        flags: u32,
        conns: &mut Connections,
        policy: &Policy,
        txn: &mut Transaction,
        mem: &mut MemGuard,
    ) -> BusResult<AcquireResult> {
        Self::validate_well_known(name)?;

        let primary = self.primary_owner(name);

        match primary {
            None => {
                self.ensure(name, requester, conns, policy, txn, mem)?;
                if flags & NAME_FLAG_PROHIBIT_REPLACEMENT != 0 {
                    self.set_prohibit_replacement(name, true, txn);
                }
                Ok(AcquireResult::PrimaryOwner)
            }
            Some(current) if current == requester => Ok(AcquireResult::AlreadyOwner),
            Some(current) => {
                let (already_queued, prohibit) = {
                    let entry = &self.services[name];
                    (entry.owners.contains(&requester), entry.prohibit_replacement)
                };

                if already_queued {
                    return Ok(AcquireResult::InQueue);
                }

                if flags & NAME_FLAG_REPLACE_EXISTING == 0 {
                    return Ok(AcquireResult::Exists);
                }

                if prohibit {
                    // The primary stays; the requester waits its turn.
                    mem.check()?;
                    self.services[name].owners.push(requester);
                    txn.add_undo(UndoOp::RemoveOwner {
                        name: name.to_string(),
                        conn: requester,
                    });
                    conns.record_owned_name(requester, name);
                    txn.add_undo(UndoOp::ForgetOwnedName {
                        conn: requester,
                        name: name.to_string(),
                    });

                    logging::debug!(self.log, "name acquisition queued";
                                    "name" => name,
                                    "requester" => requester,
                                    "primary" => current);

                    return Ok(AcquireResult::InQueue);
                }

                // Replacement: enqueue the requester directly behind the
                // primary, then drop the primary. This ordering is what
                // makes acquired(requester) observable before
                // lost(previous).
                mem.check()?;
                {
                    let entry = self.services.get_mut(name).unwrap();
                    entry.owners.insert(1, requester);
                }
                txn.add_undo(UndoOp::RemoveOwner {
                    name: name.to_string(),
                    conn: requester,
                });
                conns.record_owned_name(requester, name);
                txn.add_undo(UndoOp::ForgetOwnedName {
                    conn: requester,
                    name: name.to_string(),
                });

                {
                    let entry = self.services.get_mut(name).unwrap();
                    entry.owners.remove(0);
                }
                txn.add_undo(UndoOp::InsertOwnerAt {
                    name: name.to_string(),
                    conn: current,
                    index: 0,
                    prohibit_replacement: false,
                });
                conns.forget_owned_name(current, name);
                txn.add_undo(UndoOp::RememberOwnedName {
                    conn: current,
                    name: name.to_string(),
                });

                if flags & NAME_FLAG_PROHIBIT_REPLACEMENT != 0 {
                    self.set_prohibit_replacement(name, true, txn);
                }

                driver::stage_name_acquired(conns, txn, mem, requester, name)?;
                driver::stage_name_lost(conns, txn, mem, current, name)?;
                driver::stage_name_owner_changed(
                    conns,
                    policy,
                    txn,
                    mem,
                    name,
                    Some(current),
                    Some(requester),
                )?;

                logging::info!(self.log, "name replaced";
                               "name" => name,
                               "old" => current,
                               "new" => requester);

                Ok(AcquireResult::PrimaryOwner)
            }
        }
    }

    /// Remove `owner` from `name`'s queue. Promotes the next queued owner
    /// or unlinks the entry, staging the lost/acquired/owner-changed
    /// notifications. Returns false when `owner` did not own `name`.
    pub fn release(
        &mut self,
        name: &str,
        owner: ConnId,
        conns: &mut Connections,
        policy: &Policy,
        txn: &mut Transaction,
        mem: &mut MemGuard,
    ) -> BusResult<bool> {
        let (index, prohibit) = match self.services.get(name) {
            Some(entry) => match entry.owners.iter().position(|&conn| conn == owner) {
                Some(index) => (index, entry.prohibit_replacement),
                None => return Ok(false),
            },
            None => return Ok(false),
        };

        mem.check()?;

        {
            let entry = self.services.get_mut(name).unwrap();
            entry.owners.remove(index);
        }
        txn.add_undo(UndoOp::InsertOwnerAt {
            name: name.to_string(),
            conn: owner,
            index,
            prohibit_replacement: prohibit,
        });
        conns.forget_owned_name(owner, name);
        txn.add_undo(UndoOp::RememberOwnedName {
            conn: owner,
            name: name.to_string(),
        });

        if index != 0 {
            // A queued waiter gave up; nothing observable changes.
            return Ok(true);
        }

        driver::stage_name_lost(conns, txn, mem, owner, name)?;

        let next = self.services[name].owners.first().copied();
        match next {
            Some(new_primary) => {
                driver::stage_name_acquired(conns, txn, mem, new_primary, name)?;
                driver::stage_name_owner_changed(
                    conns,
                    policy,
                    txn,
                    mem,
                    name,
                    Some(owner),
                    Some(new_primary),
                )?;

                logging::debug!(self.log, "name passed to queued owner";
                                "name" => name,
                                "old" => owner,
                                "new" => new_primary);
            }
            None => {
                self.services.shift_remove(name);
                driver::stage_name_owner_changed(conns, policy, txn, mem, name, Some(owner), None)?;

                logging::debug!(self.log, "name released"; "name" => name, "old" => owner);
            }
        }

        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn force_sequence(&mut self, major: u32, minor: u32) {
        self.major = major;
        self.minor = minor;
    }

    /// Apply the registry-owned undo ops. Non-registry ops return false so
    /// the dispatcher can route them to their owner.
    pub fn apply_undo(&mut self, op: &UndoOp) -> bool {
        match op {
            UndoOp::RemoveOwner { name, conn } => {
                if let Some(entry) = self.services.get_mut(name) {
                    entry.owners.retain(|&owner| owner != *conn);
                    if entry.owners.is_empty() {
                        self.services.shift_remove(name);
                    }
                }
                true
            }
            UndoOp::InsertOwnerAt {
                name,
                conn,
                index,
                prohibit_replacement,
            } => {
                let entry = self
                    .services
                    .entry(name.clone())
                    .or_insert_with(|| ServiceEntry {
                        name: name.clone(),
                        owners: Vec::new(),
                        prohibit_replacement: *prohibit_replacement,
                    });
                let at = std::cmp::min(*index, entry.owners.len());
                entry.owners.insert(at, *conn);
                true
            }
            UndoOp::SetProhibitReplacement { name, value } => {
                if let Some(entry) = self.services.get_mut(name) {
                    entry.prohibit_replacement = *value;
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::mainloop::MainLoop;
    use crate::policy::Policy;

    fn rig() -> (Registry, Connections, MainLoop, Policy, MemGuard) {
        (
            Registry::new(None),
            Connections::new(Limits::default(), None),
            MainLoop::new().unwrap(),
            Policy::allow_all(),
            MemGuard::new(),
        )
    }

    fn active_conn(
        registry: &mut Registry,
        conns: &mut Connections,
        main_loop: &mut MainLoop,
    ) -> ConnId {
        let conn = conns.add_streamless(main_loop);
        let unique = registry.next_unique_name();
        conns.mark_active(conn, &unique, main_loop);
        conn
    }

    #[test]
    fn test_unique_name_sequence() {
        let mut registry = Registry::new(None);

        assert_eq!(registry.next_unique_name(), ":1.0");
        assert_eq!(registry.next_unique_name(), ":1.1");
        assert_eq!(registry.next_unique_name(), ":1.2");
    }

    #[test]
    fn test_unique_name_minor_wrap() {
        let mut registry = Registry::new(None);
        registry.force_sequence(1, u32::max_value());

        assert_eq!(registry.next_unique_name(), format!(":1.{}", u32::max_value()));
        assert_eq!(registry.next_unique_name(), ":2.0");
    }

    #[test]
    fn test_acquire_validates_names() {
        let (mut registry, mut conns, mut main_loop, policy, mut mem) = rig();
        let conn = active_conn(&mut registry, &mut conns, &mut main_loop);
        let mut txn = Transaction::new();

        for name in &["", ":1.5"] {
            let err = registry
                .acquire(name, conn, 0, &mut conns, &policy, &mut txn, &mut mem)
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgs);
        }

        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_acquire_creates_entry_and_backlinks() {
        let (mut registry, mut conns, mut main_loop, policy, mut mem) = rig();
        let conn = active_conn(&mut registry, &mut conns, &mut main_loop);
        let mut txn = Transaction::new();

        let result = registry
            .acquire("org.example.A", conn, 0, &mut conns, &policy, &mut txn, &mut mem)
            .unwrap();

        assert_eq!(result, AcquireResult::PrimaryOwner);
        assert_eq!(registry.primary_owner("org.example.A"), Some(conn));
        assert!(conns.owned_names(conn).contains(&"org.example.A".to_string()));
        assert!(txn.has_undo());

        // Owner-changed broadcast to the one active conn, plus the
        // acquired unicast.
        assert_eq!(txn.staged_count(), 2);
    }

    #[test]
    fn test_release_unlinks_empty_entry() {
        let (mut registry, mut conns, mut main_loop, policy, mut mem) = rig();
        let conn = active_conn(&mut registry, &mut conns, &mut main_loop);
        let mut txn = Transaction::new();

        registry
            .acquire("org.example.A", conn, 0, &mut conns, &policy, &mut txn, &mut mem)
            .unwrap();
        let released = registry
            .release("org.example.A", conn, &mut conns, &policy, &mut txn, &mut mem)
            .unwrap();

        assert!(released);
        assert!(registry.lookup("org.example.A").is_none());
        assert!(!conns.owned_names(conn).contains(&"org.example.A".to_string()));
    }

    #[test]
    fn test_release_by_non_owner_is_a_noop() {
        let (mut registry, mut conns, mut main_loop, policy, mut mem) = rig();
        let owner = active_conn(&mut registry, &mut conns, &mut main_loop);
        let stranger = active_conn(&mut registry, &mut conns, &mut main_loop);
        let mut txn = Transaction::new();

        registry
            .acquire("org.example.A", owner, 0, &mut conns, &policy, &mut txn, &mut mem)
            .unwrap();

        let released = registry
            .release("org.example.A", stranger, &mut conns, &policy, &mut txn, &mut mem)
            .unwrap();
        assert!(!released);
        assert_eq!(registry.primary_owner("org.example.A"), Some(owner));
    }

    #[test]
    fn test_apply_undo_remove_owner_unlinks_empty_entry() {
        let (mut registry, mut conns, mut main_loop, policy, mut mem) = rig();
        let conn = active_conn(&mut registry, &mut conns, &mut main_loop);
        let mut txn = Transaction::new();

        registry
            .acquire("org.example.A", conn, 0, &mut conns, &policy, &mut txn, &mut mem)
            .unwrap();

        assert!(registry.apply_undo(&UndoOp::RemoveOwner {
            name: "org.example.A".to_string(),
            conn,
        }));
        assert!(registry.lookup("org.example.A").is_none());
    }

    #[test]
    fn test_apply_undo_insert_owner_recreates_entry() {
        let mut registry = Registry::new(None);

        assert!(registry.apply_undo(&UndoOp::InsertOwnerAt {
            name: "org.example.A".to_string(),
            conn: 7,
            index: 0,
            prohibit_replacement: true,
        }));

        let entry = registry.lookup("org.example.A").unwrap();
        assert_eq!(entry.owners(), &[7]);
        assert!(entry.prohibits_replacement());
    }

    #[test]
    fn test_non_registry_ops_are_refused() {
        let mut registry = Registry::new(None);

        assert!(!registry.apply_undo(&UndoOp::ForgetOwnedName {
            conn: 0,
            name: "x".to_string(),
        }));
        assert!(!registry.apply_undo(&UndoOp::RemoveRule { rule_id: 3 }));
    }
}
