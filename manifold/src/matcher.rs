//! The subscription matcher: the global match-rule set and the fan-out
//! recipient computation.
//!
//! A rule constrains any subset of {type, interface, member, path, sender,
//! destination}; absent fields are wildcards. Type, interface, member and
//! path compare byte-equal against the message. Sender and destination are
//! *owner-equal*: the rule names a service, and the constraint holds when
//! that service's current primary owner is the connection in question, so a
//! rule on a well-known name keeps matching across owner handovers.

use crate::connection::Connections;
use crate::logging;
use crate::message::{Message, MessageKind};
use crate::registry::Registry;
use crate::support::{BusError, BusResult, ErrorKind, MemGuard};
use crate::txn::{Transaction, UndoOp};
use crate::ConnId;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    owner: ConnId,
    message_type: Option<MessageKind>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    sender: Option<String>,
    destination: Option<String>,
}

impl MatchRule {
    /// Parse the wire grammar: comma-separated `key='value'` pairs. Keys:
    /// `type`, `interface`, `member`, `path`, `sender`, `destination`.
    /// Duplicate or unknown keys and malformed quoting are rejected.
    pub fn parse(owner: ConnId, text: &str) -> BusResult<MatchRule> {
        let mut rule = MatchRule {
            owner,
            message_type: None,
            interface: None,
            member: None,
            path: None,
            sender: None,
            destination: None,
        };

        let bad = |detail: String| BusError::new(ErrorKind::InvalidArgs, detail);

        let mut rest = text.trim();
        while !rest.is_empty() {
            let eq = rest
                .find('=')
                .ok_or_else(|| bad(format!("match rule \"{}\": missing '='", text)))?;
            let key = rest[..eq].trim();
            rest = &rest[eq + 1..];

            if !rest.starts_with('\'') {
                return Err(bad(format!("match rule \"{}\": value must be quoted", text)));
            }
            rest = &rest[1..];

            let close = rest
                .find('\'')
                .ok_or_else(|| bad(format!("match rule \"{}\": unterminated value", text)))?;
            let value = &rest[..close];
            rest = rest[close + 1..].trim_start();

            if !rest.is_empty() {
                if !rest.starts_with(',') {
                    return Err(bad(format!("match rule \"{}\": expected ','", text)));
                }
                rest = rest[1..].trim_start();
                if rest.is_empty() {
                    return Err(bad(format!("match rule \"{}\": trailing ','", text)));
                }
            }

            let slot = match key {
                "type" => {
                    if rule.message_type.is_some() {
                        return Err(bad(format!("match rule \"{}\": duplicate key type", text)));
                    }
                    rule.message_type = Some(MessageKind::from_rule_name(value).ok_or_else(
                        || bad(format!("match rule \"{}\": unknown type \"{}\"", text, value)),
                    )?);
                    continue;
                }
                "interface" => &mut rule.interface,
                "member" => &mut rule.member,
                "path" => &mut rule.path,
                "sender" => &mut rule.sender,
                "destination" => &mut rule.destination,
                _ => return Err(bad(format!("match rule \"{}\": unknown key \"{}\"", text, key))),
            };

            if slot.is_some() {
                return Err(bad(format!("match rule \"{}\": duplicate key {}", text, key)));
            }
            *slot = Some(value.to_string());
        }

        Ok(rule)
    }

    #[inline]
    pub fn owner(&self) -> ConnId {
        self.owner
    }

    /// True when every constrained field of the rule holds for `msg` sent
    /// by `sender`. Owner-equal fields resolve through the registry.
    fn matches(
        &self,
        registry: &Registry,
        msg: &Message,
        sender: Option<ConnId>,
    ) -> bool {
        if let Some(message_type) = self.message_type {
            if message_type != msg.kind {
                return false;
            }
        }

        if let Some(ref interface) = self.interface {
            if msg.interface.as_deref() != Some(interface.as_str()) {
                return false;
            }
        }

        if let Some(ref member) = self.member {
            if msg.member.as_deref() != Some(member.as_str()) {
                return false;
            }
        }

        if let Some(ref path) = self.path {
            if msg.path.as_deref() != Some(path.as_str()) {
                return false;
            }
        }

        if let Some(ref rule_sender) = self.sender {
            match (registry.primary_owner(rule_sender), sender) {
                (Some(owner), Some(sender)) if owner == sender => (),
                _ => return false,
            }
        }

        if let Some(ref rule_destination) = self.destination {
            let rule_owner = registry.primary_owner(rule_destination);
            let msg_owner = msg
                .destination
                .as_ref()
                .and_then(|name| registry.primary_owner(name));
            match (rule_owner, msg_owner) {
                (Some(a), Some(b)) if a == b => (),
                _ => return false,
            }
        }

        true
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter, key: &str, value: &str| -> fmt::Result {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}='{}'", key, value)
        };

        if let Some(message_type) = self.message_type {
            put(f, "type", message_type.rule_name())?;
        }
        if let Some(ref interface) = self.interface {
            put(f, "interface", interface)?;
        }
        if let Some(ref member) = self.member {
            put(f, "member", member)?;
        }
        if let Some(ref path) = self.path {
            put(f, "path", path)?;
        }
        if let Some(ref sender) = self.sender {
            put(f, "sender", sender)?;
        }
        if let Some(ref destination) = self.destination {
            put(f, "destination", destination)?;
        }

        Ok(())
    }
}

pub struct Matcher {
    rules: Vec<(u64, MatchRule)>,
    next_rule_id: u64,

    // recipients_of dedup: a connection slot is in the output iff its
    // stamp equals the current call's stamp value.
    stamp: u64,
    stamps: Vec<u64>,

    log: logging::Logger,
}

impl Matcher {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Matcher {
        let matcher_log = match log.into() {
            Some(log) => log.new(logging::o!("subsystem" => "matcher")),
            _ => logging::null(),
        };

        Matcher {
            rules: Vec::new(),
            next_rule_id: 0,
            stamp: 0,
            stamps: Vec::new(),
            log: matcher_log,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Number of rules owned by `conn`, for the per-connection limit.
    pub fn count_owned(&self, conn: ConnId) -> usize {
        self.rules.iter().filter(|(_, rule)| rule.owner == conn).count()
    }

    /// Append a rule, recording its removal as the undo.
    pub fn add_rule(
        &mut self,
        rule: MatchRule,
        txn: &mut Transaction,
        mem: &mut MemGuard,
    ) -> BusResult<()> {
        mem.check()?;

        let rule_id = self.next_rule_id;
        self.next_rule_id += 1;

        logging::debug!(self.log, "rule added";
                        "owner" => rule.owner,
                        "rule" => %rule,
                        "rule_id" => rule_id);

        self.rules.push((rule_id, rule));
        txn.add_undo(UndoOp::RemoveRule { rule_id });

        Ok(())
    }

    /// Remove the most recently added rule equal to `template`. Removing
    /// newest-first keeps symmetric add/remove sequences from an owner
    /// predictable.
    pub fn remove_rule_by_value(
        &mut self,
        template: &MatchRule,
        txn: &mut Transaction,
        mem: &mut MemGuard,
    ) -> BusResult<()> {
        mem.check()?;

        let index = self
            .rules
            .iter()
            .rposition(|(_, rule)| rule == template)
            .ok_or_else(|| {
                BusError::new(
                    ErrorKind::MatchRuleNotFound,
                    format!("no rule matching \"{}\"", template),
                )
            })?;

        let (rule_id, rule) = self.rules.remove(index);
        txn.add_undo(UndoOp::RestoreRule {
            rule_id,
            index,
            rule: Box::new(rule),
        });

        logging::debug!(self.log, "rule removed"; "rule_id" => rule_id);

        Ok(())
    }

    /// Compute the fan-out recipients of one message. Each connection
    /// appears at most once even when several of its rules match; the
    /// addressed recipient, if any, is pre-stamped so a signal is never
    /// double-delivered to it.
    pub fn recipients_of(
        &mut self,
        registry: &Registry,
        conns: &Connections,
        msg: &Message,
        sender: Option<ConnId>,
        addressed: Option<ConnId>,
    ) -> Vec<ConnId> {
        self.stamp += 1;
        let stamp = self.stamp;

        if let Some(addressed) = addressed {
            self.grow_stamps(addressed);
            self.stamps[addressed] = stamp;
        }

        let mut recipients = Vec::new();

        for index in 0..self.rules.len() {
            let owner = self.rules[index].1.owner;

            debug_assert!(
                !conns.is_disconnected(owner),
                "matcher holds a rule for a dead connection"
            );

            self.grow_stamps(owner);
            if self.stamps[owner] == stamp {
                continue;
            }

            if self.rules[index].1.matches(registry, msg, sender) {
                self.stamps[owner] = stamp;
                recipients.push(owner);
            }
        }

        recipients
    }

    /// Purge every rule owned by the disconnected connection, plus every
    /// rule pinned to its unique name: unique names are never reissued, so
    /// such rules can never fire again.
    pub fn owner_disconnected(&mut self, conn: ConnId, unique_name: &str) {
        let log = &self.log;
        self.rules.retain(|(rule_id, rule)| {
            let keep = rule.owner != conn
                && rule.sender.as_deref() != Some(unique_name)
                && rule.destination.as_deref() != Some(unique_name);

            if !keep {
                logging::trace!(log, "rule dropped on disconnect";
                                "rule_id" => *rule_id,
                                "conn" => conn);
            }

            keep
        });
    }

    /// Apply the matcher-owned undo ops.
    pub fn apply_undo(&mut self, op: &UndoOp) -> bool {
        match op {
            UndoOp::RemoveRule { rule_id } => {
                self.rules.retain(|(id, _)| id != rule_id);
                true
            }
            UndoOp::RestoreRule { rule_id, index, rule } => {
                let at = std::cmp::min(*index, self.rules.len());
                self.rules.insert(at, (*rule_id, (**rule).clone()));
                true
            }
            _ => false,
        }
    }

    #[inline]
    fn grow_stamps(&mut self, conn: ConnId) {
        if conn >= self.stamps.len() {
            self.stamps.resize(conn + 1, 0);
        }
    }
}
