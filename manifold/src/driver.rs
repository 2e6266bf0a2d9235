//! The driver: the daemon-internal pseudo-peer at `org.busbar.Bus`
//! implementing the management method surface, plus the builders that
//! stage the driver's signals (`NameOwnerChanged`, `NameAcquired`,
//! `NameLost`) on behalf of the registry.
//!
//! The method set is a closed enumeration; the only open-ended case is an
//! unknown member, which fails with `UnknownMethod`.

use crate::bus::Bus;
use crate::connection::Connections;
use crate::matcher::MatchRule;
use crate::message::{Arg, Message};
use crate::policy::Policy;
use crate::support::{BusError, BusResult, ErrorKind, MemGuard};
use crate::txn::Transaction;
use crate::{ConnId, BROADCAST_NAME, DRIVER_INTERFACE, DRIVER_NAME};
use std::rc::Rc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DriverMethod {
    Hello,
    RequestName,
    ReleaseName,
    ListNames,
    NameHasOwner,
    GetNameOwner,
    StartServiceByName,
    AddMatch,
    RemoveMatch,
    GetConnectionUnixUser,
    GetConnectionUnixProcessId,
    ReloadConfig,
}

impl DriverMethod {
    pub fn from_member(member: &str) -> Option<DriverMethod> {
        match member {
            "Hello" => Some(DriverMethod::Hello),
            "RequestName" => Some(DriverMethod::RequestName),
            "ReleaseName" => Some(DriverMethod::ReleaseName),
            "ListNames" => Some(DriverMethod::ListNames),
            "NameHasOwner" => Some(DriverMethod::NameHasOwner),
            "GetNameOwner" => Some(DriverMethod::GetNameOwner),
            "StartServiceByName" => Some(DriverMethod::StartServiceByName),
            "AddMatch" => Some(DriverMethod::AddMatch),
            "RemoveMatch" => Some(DriverMethod::RemoveMatch),
            "GetConnectionUnixUser" => Some(DriverMethod::GetConnectionUnixUser),
            "GetConnectionUnixProcessID" => Some(DriverMethod::GetConnectionUnixProcessId),
            "ReloadConfig" => Some(DriverMethod::ReloadConfig),
            _ => None,
        }
    }
}

/// Entry point for every message addressed to the driver.
pub fn handle_driver_message(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    let member = msg.member.as_deref().unwrap_or("");
    let method = DriverMethod::from_member(member).ok_or_else(|| {
        BusError::new(
            ErrorKind::UnknownMethod,
            format!("\"{}\" is not a known bus method", member),
        )
    })?;

    if method != DriverMethod::Hello && !bus.conns.is_active(conn) {
        // Unauthenticated peers get exactly one verb.
        return Err(BusError::new(
            ErrorKind::AccessDenied,
            "only Hello may precede authentication",
        ));
    }

    match method {
        DriverMethod::Hello => handle_hello(bus, conn, msg, txn),
        DriverMethod::RequestName => handle_request_name(bus, conn, msg, txn),
        DriverMethod::ReleaseName => handle_release_name(bus, conn, msg, txn),
        DriverMethod::ListNames => handle_list_names(bus, conn, msg, txn),
        DriverMethod::NameHasOwner => handle_name_has_owner(bus, conn, msg, txn),
        DriverMethod::GetNameOwner => handle_get_name_owner(bus, conn, msg, txn),
        DriverMethod::StartServiceByName => handle_start_service(bus, conn, msg, txn),
        DriverMethod::AddMatch => handle_add_match(bus, conn, msg, txn),
        DriverMethod::RemoveMatch => handle_remove_match(bus, conn, msg, txn),
        DriverMethod::GetConnectionUnixUser => handle_get_unix_user(bus, conn, msg, txn),
        DriverMethod::GetConnectionUnixProcessId => handle_get_unix_pid(bus, conn, msg, txn),
        DriverMethod::ReloadConfig => handle_reload_config(bus, conn, msg, txn),
    }
}

fn stage_reply(
    bus: &mut Bus,
    conn: ConnId,
    request: &Message,
    reply: Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    if !request.wants_reply() {
        return Ok(());
    }

    bus.conns.stage_message(txn, &mut bus.mem, conn, reply)
}

fn handle_hello(bus: &mut Bus, conn: ConnId, msg: &Message, txn: &mut Transaction) -> BusResult<()> {
    if bus.conns.is_active(conn) {
        return Err(BusError::new(
            ErrorKind::Failed,
            "connection already sent Hello",
        ));
    }

    let unique = bus.registry.next_unique_name();

    // The connection becomes Active before its unique name is registered
    // so the notification path can resolve it. A failure from here on is
    // fatal for the connection (the dispatcher tears it down), which is
    // what keeps the name<->connection invariant intact.
    bus.conns.mark_active(conn, &unique, &mut bus.main_loop);

    bus.registry.ensure(
        &unique,
        conn,
        &mut bus.conns,
        &bus.policy,
        txn,
        &mut bus.mem,
    )?;
    bus.registry.set_prohibit_replacement(&unique, true, txn);

    let mut reply = Message::method_return_to(msg);
    reply.destination = Some(unique.clone());
    let reply = reply.with_arg(Arg::Str(unique));
    stage_reply(bus, conn, msg, reply, txn)
}

fn handle_request_name(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    let name = msg.arg_str(0)?.to_string();
    let flags = msg.arg_u32(1)?;

    if !bus.policy.allow_own(&name) {
        return Err(BusError::new(
            ErrorKind::AccessDenied,
            format!("policy forbids owning \"{}\"", name),
        ));
    }

    if bus.conns.owned_names(conn).len() >= bus.conns.limits().max_services_per_connection {
        return Err(BusError::new(
            ErrorKind::LimitsExceeded,
            "connection owns too many names",
        ));
    }

    let result = bus.registry.acquire(
        &name,
        conn,
        flags,
        &mut bus.conns,
        &bus.policy,
        txn,
        &mut bus.mem,
    )?;

    let reply = Message::method_return_to(msg).with_arg(Arg::U32(result.code()));
    stage_reply(bus, conn, msg, reply, txn)
}

fn handle_release_name(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    let name = msg.arg_str(0)?.to_string();

    if name.is_empty() || name.starts_with(':') {
        return Err(BusError::new(
            ErrorKind::InvalidArgs,
            format!("cannot release \"{}\"", name),
        ));
    }

    // Releasing a name the caller does not own is a quiet no-op.
    bus.registry.release(
        &name,
        conn,
        &mut bus.conns,
        &bus.policy,
        txn,
        &mut bus.mem,
    )?;

    stage_reply(bus, conn, msg, Message::method_return_to(msg), txn)
}

fn handle_list_names(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    let mut names = vec![DRIVER_NAME.to_string()];
    names.extend(bus.registry.list());

    let reply = Message::method_return_to(msg).with_arg(Arg::StrArray(names));
    stage_reply(bus, conn, msg, reply, txn)
}

fn handle_name_has_owner(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    let name = msg.arg_str(0)?;
    let owned = name == DRIVER_NAME || bus.registry.lookup(name).is_some();

    let reply = Message::method_return_to(msg).with_arg(Arg::Bool(owned));
    stage_reply(bus, conn, msg, reply, txn)
}

fn handle_get_name_owner(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    let name = msg.arg_str(0)?.to_string();

    let owner_name = if name == DRIVER_NAME {
        DRIVER_NAME.to_string()
    } else {
        let owner = bus.registry.primary_owner(&name).ok_or_else(|| {
            BusError::new(
                ErrorKind::NameHasNoOwner,
                format!("name \"{}\" has no owner", name),
            )
        })?;
        bus.conns
            .unique_name(owner)
            .expect("Primary owner must be an active connection")
            .to_string()
    };

    let reply = Message::method_return_to(msg).with_arg(Arg::Str(owner_name));
    stage_reply(bus, conn, msg, reply, txn)
}

fn handle_start_service(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    let name = msg.arg_str(0)?.to_string();
    let _flags = msg.arg_u32(1)?;

    if name.is_empty() || name.starts_with(':') {
        return Err(BusError::new(
            ErrorKind::InvalidArgs,
            format!("cannot activate \"{}\"", name),
        ));
    }

    if !bus.policy.allow_activate(&name) {
        return Err(BusError::new(
            ErrorKind::AccessDenied,
            format!("policy forbids activating \"{}\"", name),
        ));
    }

    let already_owned = bus.registry.lookup(&name).is_some();

    bus.activation.activate(
        &name,
        conn,
        msg,
        already_owned,
        &mut bus.conns,
        txn,
        &mut bus.mem,
        &mut bus.main_loop,
    )
}

fn handle_add_match(bus: &mut Bus, conn: ConnId, msg: &Message, txn: &mut Transaction) -> BusResult<()> {
    let text = msg.arg_str(0)?;

    if bus.matcher.count_owned(conn) >= bus.conns.limits().max_match_rules_per_connection {
        return Err(BusError::new(
            ErrorKind::LimitsExceeded,
            "connection holds too many match rules",
        ));
    }

    let rule = MatchRule::parse(conn, text)?;
    bus.matcher.add_rule(rule, txn, &mut bus.mem)?;

    stage_reply(bus, conn, msg, Message::method_return_to(msg), txn)
}

fn handle_remove_match(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    let text = msg.arg_str(0)?;

    let template = MatchRule::parse(conn, text)?;
    bus.matcher.remove_rule_by_value(&template, txn, &mut bus.mem)?;

    stage_reply(bus, conn, msg, Message::method_return_to(msg), txn)
}

fn resolve_credentials(bus: &Bus, name: &str) -> BusResult<crate::net::channel::Credentials> {
    let owner = bus.registry.primary_owner(name).ok_or_else(|| {
        BusError::new(
            ErrorKind::NameHasNoOwner,
            format!("name \"{}\" has no owner", name),
        )
    })?;

    bus.conns.credentials(owner).ok_or_else(|| {
        BusError::new(
            ErrorKind::Failed,
            format!("could not determine credentials of \"{}\"", name),
        )
    })
}

fn handle_get_unix_user(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    let name = msg.arg_str(0)?.to_string();
    let credentials = resolve_credentials(bus, &name)?;

    let reply = Message::method_return_to(msg).with_arg(Arg::U32(credentials.uid));
    stage_reply(bus, conn, msg, reply, txn)
}

fn handle_get_unix_pid(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    let name = msg.arg_str(0)?.to_string();
    let credentials = resolve_credentials(bus, &name)?;

    let reply = Message::method_return_to(msg).with_arg(Arg::U32(credentials.pid));
    stage_reply(bus, conn, msg, reply, txn)
}

fn handle_reload_config(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<()> {
    bus.reload_config()
        .map_err(|err| BusError::new(ErrorKind::Failed, err))?;

    stage_reply(bus, conn, msg, Message::method_return_to(msg), txn)
}

/// Stage the `NameOwnerChanged(name, old, new)` broadcast to every active
/// connection the policy lets hear from the driver.
pub fn stage_name_owner_changed(
    conns: &mut Connections,
    policy: &Policy,
    txn: &mut Transaction,
    mem: &mut MemGuard,
    name: &str,
    old: Option<ConnId>,
    new: Option<ConnId>,
) -> BusResult<()> {
    let resolve = |conns: &Connections, conn: Option<ConnId>| -> String {
        conn.and_then(|conn| conns.unique_name(conn))
            .unwrap_or("")
            .to_string()
    };

    let old_name = resolve(conns, old);
    let new_name = resolve(conns, new);

    let mut signal = Message::signal(DRIVER_INTERFACE, "NameOwnerChanged")
        .with_arg(Arg::Str(name.to_string()))
        .with_arg(Arg::Str(old_name))
        .with_arg(Arg::Str(new_name));
    signal.sender = Some(DRIVER_NAME.to_string());
    signal.destination = Some(BROADCAST_NAME.to_string());
    signal.serial = conns.next_serial();

    let signal = Rc::new(signal);

    for conn in conns.live() {
        if !conns.is_active(conn) {
            continue;
        }
        if !policy.allow_receive(DRIVER_NAME) {
            continue;
        }
        conns.stage_rc(txn, mem, conn, signal.clone())?;
    }

    Ok(())
}

/// Stage the `NameAcquired(name)` unicast to the new primary owner.
pub fn stage_name_acquired(
    conns: &mut Connections,
    txn: &mut Transaction,
    mem: &mut MemGuard,
    owner: ConnId,
    name: &str,
) -> BusResult<()> {
    stage_owner_unicast(conns, txn, mem, owner, name, "NameAcquired")
}

/// Stage the `NameLost(name)` unicast to the previous primary owner.
pub fn stage_name_lost(
    conns: &mut Connections,
    txn: &mut Transaction,
    mem: &mut MemGuard,
    owner: ConnId,
    name: &str,
) -> BusResult<()> {
    stage_owner_unicast(conns, txn, mem, owner, name, "NameLost")
}

fn stage_owner_unicast(
    conns: &mut Connections,
    txn: &mut Transaction,
    mem: &mut MemGuard,
    owner: ConnId,
    name: &str,
    member: &str,
) -> BusResult<()> {
    let destination = match conns.unique_name(owner) {
        Some(unique) => unique.to_string(),
        // The owner is mid-teardown; the unicast has nowhere to go.
        None => return Ok(()),
    };

    let mut signal =
        Message::signal(DRIVER_INTERFACE, member).with_arg(Arg::Str(name.to_string()));
    signal.sender = Some(DRIVER_NAME.to_string());
    signal.destination = Some(destination);

    conns.stage_message(txn, mem, owner, signal)
}

// Handler behavior is exercised end to end in the dispatch tests, which
// drive complete messages through a full Bus.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_mapping_is_total() {
        let cases = [
            ("Hello", DriverMethod::Hello),
            ("RequestName", DriverMethod::RequestName),
            ("ReleaseName", DriverMethod::ReleaseName),
            ("ListNames", DriverMethod::ListNames),
            ("NameHasOwner", DriverMethod::NameHasOwner),
            ("GetNameOwner", DriverMethod::GetNameOwner),
            ("StartServiceByName", DriverMethod::StartServiceByName),
            ("AddMatch", DriverMethod::AddMatch),
            ("RemoveMatch", DriverMethod::RemoveMatch),
            ("GetConnectionUnixUser", DriverMethod::GetConnectionUnixUser),
            ("GetConnectionUnixProcessID", DriverMethod::GetConnectionUnixProcessId),
            ("ReloadConfig", DriverMethod::ReloadConfig),
        ];

        for (member, method) in &cases {
            assert_eq!(DriverMethod::from_member(member), Some(*method));
        }

        assert_eq!(DriverMethod::from_member("ListQueuedOwners"), None);
        assert_eq!(DriverMethod::from_member(""), None);
    }
}
