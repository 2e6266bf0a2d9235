//! The dispatcher: one entry point per incoming message.
//!
//! A message is processed as one atomic unit: the connection's OOM reply
//! is armed first, the sender field is stamped, a transaction opens, the
//! message is classified by destination (driver method, broadcast,
//! unicast, daemon-local), and every resulting side effect (registry
//! mutations, match-rule changes, replies and signals) either commits
//! together or rolls back together. Failures turn into a single error
//! reply; memory exhaustion turns into the pre-reserved OOM reply and a
//! parked connection that retries once pressure clears.

use crate::bus::Bus;
use crate::driver;
use crate::logging;
use crate::message::{Message, MessageKind};
use crate::support::{BusError, BusResult, ErrorKind};
use crate::txn::Transaction;
use crate::{ConnId, BROADCAST_NAME, DRIVER_NAME, LOCAL_INTERFACE};
use std::rc::Rc;
use std::time::Instant;

enum RouteOutcome {
    Delivered,
    Disconnect,
}

/// Process one incoming message on `conn`.
pub fn dispatch_message(bus: &mut Bus, conn: ConnId, mut msg: Message, now: Instant) {
    // The OOM reply is the one thing dispatch refuses to run without: it
    // is what makes "tell the peer we're out of memory" allocation-free
    // later. If even that cannot be built, the message waits out the
    // pressure on a parked connection.
    if bus.conns.ensure_oom_reserve(conn, &mut bus.mem).is_err() {
        logging::warn!(bus.log, "no memory for oom reserve, parking"; "conn" => conn);
        bus.conns.park_message(conn, msg);
        if !bus.conns.suspend_reads(conn, &mut bus.main_loop, now) {
            bus.disconnect(conn, now);
        }
        return;
    }

    let was_active = bus.conns.is_active(conn);

    // Peers do not get to forge the sender field.
    msg.sender = bus.conns.unique_name(conn).map(str::to_string);

    let mut txn = Transaction::new();

    let outcome = route_message(bus, conn, &msg, &mut txn).and_then(|outcome| {
        run_service_created_hooks(bus, &mut txn)?;
        Ok(outcome)
    });

    match outcome {
        Ok(RouteOutcome::Delivered) => {
            bus.conns.clear_memory_retries(conn);
            bus.commit_transaction(txn, now);
        }
        Ok(RouteOutcome::Disconnect) => {
            bus.cancel_transaction(txn);
            bus.disconnect(conn, now);
        }
        Err(err) => fail_dispatch(bus, conn, &msg, txn, err, was_active, now),
    }
}

/// Classify by destination and stage the deliveries.
fn route_message(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: &mut Transaction,
) -> BusResult<RouteOutcome> {
    let destination = match msg.destination.as_deref() {
        None => {
            // Internal traffic. The only meaningful case is the daemon's
            // own disconnect signal; a peer injecting Local-interface
            // messages is violating the protocol and gets the same
            // treatment. Everything else is quietly ignored.
            if msg.interface.as_deref() == Some(LOCAL_INTERFACE) {
                return Ok(RouteOutcome::Disconnect);
            }
            return Ok(RouteOutcome::Delivered);
        }
        Some(destination) => destination.to_string(),
    };

    if destination == DRIVER_NAME {
        driver::handle_driver_message(bus, conn, msg, txn)?;
        return Ok(RouteOutcome::Delivered);
    }

    if !bus.conns.is_active(conn) {
        // Unauthenticated peers may only talk to the driver.
        logging::info!(bus.log, "unauthenticated peer routed past driver"; "conn" => conn);
        return Ok(RouteOutcome::Disconnect);
    }

    if destination == BROADCAST_NAME {
        stage_broadcast(bus, msg, txn)?;
    } else {
        stage_unicast(bus, conn, msg, &destination, txn)?;
    }

    Ok(RouteOutcome::Delivered)
}

/// Broadcast: every active connection the policy allows, in live-set
/// order.
fn stage_broadcast(bus: &mut Bus, msg: &Message, txn: &mut Transaction) -> BusResult<()> {
    let sender_name = msg.sender.clone().unwrap_or_default();
    let shared = Rc::new(msg.clone());

    for target in bus.conns.live() {
        if !bus.conns.is_active(target) {
            continue;
        }
        if !bus.policy.allow_receive(&sender_name) {
            continue;
        }
        bus.conns.stage_rc(txn, &mut bus.mem, target, shared.clone())?;
    }

    Ok(())
}

/// Unicast to the primary owner of `name`, plus matcher fan-out for
/// signals (subscribers and eavesdroppers), with the addressed recipient
/// pre-stamped against double delivery.
fn stage_unicast(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    name: &str,
    txn: &mut Transaction,
) -> BusResult<()> {
    if !bus.policy.allow_send(name) {
        return Err(BusError::new(
            ErrorKind::AccessDenied,
            format!("policy forbids sending to \"{}\"", name),
        ));
    }

    let owner = bus.registry.primary_owner(name).ok_or_else(|| {
        BusError::new(
            ErrorKind::ServiceDoesNotExist,
            format!("name \"{}\" has no owner", name),
        )
    })?;

    let shared = Rc::new(msg.clone());
    bus.conns.stage_rc(txn, &mut bus.mem, owner, shared.clone())?;

    if msg.kind == MessageKind::Signal {
        let sender_name = msg.sender.clone().unwrap_or_default();
        let recipients =
            bus.matcher
                .recipients_of(&bus.registry, &bus.conns, msg, Some(conn), Some(owner));

        for target in recipients {
            if !bus.policy.allow_receive(&sender_name) {
                continue;
            }
            bus.conns.stage_rc(txn, &mut bus.mem, target, shared.clone())?;
        }
    }

    Ok(())
}

/// Names created during this dispatch feed the activation waiters; their
/// replies land in the same transaction.
fn run_service_created_hooks(bus: &mut Bus, txn: &mut Transaction) -> BusResult<()> {
    loop {
        let created = txn.take_created_services();
        if created.is_empty() {
            return Ok(());
        }

        for name in created {
            bus.activation.on_service_created(
                &name,
                &mut bus.conns,
                txn,
                &mut bus.mem,
                &mut bus.main_loop,
            )?;
        }
    }
}

fn fail_dispatch(
    bus: &mut Bus,
    conn: ConnId,
    msg: &Message,
    txn: Transaction,
    err: BusError,
    was_active: bool,
    now: Instant,
) {
    logging::debug!(bus.log, "dispatch failed";
                    "conn" => conn,
                    "member" => msg.member.as_deref().unwrap_or(""),
                    "error" => %err);

    bus.cancel_transaction(txn);

    if !was_active {
        // Authentication-phase failures are fatal for the connection: a
        // half-done Hello must not leave an Active channel behind.
        bus.disconnect(conn, now);
        return;
    }

    match err.kind() {
        ErrorKind::NoMemory => {
            if !bus.conns.send_oom_reply(conn, msg, &bus.main_loop, now) {
                bus.disconnect(conn, now);
                return;
            }
            if !bus.conns.suspend_reads(conn, &mut bus.main_loop, now) {
                bus.disconnect(conn, now);
            }
        }
        ErrorKind::Disconnected => (),
        _ => {
            if !msg.wants_reply() {
                return;
            }

            let mut reply_txn = Transaction::new();
            let reply = Message::error_reply_to(msg, err.kind(), err.detail());

            match bus.conns.stage_message(&mut reply_txn, &mut bus.mem, conn, reply) {
                Ok(()) => bus.commit_transaction(reply_txn, now),
                Err(_) => {
                    bus.cancel_transaction(reply_txn);
                    if !bus.conns.send_oom_reply(conn, msg, &bus.main_loop, now) {
                        bus.disconnect(conn, now);
                    }
                }
            }
        }
    }
}
