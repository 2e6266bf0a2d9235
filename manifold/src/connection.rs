//! The connection manager: a slot arena of connection records driving the
//! per-connection lifecycle.
//!
//! Slots are recycled through a free list; the `live` set iterates in
//! insertion order, which is what makes broadcast delivery deterministic.
//! Each record couples the transport channel with the bus-side bookkeeping:
//! the names it owns, the pre-allocated out-of-memory reply, the auth
//! deadline and the memory-pressure parking state.

use crate::config::Limits;
use crate::logging;
use crate::mainloop::{MainLoop, TimeoutId, TimeoutKind, WatchKind};
use crate::message::Message;
use crate::net::channel::{Channel, Credentials};
use crate::support::{BusResult, ErrorKind, ErrorUtils, MemGuard, NetworkResult};
use crate::txn::{StagedSend, Transaction};
use crate::ConnId;
use indexmap::IndexSet;
use mio::{Ready, Token};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Poll token of the accept listener.
pub const LISTENER_TOKEN: Token = Token(0);
/// Poll token of the signal self-pipe.
pub const SIGNAL_TOKEN: Token = Token(1);

const TOKEN_BASE: usize = 2;

/// Parked connections retry after this long, and give up for good after
/// this many consecutive failures.
pub const MEMORY_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const MEMORY_RETRY_LIMIT: u32 = 8;

#[inline]
pub fn conn_token(conn: ConnId) -> Token {
    Token(conn + TOKEN_BASE)
}

struct Connection {
    channel: Channel,
    owned_names: Vec<String>,
    oom_reserve: Option<Box<Message>>,
    auth_timeout: Option<TimeoutId>,
    read_suspended: bool,
    memory_retries: u32,
    // A popped message waiting out memory pressure; redispatched when the
    // retry timer fires.
    parked: Option<Box<Message>>,
}

pub struct Connections {
    conns: Vec<Connection>,
    free: Vec<ConnId>,
    live: IndexSet<ConnId>,

    limits: Limits,
    next_serial: u32,

    log: logging::Logger,
}

impl Connections {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(limits: Limits, log: L) -> Connections {
        let manager_log = match log.into() {
            Some(log) => log.new(logging::o!("subsystem" => "connections")),
            _ => logging::null(),
        };

        Connections {
            conns: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            limits,
            next_serial: 0,
            log: manager_log,
        }
    }

    #[inline]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    /// Daemon-side message serial. Wraps, skipping zero (zero means unset).
    pub fn next_serial(&mut self) -> u32 {
        self.next_serial = self.next_serial.wrapping_add(1);
        if self.next_serial == 0 {
            self.next_serial = 1;
        }
        self.next_serial
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn incomplete_count(&self) -> usize {
        self.live
            .iter()
            .filter(|&&conn| !self.conns[conn].channel.is_active())
            .count()
    }

    /// Snapshot of the live slots in insertion order.
    pub fn live(&self) -> Vec<ConnId> {
        self.live.iter().copied().collect()
    }

    /// Accept a fresh transport stream into a slot. Returns `None` (and
    /// drops the stream) when the connection limits are already saturated.
    pub fn accept(
        &mut self,
        stream: mio::net::TcpStream,
        main_loop: &mut MainLoop,
        now: Instant,
    ) -> NetworkResult<Option<ConnId>> {
        if self.live.len() >= self.limits.max_connections {
            logging::warn!(self.log, "connection refused, at capacity";
                           "live" => self.live.len());
            return Ok(None);
        }

        if self.incomplete_count() >= self.limits.max_incomplete_connections {
            logging::warn!(self.log, "connection refused, too many incomplete";
                           "incomplete" => self.incomplete_count());
            return Ok(None);
        }

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.conns.len();
                self.conns.push(Connection {
                    channel: Channel::new(
                        self.limits.max_incoming_bytes,
                        self.limits.max_outgoing_bytes,
                        &self.log,
                    ),
                    owned_names: Vec::new(),
                    oom_reserve: None,
                    auth_timeout: None,
                    read_suspended: false,
                    memory_retries: 0,
                    parked: None,
                });
                id
            }
        };

        let conn = &mut self.conns[id];
        conn.channel.open(stream, now);
        conn.channel
            .register(conn_token(id), main_loop.poll(), Ready::readable())?;

        conn.auth_timeout = Some(main_loop.add_timeout(
            TimeoutKind::AuthExpired(id),
            Duration::from_millis(self.limits.auth_timeout_ms),
            now,
        ));

        main_loop.add_watch(conn_token(id), WatchKind::Connection(id));
        self.live.insert(id);

        logging::debug!(self.log, "connection accepted"; "conn" => id);

        Ok(Some(id))
    }

    #[inline]
    pub fn channel(&self, conn: ConnId) -> &Channel {
        &self.conns[conn].channel
    }

    #[inline]
    pub fn channel_mut(&mut self, conn: ConnId) -> &mut Channel {
        &mut self.conns[conn].channel
    }

    #[inline]
    pub fn is_active(&self, conn: ConnId) -> bool {
        self.conns[conn].channel.is_active()
    }

    #[inline]
    pub fn is_disconnected(&self, conn: ConnId) -> bool {
        self.conns[conn].channel.is_disconnected()
    }

    #[inline]
    pub fn unique_name(&self, conn: ConnId) -> Option<&str> {
        self.conns[conn].channel.unique_name()
    }

    #[inline]
    pub fn credentials(&self, conn: ConnId) -> Option<Credentials> {
        self.conns[conn].channel.credentials()
    }

    /// Promote an auth-pending connection; called by the Hello handler
    /// once the unique name is registered.
    pub fn mark_active(&mut self, conn: ConnId, unique_name: &str, main_loop: &mut MainLoop) {
        self.conns[conn].channel.mark_active(unique_name);

        if let Some(timeout) = self.conns[conn].auth_timeout.take() {
            main_loop.cancel_timeout(timeout);
        }

        logging::info!(self.log, "connection authenticated";
                       "conn" => conn,
                       "unique_name" => unique_name);
    }

    #[inline]
    pub fn owned_names(&self, conn: ConnId) -> &[String] {
        &self.conns[conn].owned_names
    }

    pub fn record_owned_name(&mut self, conn: ConnId, name: &str) {
        let owned = &mut self.conns[conn].owned_names;
        if !owned.iter().any(|existing| existing == name) {
            owned.push(name.to_string());
        }
    }

    pub fn forget_owned_name(&mut self, conn: ConnId, name: &str) {
        self.conns[conn].owned_names.retain(|existing| existing != name);
    }

    /// Stage `msg` to `target` through `txn`, reserving outbound quota now
    /// so the later commit cannot fail. Unset serials are assigned here.
    /// Sends to disconnected targets are silently dropped.
    pub fn stage_message(
        &mut self,
        txn: &mut Transaction,
        mem: &mut MemGuard,
        target: ConnId,
        mut msg: Message,
    ) -> BusResult<()> {
        if msg.serial == 0 {
            msg.serial = self.next_serial();
        }
        self.stage_rc(txn, mem, target, Rc::new(msg))
    }

    /// Rc variant for fan-out: one message staged to many targets.
    pub fn stage_rc(
        &mut self,
        txn: &mut Transaction,
        mem: &mut MemGuard,
        target: ConnId,
        msg: Rc<Message>,
    ) -> BusResult<()> {
        if self.is_disconnected(target) {
            return Ok(());
        }

        mem.check()?;

        let size = msg.wire_size();
        self.conns[target].channel.reserve(size)?;
        txn.stage(target, msg, size);

        Ok(())
    }

    /// Move committed sends onto their channels in stage order. Sends to
    /// connections that died in the meantime are dropped. Returns the
    /// connections whose channel could not take the frame and must be
    /// disconnected by the caller.
    pub fn commit_sends(
        &mut self,
        main_loop: &MainLoop,
        sends: Vec<StagedSend>,
        now: Instant,
    ) -> Vec<ConnId> {
        let mut broken = Vec::new();

        for send in sends {
            let channel = &mut self.conns[send.conn].channel;

            if channel.is_disconnected() {
                continue;
            }

            if channel.queue_reserved(&send.msg).has_failed() {
                logging::warn!(self.log, "outbound queue broken on commit"; "conn" => send.conn);
                if !broken.contains(&send.conn) {
                    broken.push(send.conn);
                }
                continue;
            }

            // Push what we can right away; the loop's writable events
            // drain the rest.
            if channel.send(now).has_failed() && !broken.contains(&send.conn) {
                broken.push(send.conn);
                continue;
            }

            self.update_write_interest(send.conn, main_loop);
        }

        broken
    }

    /// Return the reservations of cancelled sends.
    pub fn cancel_sends(&mut self, sends: Vec<StagedSend>) {
        for send in sends {
            let channel = &mut self.conns[send.conn].channel;
            if !channel.is_disconnected() {
                channel.unreserve(send.reserved);
            }
        }
    }

    /// Level-triggered polling must only ask for writable readiness while
    /// there is something to write, or the loop would spin.
    pub fn update_write_interest(&mut self, conn: ConnId, main_loop: &MainLoop) {
        let record = &self.conns[conn];
        if record.channel.is_disconnected() {
            return;
        }

        let mut ready = if record.read_suspended {
            Ready::empty()
        } else {
            Ready::readable()
        };
        if record.channel.has_egress() {
            ready = ready | Ready::writable();
        }

        if record
            .channel
            .reregister(conn_token(conn), main_loop.poll(), ready)
            .has_failed()
        {
            logging::warn!(self.log, "interest update failed"; "conn" => conn);
        }
    }

    /// Park a connection under memory pressure: reads stop until the retry
    /// timer re-arms them. Returns false once the retry budget is spent.
    pub fn suspend_reads(&mut self, conn: ConnId, main_loop: &mut MainLoop, now: Instant) -> bool {
        let record = &mut self.conns[conn];

        record.memory_retries += 1;
        if record.memory_retries > MEMORY_RETRY_LIMIT {
            return false;
        }

        record.read_suspended = true;
        main_loop.add_timeout(TimeoutKind::MemoryRetry(conn), MEMORY_RETRY_INTERVAL, now);
        self.update_write_interest(conn, main_loop);

        true
    }

    /// Retry-timer hook: resume reading.
    pub fn resume_reads(&mut self, conn: ConnId, main_loop: &MainLoop) {
        let record = &mut self.conns[conn];
        if record.channel.is_disconnected() {
            return;
        }

        record.read_suspended = false;
        self.update_write_interest(conn, main_loop);
    }

    /// Note that a dispatch round completed without memory trouble.
    #[inline]
    pub fn clear_memory_retries(&mut self, conn: ConnId) {
        self.conns[conn].memory_retries = 0;
    }

    /// Hold a popped message while the connection waits out memory
    /// pressure. At most one message is ever parked: the parker also
    /// suspends reads, so nothing further gets popped.
    #[inline]
    pub fn park_message(&mut self, conn: ConnId, msg: Message) {
        debug_assert!(self.conns[conn].parked.is_none());
        self.conns[conn].parked = Some(Box::new(msg));
    }

    #[inline]
    pub fn take_parked(&mut self, conn: ConnId) -> Option<Message> {
        self.conns[conn].parked.take().map(|msg| *msg)
    }

    /// Make sure the connection holds its pre-allocated OOM error reply.
    /// This is the one allocation the dispatcher insists on up front, so a
    /// later failure can always be reported.
    pub fn ensure_oom_reserve(&mut self, conn: ConnId, mem: &mut MemGuard) -> BusResult<()> {
        if self.conns[conn].oom_reserve.is_some() {
            return Ok(());
        }

        mem.check()?;

        let reserve = Message::error(ErrorKind::NoMemory, "out of memory");
        self.conns[conn].oom_reserve = Some(Box::new(reserve));
        Ok(())
    }

    /// Deliver the pre-reserved OOM error in reply to `request`, outside
    /// any transaction and outside the outbound quota. Returns false when
    /// even that was impossible and the connection should be dropped.
    pub fn send_oom_reply(
        &mut self,
        conn: ConnId,
        request: &Message,
        main_loop: &MainLoop,
        now: Instant,
    ) -> bool {
        let serial = self.next_serial();
        let record = &mut self.conns[conn];

        if record.channel.is_disconnected() {
            return true;
        }

        let mut reply = match record.oom_reserve.take() {
            Some(reply) => reply,
            None => {
                logging::error!(self.log, "oom reserve missing"; "conn" => conn);
                return false;
            }
        };

        reply.serial = serial;
        reply.reply_serial = request.serial;
        reply.destination = request.sender.clone();

        if record.channel.queue_oob(&reply).has_failed() {
            return false;
        }

        drop(record.channel.send(now));
        self.update_write_interest(conn, main_loop);

        true
    }

    /// First half of teardown: silence the transport. The record itself
    /// survives until `reclaim` so registry and matcher cleanup can still
    /// consult it.
    pub fn teardown_transport(&mut self, conn: ConnId, main_loop: &mut MainLoop) {
        let record = &mut self.conns[conn];

        if record.channel.is_disconnected() {
            return;
        }

        if let Some(timeout) = record.auth_timeout.take() {
            main_loop.cancel_timeout(timeout);
        }

        main_loop.remove_watch(conn_token(conn));
        drop(record.channel.deregister(main_loop.poll()));
        record.channel.close();

        self.live.shift_remove(&conn);

        logging::info!(self.log, "connection closed"; "conn" => conn);
    }

    /// Final half of teardown: recycle the slot.
    pub fn reclaim(&mut self, conn: ConnId) {
        debug_assert!(self.conns[conn].channel.is_disconnected());
        debug_assert!(!self.live.contains(&conn));

        let record = &mut self.conns[conn];
        record.owned_names.clear();
        record.oom_reserve = None;
        record.read_suspended = false;
        record.memory_retries = 0;
        record.parked = None;

        self.free.push(conn);
    }

    #[cfg(test)]
    pub(crate) fn add_streamless(&mut self, main_loop: &mut MainLoop) -> ConnId {
        use crate::net::channel::ChannelState;

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.conns.len();
                self.conns.push(Connection {
                    channel: Channel::new(
                        self.limits.max_incoming_bytes,
                        self.limits.max_outgoing_bytes,
                        None,
                    ),
                    owned_names: Vec::new(),
                    oom_reserve: None,
                    auth_timeout: None,
                    read_suspended: false,
                    memory_retries: 0,
                    parked: None,
                });
                id
            }
        };

        self.conns[id]
            .channel
            .force_state(ChannelState::AuthPending(Instant::now()));

        main_loop.add_watch(conn_token(id), WatchKind::Connection(id));
        self.live.insert(id);
        id
    }
}
