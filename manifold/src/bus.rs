//! The bus context: the single owning root holding every subsystem, and
//! the daemon run loop gluing them together.
//!
//! Ownership flows strictly downward from here: the loop, the connection
//! arena, the registry, the matcher, the activation tables and the policy
//! are all plain fields, so there is no module-level state anywhere in the
//! core and the borrow checker enforces the single-threaded discipline the
//! design relies on.

use crate::config::BusConfig;
use crate::connection::{Connections, LISTENER_TOKEN, SIGNAL_TOKEN};
use crate::dispatch;
use crate::logging;
use crate::mainloop::{MainLoop, ReadyEvent, TimeoutKind, WatchKind};
use crate::matcher::Matcher;
use crate::message::Message;
use crate::policy::Policy;
use crate::registry::Registry;
use crate::activation::Activation;
use crate::support::{ErrorUtils, MemGuard};
use crate::txn::{Transaction, UndoOp};
use crate::{ConnId, LOCAL_INTERFACE};
use mio::net::TcpListener;
use mio::Ready;
use std::fs::File;
use std::io;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Byte written to the signal pipe for "terminate".
pub const SIGNAL_BYTE_QUIT: u8 = b'T';
/// Byte written to the signal pipe for "reload configuration".
pub const SIGNAL_BYTE_RELOAD: u8 = b'H';

pub struct Bus {
    pub config: BusConfig,
    pub config_path: Option<PathBuf>,

    pub main_loop: MainLoop,
    pub conns: Connections,
    pub registry: Registry,
    pub matcher: Matcher,
    pub activation: Activation,
    pub policy: Policy,
    pub mem: MemGuard,

    listener: Option<TcpListener>,
    signal_pipe: Option<File>,

    pub log: logging::Logger,
}

impl Bus {
    /// Bind the listen address and assemble all subsystems.
    pub fn new(
        config: BusConfig,
        config_path: Option<PathBuf>,
        log: logging::Logger,
    ) -> io::Result<Bus> {
        let mut main_loop = MainLoop::new()?;

        let address: SocketAddr = config.bus.address.parse().map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad listen address \"{}\": {}", config.bus.address, err),
            )
        })?;

        let listener = TcpListener::bind(&address)?;
        main_loop
            .poll()
            .register(&listener, LISTENER_TOKEN, Ready::readable(), mio::PollOpt::level())?;
        main_loop.add_watch(LISTENER_TOKEN, WatchKind::Listener);

        let local_address = listener.local_addr()?;

        let policy = Policy::from_config(&config.policy, &log)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let activation = Activation::new(
            &config.bus.service_dirs,
            &local_address.to_string(),
            &config.bus.bus_type,
            Duration::from_millis(config.limits.activation_timeout_ms),
            &log,
        );

        logging::info!(log, "bus listening";
                       "address" => %local_address,
                       "bus_type" => &config.bus.bus_type);

        Ok(Bus {
            conns: Connections::new(config.limits, &log),
            registry: Registry::new(&log),
            matcher: Matcher::new(&log),
            activation,
            policy,
            mem: MemGuard::new(),
            config,
            config_path,
            main_loop,
            listener: Some(listener),
            signal_pipe: None,
            log,
        })
    }

    /// The bound listen address, for `--print-address`.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|listener| listener.local_addr().ok())
    }

    /// Wire the out-of-band signal pipe into the loop. The read end is a
    /// non-blocking pipe; the process signal handlers write single bytes.
    pub fn set_signal_pipe(&mut self, pipe: File) -> io::Result<()> {
        use mio::unix::EventedFd;
        use std::os::unix::io::AsRawFd;

        self.main_loop.poll().register(
            &EventedFd(&pipe.as_raw_fd()),
            SIGNAL_TOKEN,
            Ready::readable(),
            mio::PollOpt::level(),
        )?;
        self.main_loop.add_watch(SIGNAL_TOKEN, WatchKind::SignalPipe);
        self.signal_pipe = Some(pipe);

        Ok(())
    }

    /// Run until quit. One iteration: block for readiness, deliver ready
    /// events in watch order (abandoning the batch if the watch set
    /// mutates under it), then fire due timeouts.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.main_loop.is_quitting() && self.main_loop.has_watches() {
            let now = Instant::now();
            let events = self.main_loop.wait(now)?;

            let generation = self.main_loop.generation();
            for event in events {
                self.handle_ready(event, Instant::now());
                if self.main_loop.generation() != generation {
                    break;
                }
            }

            let now = Instant::now();
            for kind in self.main_loop.due_timeouts(now) {
                self.handle_timeout(kind, now);
            }
        }

        logging::info!(self.log, "bus loop finished");
        Ok(())
    }

    fn handle_ready(&mut self, event: ReadyEvent, now: Instant) {
        match event.kind {
            WatchKind::Listener => self.accept_pending(now),
            WatchKind::SignalPipe => self.drain_signal_pipe(),
            WatchKind::Connection(conn) => self.handle_connection_ready(conn, event, now),
        }
    }

    fn accept_pending(&mut self, now: Instant) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, address)) => {
                    logging::debug!(self.log, "incoming stream"; "peer" => %address);
                    if self
                        .conns
                        .accept(stream, &mut self.main_loop, now)
                        .has_failed()
                    {
                        logging::warn!(self.log, "accept failed"; "peer" => %address);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::warn!(self.log, "listener error"; "error" => %err);
                    return;
                }
            }
        }
    }

    fn drain_signal_pipe(&mut self) {
        let mut raw = [0u8; 64];
        let mut reload = false;
        let mut quit = false;

        loop {
            let pipe = match self.signal_pipe.as_ref() {
                Some(pipe) => pipe,
                None => return,
            };

            let mut reader: &File = pipe;
            match reader.read(&mut raw) {
                Ok(0) => break,
                Ok(count) => {
                    for &byte in &raw[..count] {
                        match byte {
                            SIGNAL_BYTE_QUIT => quit = true,
                            SIGNAL_BYTE_RELOAD => reload = true,
                            _ => (),
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::warn!(self.log, "signal pipe error"; "error" => %err);
                    break;
                }
            }
        }

        if reload {
            logging::info!(self.log, "reload requested by signal");
            if let Err(err) = self.reload_config() {
                logging::warn!(self.log, "reload failed"; "error" => %err);
            }
        }

        if quit {
            logging::info!(self.log, "termination requested by signal");
            self.main_loop.quit();
        }
    }

    fn handle_connection_ready(&mut self, conn: ConnId, event: ReadyEvent, now: Instant) {
        if self.conns.is_disconnected(conn) {
            return;
        }

        if event.writable {
            if self.conns.channel_mut(conn).send(now).has_failed() {
                self.disconnect(conn, now);
                return;
            }
            self.conns.update_write_interest(conn, &self.main_loop);
        }

        if !event.readable {
            return;
        }

        let receive_result = self.conns.channel_mut(conn).receive(now);

        // Frames that arrived before a close still get dispatched; the
        // teardown happens after the read buffer has been drained.
        loop {
            if self.conns.is_disconnected(conn) {
                return;
            }

            match self.conns.channel_mut(conn).pop_message() {
                Ok(Some(msg)) => dispatch::dispatch_message(self, conn, msg, now),
                Ok(None) => break,
                Err(_) => {
                    logging::warn!(self.log, "protocol error"; "conn" => conn);
                    self.disconnect(conn, now);
                    return;
                }
            }
        }

        if receive_result.has_failed() {
            // Route the close through dispatch as the daemon-local
            // disconnect signal, the same path a peer-sent Local message
            // would take.
            let local = Message::signal(LOCAL_INTERFACE, "Disconnected");
            dispatch::dispatch_message(self, conn, local, now);
        }
    }

    pub(crate) fn handle_timeout(&mut self, kind: TimeoutKind, now: Instant) {
        match kind {
            TimeoutKind::AuthExpired(conn) => {
                if !self.conns.is_disconnected(conn) && !self.conns.is_active(conn) {
                    logging::info!(self.log, "authentication timed out"; "conn" => conn);
                    self.disconnect(conn, now);
                }
            }
            TimeoutKind::ActivationExpired(name) => {
                let mut txn = Transaction::new();
                match self.activation.on_timeout(
                    &name,
                    &mut self.conns,
                    &mut txn,
                    &mut self.mem,
                ) {
                    Ok(()) => self.commit_transaction(txn, now),
                    Err(err) => {
                        logging::warn!(self.log, "activation timeout delivery failed";
                                       "name" => &name,
                                       "error" => %err);
                        self.cancel_transaction(txn);
                    }
                }
            }
            TimeoutKind::MemoryRetry(conn) => {
                if self.conns.is_disconnected(conn) {
                    return;
                }
                if let Some(msg) = self.conns.take_parked(conn) {
                    dispatch::dispatch_message(self, conn, msg, now);
                }
                if !self.conns.is_disconnected(conn) {
                    self.conns.resume_reads(conn, &self.main_loop);
                }
            }
        }
    }

    /// Commit: staged sends move to the channels; channels that cannot
    /// take their frame are torn down.
    pub fn commit_transaction(&mut self, txn: Transaction, now: Instant) {
        let sends = txn.commit();
        let broken = self.conns.commit_sends(&self.main_loop, sends, now);
        for conn in broken {
            self.disconnect(conn, now);
        }
    }

    /// Cancel: reservations return and every undo op is applied newest
    /// first by the subsystem that owns it.
    pub fn cancel_transaction(&mut self, txn: Transaction) {
        let (sends, undo) = txn.cancel();
        self.conns.cancel_sends(sends);

        for op in &undo {
            match op {
                UndoOp::RemoveOwner { .. }
                | UndoOp::InsertOwnerAt { .. }
                | UndoOp::SetProhibitReplacement { .. } => {
                    self.registry.apply_undo(op);
                }
                UndoOp::RemoveRule { .. } | UndoOp::RestoreRule { .. } => {
                    self.matcher.apply_undo(op);
                }
                UndoOp::ForgetOwnedName { conn, name } => {
                    self.conns.forget_owned_name(*conn, name);
                }
                UndoOp::RememberOwnedName { conn, name } => {
                    self.conns.record_owned_name(*conn, name);
                }
            }
        }
    }

    /// Full disconnect: silence the transport, release every owned name
    /// (emitting the same notifications as voluntary releases), sweep the
    /// matcher, drop activation waiters, recycle the slot.
    pub fn disconnect(&mut self, conn: ConnId, now: Instant) {
        let mut worklist = vec![conn];

        while let Some(conn) = worklist.pop() {
            if self.conns.is_disconnected(conn) {
                continue;
            }

            let unique = self.conns.unique_name(conn).map(str::to_string);
            self.conns.teardown_transport(conn, &mut self.main_loop);

            // Cleanup must run to completion: it uses its own memory guard
            // so injected pressure cannot abort it, mirroring the
            // wait-until-done stance the daemon takes for its own state.
            let mut cleanup_mem = MemGuard::new();
            let mut txn = Transaction::new();

            for name in self.conns.owned_names(conn).to_vec() {
                if let Err(err) = self.registry.release(
                    &name,
                    conn,
                    &mut self.conns,
                    &self.policy,
                    &mut txn,
                    &mut cleanup_mem,
                ) {
                    logging::warn!(self.log, "release failed during disconnect";
                                   "name" => &name,
                                   "error" => %err);
                }
            }

            if let Some(ref unique) = unique {
                self.matcher.owner_disconnected(conn, unique);
            }
            self.activation.owner_disconnected(conn);

            let sends = txn.commit();
            let broken = self.conns.commit_sends(&self.main_loop, sends, now);
            worklist.extend(broken);

            self.conns.reclaim(conn);
        }
    }

    /// Re-read the config file and swap limits, policy and the service
    /// descriptor index. The running config survives a failed reload.
    pub fn reload_config(&mut self) -> Result<(), String> {
        let path = match self.config_path.as_ref() {
            Some(path) => path.clone(),
            None => return Err("no configuration file to reload".to_string()),
        };

        let config = BusConfig::load(&path)?;
        let policy = Policy::from_config(&config.policy, &self.log)?;

        self.conns.set_limits(config.limits);
        self.activation.reconfigure(
            &config.bus.service_dirs,
            Duration::from_millis(config.limits.activation_timeout_ms),
        );
        self.policy = policy;
        self.config = config;

        logging::info!(self.log, "configuration reloaded"; "path" => %path.display());

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(config: BusConfig) -> Bus {
        let log = logging::null();

        let activation = Activation::new(
            &config.bus.service_dirs,
            "127.0.0.1:0",
            &config.bus.bus_type,
            Duration::from_millis(config.limits.activation_timeout_ms),
            None,
        );

        let policy = Policy::from_config(&config.policy, None).expect("test policy");

        Bus {
            conns: Connections::new(config.limits, None),
            registry: Registry::new(None),
            matcher: Matcher::new(None),
            activation,
            policy,
            mem: MemGuard::new(),
            config,
            config_path: None,
            main_loop: MainLoop::new().expect("test loop"),
            listener: None,
            signal_pipe: None,
            log,
        }
    }
}
