//! On-demand service activation.
//!
//! At startup (and on config reload) the configured directories are scanned
//! for `.service` descriptor files naming a well-known name and the command
//! that provides it. A StartServiceByName for a known, not-yet-owned name
//! creates a *pending activation* coalescing every concurrent requester:
//! the provider process is spawned exactly once, and when the name finally
//! appears in the registry every waiter receives its reply in one atomic
//! batch. A provider that never shows up is timed out and its waiters are
//! failed with a spawn error.

use crate::connection::Connections;
use crate::logging;
use crate::mainloop::{MainLoop, TimeoutId, TimeoutKind};
use crate::message::{Arg, Message};
use crate::support::{BusError, BusResult, ErrorKind, MemGuard};
use crate::txn::Transaction;
use crate::ConnId;
use hashbrown::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

/// StartServiceByName reply: the provider was spawned and the name showed up.
pub const ACTIVATION_REPLY_ACTIVATED: u32 = 1;
/// StartServiceByName reply: the name already had an owner.
pub const ACTIVATION_REPLY_ALREADY_ACTIVE: u32 = 2;

/// Environment handed to spawned providers.
pub const ENV_BUS_ADDRESS: &str = "BUSBAR_BUS_ADDRESS";
pub const ENV_BUS_TYPE: &str = "BUSBAR_BUS_TYPE";

const SERVICE_SUFFIX: &str = ".service";
const SERVICE_SECTION: &str = "Bus Service";
const KEY_NAME: &str = "Name";
const KEY_EXEC: &str = "Exec";

/// One parsed descriptor file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub exec: Vec<String>,
    pub origin: PathBuf,
}

struct Waiter {
    requester: ConnId,
    request: Message,
}

/// The live record coalescing all waiters for one not-yet-appeared name.
struct PendingActivation {
    waiters: Vec<Waiter>,
    timeout: TimeoutId,
}

pub struct Activation {
    directories: Vec<PathBuf>,
    descriptors: HashMap<String, ServiceDescriptor>,
    pending: HashMap<String, PendingActivation>,

    bus_address: String,
    bus_type: String,
    timeout: Duration,

    log: logging::Logger,
}

impl Activation {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        directories: &[String],
        bus_address: &str,
        bus_type: &str,
        timeout: Duration,
        log: L,
    ) -> Activation {
        let activation_log = match log.into() {
            Some(log) => log.new(logging::o!("subsystem" => "activation")),
            _ => logging::null(),
        };

        let mut activation = Activation {
            directories: directories.iter().map(PathBuf::from).collect(),
            descriptors: HashMap::new(),
            pending: HashMap::new(),
            bus_address: bus_address.to_string(),
            bus_type: bus_type.to_string(),
            timeout,
            log: activation_log,
        };

        activation.rescan();
        activation
    }

    /// Rebuild the descriptor index from the configured directories. The
    /// first file claiming a name wins, both within a directory (in
    /// `read_dir` yield order, which is unspecified) and across the
    /// directory list (in list order); later claims are logged and skipped.
    pub fn rescan(&mut self) {
        self.descriptors.clear();

        let directories = self.directories.clone();
        for directory in &directories {
            if let Err(err) = self.scan_directory(directory) {
                logging::warn!(self.log, "skipping service directory";
                               "directory" => %directory.display(),
                               "error" => %err);
            }
        }

        logging::info!(self.log, "service descriptors indexed";
                       "count" => self.descriptors.len());
    }

    fn scan_directory(&mut self, directory: &Path) -> io::Result<()> {
        for entry in fs::read_dir(directory)? {
            let path = entry?.path();

            let is_service_file = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(SERVICE_SUFFIX))
                .unwrap_or(false);
            if !is_service_file {
                continue;
            }

            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(err) => {
                    logging::warn!(self.log, "unreadable service file";
                                   "path" => %path.display(),
                                   "error" => %err);
                    continue;
                }
            };

            match parse_descriptor(&contents, &path) {
                Ok(descriptor) => {
                    if self.descriptors.contains_key(&descriptor.name) {
                        logging::warn!(self.log, "duplicate service name, first file wins";
                                       "name" => &descriptor.name,
                                       "path" => %path.display());
                        continue;
                    }

                    logging::debug!(self.log, "service descriptor loaded";
                                    "name" => &descriptor.name,
                                    "exec" => %descriptor.exec.join(" "));
                    self.descriptors.insert(descriptor.name.clone(), descriptor);
                }
                Err(err) => {
                    logging::warn!(self.log, "malformed service file";
                                   "path" => %path.display(),
                                   "error" => %err);
                }
            }
        }

        Ok(())
    }

    /// Swap the directory list and timeout on config reload, then rescan.
    pub fn reconfigure(&mut self, directories: &[String], timeout: Duration) {
        self.directories = directories.iter().map(PathBuf::from).collect();
        self.timeout = timeout;
        self.rescan();
    }

    #[inline]
    pub fn descriptor(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.descriptors.get(name)
    }

    #[inline]
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    #[inline]
    pub fn has_pending(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }

    /// StartServiceByName entry point. `already_owned` is the registry's
    /// verdict on the name (the registry itself is not needed here).
    ///
    /// Exactly one child is spawned per pending record no matter how many
    /// requesters pile in; every waiter is answered when the name appears
    /// (`on_service_created`) or when the activation times out.
    pub fn activate(
        &mut self,
        name: &str,
        requester: ConnId,
        request: &Message,
        already_owned: bool,
        conns: &mut Connections,
        txn: &mut Transaction,
        mem: &mut MemGuard,
        main_loop: &mut MainLoop,
    ) -> BusResult<()> {
        if already_owned {
            if request.wants_reply() {
                let reply = Message::method_return_to(request)
                    .with_arg(Arg::U32(ACTIVATION_REPLY_ALREADY_ACTIVE));
                conns.stage_message(txn, mem, requester, reply)?;
            }
            return Ok(());
        }

        let exec = match self.descriptors.get(name) {
            Some(descriptor) => descriptor.exec.clone(),
            None => {
                return Err(BusError::new(
                    ErrorKind::ServiceNotFound,
                    format!("service \"{}\" is not known to the bus", name),
                ));
            }
        };

        mem.check()?;

        if let Some(pending) = self.pending.get_mut(name) {
            pending.waiters.push(Waiter {
                requester,
                request: request.clone(),
            });

            logging::debug!(self.log, "activation coalesced";
                            "name" => name,
                            "requester" => requester,
                            "waiters" => pending.waiters.len());

            return Ok(());
        }

        // New pending record: this requester triggers the actual spawn.
        self.spawn_provider(name, &exec)?;

        let timeout = main_loop.add_timeout(
            TimeoutKind::ActivationExpired(name.to_string()),
            self.timeout,
            Instant::now(),
        );

        self.pending.insert(
            name.to_string(),
            PendingActivation {
                waiters: vec![Waiter {
                    requester,
                    request: request.clone(),
                }],
                timeout,
            },
        );

        logging::info!(self.log, "activation started";
                       "name" => name,
                       "requester" => requester);

        Ok(())
    }

    fn spawn_provider(&self, name: &str, exec: &[String]) -> BusResult<()> {
        let child = Command::new(&exec[0])
            .args(&exec[1..])
            .env(ENV_BUS_ADDRESS, &self.bus_address)
            .env(ENV_BUS_TYPE, &self.bus_type)
            .spawn();

        match child {
            Ok(child) => {
                logging::info!(self.log, "provider spawned";
                               "name" => name,
                               "pid" => child.id());
                Ok(())
            }
            Err(err) => {
                logging::warn!(self.log, "provider spawn failed";
                               "name" => name,
                               "exec" => %exec.join(" "),
                               "error" => %err);

                let kind = match err.kind() {
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                        ErrorKind::SpawnExecFailed
                    }
                    _ => ErrorKind::SpawnFailed,
                };

                Err(BusError::new(
                    kind,
                    format!("failed to execute \"{}\": {}", exec[0], err),
                ))
            }
        }
    }

    /// Registry hook: a previously-absent `name` appeared. Answers every
    /// live waiter of a pending record atomically through `txn`; waiters
    /// whose connections disconnected in the meantime are skipped.
    pub fn on_service_created(
        &mut self,
        name: &str,
        conns: &mut Connections,
        txn: &mut Transaction,
        mem: &mut MemGuard,
        main_loop: &mut MainLoop,
    ) -> BusResult<()> {
        let pending = match self.pending.remove(name) {
            Some(pending) => pending,
            None => return Ok(()),
        };

        main_loop.cancel_timeout(pending.timeout);

        logging::info!(self.log, "activation completed";
                       "name" => name,
                       "waiters" => pending.waiters.len());

        for waiter in &pending.waiters {
            if conns.is_disconnected(waiter.requester) {
                continue;
            }

            if waiter.request.wants_reply() {
                let reply = Message::method_return_to(&waiter.request)
                    .with_arg(Arg::U32(ACTIVATION_REPLY_ACTIVATED));
                conns.stage_message(txn, mem, waiter.requester, reply)?;
            }
        }

        Ok(())
    }

    /// Timeout hook: the provider never claimed `name`. Every live waiter
    /// is failed with a spawn error.
    pub fn on_timeout(
        &mut self,
        name: &str,
        conns: &mut Connections,
        txn: &mut Transaction,
        mem: &mut MemGuard,
    ) -> BusResult<()> {
        let pending = match self.pending.remove(name) {
            Some(pending) => pending,
            None => return Ok(()),
        };

        logging::warn!(self.log, "activation timed out";
                       "name" => name,
                       "waiters" => pending.waiters.len());

        for waiter in &pending.waiters {
            if conns.is_disconnected(waiter.requester) {
                continue;
            }

            let reply = Message::error_reply_to(
                &waiter.request,
                ErrorKind::SpawnFailed,
                &format!("activation of \"{}\" timed out", name),
            );
            conns.stage_message(txn, mem, waiter.requester, reply)?;
        }

        Ok(())
    }

    /// Drop a disconnected connection's waiters. The pending record
    /// survives: other requesters may still be waiting and the child is
    /// already running.
    pub fn owner_disconnected(&mut self, conn: ConnId) {
        for pending in self.pending.values_mut() {
            pending.waiters.retain(|waiter| waiter.requester != conn);
        }
    }
}

/// Parse one descriptor file: `[Bus Service]` section with `Name` and
/// `Exec` keys. Unknown sections and keys are ignored; both keys are
/// required; `Exec` splits on whitespace into argv.
fn parse_descriptor(contents: &str, origin: &Path) -> Result<ServiceDescriptor, String> {
    let mut in_section = false;
    let mut name: Option<String> = None;
    let mut exec: Option<String> = None;

    for line in contents.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') {
            in_section = line == format!("[{}]", SERVICE_SECTION);
            continue;
        }

        if !in_section {
            continue;
        }

        let eq = match line.find('=') {
            Some(eq) => eq,
            None => return Err(format!("line \"{}\" is not key=value", line)),
        };

        let key = line[..eq].trim();
        let value = line[eq + 1..].trim();

        match key {
            KEY_NAME => name = Some(value.to_string()),
            KEY_EXEC => exec = Some(value.to_string()),
            _ => (),
        }
    }

    let name = name.ok_or_else(|| format!("no \"{}\" key", KEY_NAME))?;
    let exec = exec.ok_or_else(|| format!("no \"{}\" key", KEY_EXEC))?;

    let argv: Vec<String> = exec.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(format!("empty \"{}\" value", KEY_EXEC));
    }

    Ok(ServiceDescriptor {
        name,
        exec: argv,
        origin: origin.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_service(dir: &Path, file: &str, body: &str) {
        let mut handle = fs::File::create(dir.join(file)).unwrap();
        write!(handle, "{}", body).unwrap();
    }

    #[test]
    fn test_parse_descriptor() {
        let descriptor = parse_descriptor(
            "# provider for the echo service\n\
             [Bus Service]\n\
             Name = org.example.EchoService\n\
             Exec = /usr/bin/echo-service --fast\n\
             Nickname = ignored\n",
            Path::new("echo.service"),
        )
        .unwrap();

        assert_eq!(descriptor.name, "org.example.EchoService");
        assert_eq!(descriptor.exec, vec!["/usr/bin/echo-service", "--fast"]);
    }

    #[test]
    fn test_parse_descriptor_requires_both_keys() {
        let err = parse_descriptor("[Bus Service]\nName = a\n", Path::new("x")).unwrap_err();
        assert!(err.contains("Exec"));

        let err = parse_descriptor("[Bus Service]\nExec = /bin/true\n", Path::new("x")).unwrap_err();
        assert!(err.contains("Name"));
    }

    #[test]
    fn test_parse_descriptor_ignores_other_sections() {
        let err = parse_descriptor(
            "[Other Section]\nName = a\nExec = /bin/true\n",
            Path::new("x"),
        )
        .unwrap_err();
        assert!(err.contains("Name"));
    }

    #[test]
    fn test_scan_skips_broken_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        write_service(
            dir.path(),
            "good.service",
            "[Bus Service]\nName = org.example.Good\nExec = /bin/true\n",
        );
        write_service(dir.path(), "broken.service", "[Bus Service]\nName = org.example.Bad\n");
        write_service(dir.path(), "notes.txt", "not a descriptor at all");

        let activation = Activation::new(
            &[dir.path().to_string_lossy().to_string()],
            "127.0.0.1:0",
            "session",
            Duration::from_secs(25),
            None,
        );

        assert_eq!(activation.descriptor_count(), 1);
        assert!(activation.descriptor("org.example.Good").is_some());
        assert!(activation.descriptor("org.example.Bad").is_none());
    }

    #[test]
    fn test_scan_duplicate_name_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        write_service(
            dir.path(),
            "one.service",
            "[Bus Service]\nName = org.example.Dup\nExec = /bin/one\n",
        );
        write_service(
            dir.path(),
            "two.service",
            "[Bus Service]\nName = org.example.Dup\nExec = /bin/two\n",
        );

        let activation = Activation::new(
            &[dir.path().to_string_lossy().to_string()],
            "127.0.0.1:0",
            "session",
            Duration::from_secs(25),
            None,
        );

        // Which file wins is unspecified, but exactly one must.
        assert_eq!(activation.descriptor_count(), 1);
        let descriptor = activation.descriptor("org.example.Dup").unwrap();
        assert!(descriptor.exec[0] == "/bin/one" || descriptor.exec[0] == "/bin/two");
    }
}
