//! The busbar daemon launcher: CLI parsing, config selection, logging,
//! signal wiring and the fork/print plumbing around `manifold::bus::Bus`.

use clap::{App, Arg};
use manifold::bus::{Bus, SIGNAL_BYTE_QUIT, SIGNAL_BYTE_RELOAD};
use manifold::config::BusConfig;
use manifold::logging;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};

const DEFAULT_SESSION_CONFIG: &str = "/etc/busbar/session.toml";
const DEFAULT_SYSTEM_CONFIG: &str = "/etc/busbar/system.toml";

// Write end of the self-pipe, for the signal handlers. Signal handlers can
// do nothing but poke a byte into the pipe; the loop does the actual work.
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(signum: libc::c_int) {
    let byte = match signum {
        libc::SIGTERM | libc::SIGINT => SIGNAL_BYTE_QUIT,
        libc::SIGHUP => SIGNAL_BYTE_RELOAD,
        _ => return,
    };

    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Create the non-blocking self-pipe and route SIGTERM/SIGINT/SIGHUP into
/// its write end. Returns the read end for the bus loop.
fn install_signal_pipe() -> File {
    unsafe {
        let mut fds = [0 as libc::c_int; 2];
        if libc::pipe(fds.as_mut_ptr()) != 0 {
            panic!("Error creating signal pipe");
        }

        for &fd in &fds {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                panic!("Error configuring signal pipe");
            }
        }

        SIGNAL_WRITE_FD.store(fds[1], Ordering::Relaxed);

        let handler = handle_signal as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);

        File::from_raw_fd(fds[0])
    }
}

/// Pick the config file from the CLI selection. `--config` beats the
/// `--session`/`--system` built-in paths; with nothing given the daemon
/// runs on compiled-in defaults.
fn config_path(explicit: Option<&str>, system: bool, session: bool) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }
    if system {
        return Some(PathBuf::from(DEFAULT_SYSTEM_CONFIG));
    }
    if session {
        return Some(PathBuf::from(DEFAULT_SESSION_CONFIG));
    }
    None
}

fn main() {
    let matches = App::new("Busbar Daemon")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the busbar message bus daemon.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .long("config")
                .takes_value(true)
                .help("Path to the bus config file"),
        )
        .arg(
            Arg::with_name("session")
                .long("session")
                .conflicts_with("system")
                .help("Use the default session bus configuration"),
        )
        .arg(
            Arg::with_name("system")
                .long("system")
                .help("Use the default system bus configuration"),
        )
        .arg(
            Arg::with_name("print-address")
                .long("print-address")
                .help("Print the bound listen address on stdout"),
        )
        .arg(
            Arg::with_name("print-pid")
                .long("print-pid")
                .help("Print the daemon pid on stdout"),
        )
        .arg(
            Arg::with_name("PID_FILE")
                .long("pid-file")
                .takes_value(true)
                .help("Write the daemon pid to this file"),
        )
        .arg(
            Arg::with_name("fork")
                .long("fork")
                .help("Fork into the background once the address is bound"),
        )
        .get_matches();

    let path = config_path(
        matches.value_of("CONFIG_FILE"),
        matches.is_present("system"),
        matches.is_present("session"),
    );

    let config = match path.as_ref() {
        Some(path) => BusConfig::load(path).expect("Error loading config file"),
        None => BusConfig::default(),
    };

    let logger = logging::init(&config.bus.log_level);
    logging::info!(logger, "starting bus daemon";
                   "config" => path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<defaults>".to_string()));

    let mut bus = Bus::new(config, path, logger.clone()).expect("Error starting bus");

    let pipe = install_signal_pipe();
    bus.set_signal_pipe(pipe).expect("Error wiring signal pipe");

    let address = bus.local_address().expect("Bus must have a listen address");

    if matches.is_present("fork") {
        // The address is bound, so clients launched right after the parent
        // exits can already connect.
        match unsafe { libc::fork() } {
            -1 => panic!("Error forking daemon"),
            0 => (),
            _parent => process::exit(0),
        }
    }

    if matches.is_present("print-address") {
        println!("{}", address);
    }
    if matches.is_present("print-pid") {
        println!("{}", process::id());
    }
    if let Some(pid_file) = matches.value_of("PID_FILE") {
        let mut file = fs::File::create(pid_file).expect("Error creating pid file");
        writeln!(file, "{}", process::id()).expect("Error writing pid file");
    }

    bus.run().expect("Bus loop failed");
}
