//! The tunnel daemon: parses configuration, allocates shared state,
//! forks the six worker processes, and supervises them. Ported from
//! `signsky.c`'s `main()`.

use esptun::proc::{ProcType, Supervisor};
use esptun::state::State;
use esptun::{config::Config, logging, signal, workers};

fn usage() -> ! {
    eprintln!("esptund [options]");
    eprintln!();
    eprintln!("options:");
    eprintln!("  -c <path>  The configuration file.");
    eprintln!("  -d         Daemonize the parent process.");
    std::process::exit(1);
}

struct Args {
    config: String,
    foreground: bool,
}

fn parse_args() -> Args {
    let mut config = None;
    let mut foreground = true;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" => config = args.next(),
            "-d" => foreground = false,
            _ => usage(),
        }
    }

    match config {
        Some(config) => Args { config, foreground },
        None => usage(),
    }
}

fn main() {
    let args = parse_args();

    logging::init("esptund");

    let cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
    };

    // Created once, here, before any fork: every child inherits this
    // exact mapping of every segment and narrows it down in its own
    // address space via `State::shed_for`. This `state` local stays
    // owned by the parent for the rest of `main` -- the parent keeps
    // every segment attached too (it only ever reads `counters`, but
    // detaching the rest buys nothing since each child already has its
    // own independent attachment).
    let mut state = match State::create() {
        Ok(state) => state,
        Err(err) => {
            log::error!("failed to set up shared state: {err}");
            std::process::exit(1);
        }
    };

    let peer_cell: &esptun::peer::PeerCell = esptun::state::require(&state.peer);
    peer_cell.set(cfg.peer);

    signal::trap(libc::SIGINT);
    signal::trap(libc::SIGHUP);
    signal::trap(libc::SIGCHLD);
    signal::trap(libc::SIGQUIT);

    let mut supervisor = Supervisor::new(cfg.runas.clone());
    let local = cfg.local;

    // The closure borrows `state` mutably rather than taking it by
    // value: each forked child calls it exactly once, in its own copy
    // of this process image, and narrows its own copy via `shed_for`
    // before handing it to the matching worker entry point.
    let result = unsafe {
        supervisor.start_all(&ProcType::ALL, |kind| {
            state.shed_for(kind);
            match kind {
                ProcType::Clear => workers::clear::entry(&mut state),
                ProcType::Crypto => workers::crypto::entry(&mut state, local),
                ProcType::Encrypt => workers::encrypt::entry(&mut state),
                ProcType::Decrypt => workers::decrypt::entry(&mut state),
                ProcType::Keying => workers::keying::entry(&mut state),
                ProcType::Status => workers::status::entry(&mut state),
            }
        })
    };

    if let Err(err) = result {
        log::error!("failed to start worker processes: {err}");
        std::process::exit(1);
    }

    if !args.foreground && unsafe { libc::daemon(1, 0) } == -1 {
        log::error!("daemon: {}", std::io::Error::last_os_error());
        std::process::exit(1);
    }

    logging::enter_daemon_mode();
    log::info!("esptund started");

    let counters: &esptun::counters::Counters = esptun::state::require(&state.counters);
    run_supervisor_loop(&mut supervisor, counters);
}

fn run_supervisor_loop(supervisor: &mut Supervisor, counters: &esptun::counters::Counters) {
    let mut running = true;
    while running {
        match signal::last_signal() {
            Some(sig) if sig == libc::SIGINT || sig == libc::SIGHUP || sig == libc::SIGQUIT => {
                log::info!("parent received signal {sig}");
                running = false;
                continue;
            }
            Some(sig) if sig == libc::SIGCHLD => {
                log::info!("a worker exited, shutting down");
                running = false;
                supervisor.reap();
                continue;
            }
            _ => {}
        }

        let uptime = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        counters
            .uptime
            .store(uptime, std::sync::atomic::Ordering::SeqCst);

        std::thread::sleep(std::time::Duration::from_secs(1));
    }

    supervisor.shutdown();
}
