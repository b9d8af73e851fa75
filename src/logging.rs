//! The `log` backend for this daemon.
//!
//! Before a worker has finished its own setup (`early`), log lines go to
//! stderr -- there is no syslog connection yet and nothing should be
//! silently swallowed during config parsing or shared-memory setup. Once
//! a worker calls [`enter_daemon_mode`], logging switches to `syslog(3)`
//! via raw libc calls, exactly as a privilege-separated worker with no
//! async runtime and no network logging sink should: no subscriber
//! machinery, just `openlog`/`syslog`/`closelog`.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

static EARLY: AtomicBool = AtomicBool::new(true);

struct DaemonLogger {
    ident: CString,
}

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if EARLY.load(Ordering::SeqCst) {
            eprintln!("{}: {}", record.level(), record.args());
            return;
        }

        let priority = match record.level() {
            Level::Error => libc::LOG_ERR,
            Level::Warn => libc::LOG_WARNING,
            Level::Info => libc::LOG_NOTICE,
            Level::Debug | Level::Trace => libc::LOG_DEBUG,
        };

        if let Ok(msg) = CString::new(format!("{}", record.args())) {
            unsafe {
                libc::syslog(priority, msg.as_ptr());
            }
        }
    }

    fn flush(&self) {}
}

/// Install the logger. Call once at process start, before forking
/// workers, so every child inherits the same `log` facade wiring.
pub fn init(ident: &str) {
    let logger = Box::new(DaemonLogger {
        ident: CString::new(ident).expect("process identity must not contain NUL"),
    });

    unsafe {
        libc::openlog(
            logger.ident.as_ptr(),
            libc::LOG_NDELAY | libc::LOG_PID,
            libc::LOG_DAEMON,
        );
    }

    log::set_boxed_logger(logger)
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .expect("logger already installed");
}

/// Called once startup (config load, shared memory setup, forking all
/// workers) has completed: from here on `log` calls go to syslog instead
/// of stderr.
pub fn enter_daemon_mode() {
    EARLY.store(false, Ordering::SeqCst);
}
