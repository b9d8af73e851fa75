//! Structured setup-time errors. Packet-path code never constructs these.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shmget failed for key {key:#x} size {size}: {source}")]
    Get {
        key: i32,
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("shmat failed for segment {id}: {source}")]
    Attach {
        id: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("shmctl(IPC_RMID) failed for segment {id}: {source}")]
    Remove {
        id: i32,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}:{line}: unknown option '{option}'")]
    UnknownOption {
        path: String,
        line: usize,
        option: String,
    },
    #[error("{path}:{line}: malformed line: {text}")]
    Malformed {
        path: String,
        line: usize,
        text: String,
    },
    #[error("{path}:{line}: invalid address '{addr}': {source}")]
    BadAddress {
        path: String,
        line: usize,
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("{path}: missing required option '{option}'")]
    Missing { path: String, option: &'static str },
    #[error("{path}: duplicate 'run' entry for process '{process}'")]
    DuplicateRun { path: String, process: String },
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket() failed: {0}")]
    Create(#[source] std::io::Error),
    #[error("bind() failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("fcntl() failed while setting non-blocking mode: {0}")]
    NonBlocking(#[source] std::io::Error),
    #[error("unlink({path}) failed: {source}")]
    Unlink {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("tun device setup failed: {0}")]
    TunDevice(#[source] std::io::Error),
    #[error("failed to drop privileges to uid={uid} gid={gid}: {source}")]
    DropPrivileges {
        uid: u32,
        gid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("fork() failed: {0}")]
    Fork(#[source] std::io::Error),
}
