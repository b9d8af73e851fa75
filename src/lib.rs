pub mod cipher;
pub mod config;
pub mod counters;
pub mod ctl;
pub mod error;
pub mod keyslot;
pub mod logging;
pub mod packet;
pub mod peer;
pub mod proc;
pub mod replay;
pub mod ring;
pub mod sa;
pub mod shm;
pub mod signal;
pub mod state;
pub mod tun;
pub mod wire;
pub mod workers;
