//! Line-based configuration file parser.
//!
//! Three keywords, one per line: `peer <ip:port>`, `local <ip:port>`, and
//! `run <process> as <user>`. Blank lines and lines starting with `#`
//! (after leading whitespace is stripped) are ignored. There is
//! deliberately no nesting, no includes, and no quoting -- matching the
//! `config_read_line`/`signsky_config_load` keyword table this is
//! ported from.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddrV4;

use crate::error::ConfigError;
use crate::proc::ProcType;

#[derive(Debug, Clone)]
pub struct Config {
    pub peer: SocketAddrV4,
    pub local: SocketAddrV4,
    pub runas: HashMap<ProcType, String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;

        let mut peer = None;
        let mut local = None;
        let mut runas = HashMap::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim_start();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some(sep) = trimmed.find(' ') else {
                return Err(ConfigError::Malformed {
                    path: path.to_string(),
                    line,
                    text: trimmed.to_string(),
                });
            };

            let option = &trimmed[..sep];
            let value = trimmed[sep + 1..].trim();

            match option {
                "peer" => peer = Some(parse_host(path, line, value)?),
                "local" => local = Some(parse_host(path, line, value)?),
                "run" => parse_runas(path, line, value, &mut runas)?,
                other => {
                    return Err(ConfigError::UnknownOption {
                        path: path.to_string(),
                        line,
                        option: other.to_string(),
                    })
                }
            }
        }

        Ok(Config {
            peer: peer.ok_or(ConfigError::Missing {
                path: path.to_string(),
                option: "peer",
            })?,
            local: local.ok_or(ConfigError::Missing {
                path: path.to_string(),
                option: "local",
            })?,
            runas,
        })
    }
}

fn parse_host(path: &str, line: usize, value: &str) -> Result<SocketAddrV4, ConfigError> {
    value.parse().map_err(|source| ConfigError::BadAddress {
        path: path.to_string(),
        line,
        addr: value.to_string(),
        source,
    })
}

/// Parses `<process> as <user>`, same shape as the original's
/// `sscanf(runas, "%15s as %31s", proc, user)`.
fn parse_runas(
    path: &str,
    line: usize,
    value: &str,
    runas: &mut HashMap<ProcType, String>,
) -> Result<(), ConfigError> {
    let mut parts = value.splitn(3, ' ');
    let (Some(proc_name), Some("as"), Some(user)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ConfigError::Malformed {
            path: path.to_string(),
            line,
            text: format!("run {value}"),
        });
    };

    let kind = ProcType::from_name(proc_name).ok_or_else(|| ConfigError::Malformed {
        path: path.to_string(),
        line,
        text: format!("unknown process '{proc_name}'"),
    })?;

    if runas.insert(kind, user.to_string()).is_some() {
        return Err(ConfigError::DuplicateRun {
            path: path.to_string(),
            process: proc_name.to_string(),
        });
    }

    Ok(())
}
