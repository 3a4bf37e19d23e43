//! Configuration loading (ambient stack, §4.6/§6): `config.json` is an ordered array of
//! supervisor entries tagged by `type`, validated before any dispatcher binds a socket.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProcessEntry {
    Ondemand(OndemandEntry),
    Pausable(PausableEntry),
}

#[derive(Debug, Deserialize)]
pub struct PausableEntry {
    pub name: String,
    pub cmdline: String,
    pub workdir: String,
}

#[derive(Debug, Deserialize)]
pub struct OndemandEntry {
    pub name: String,
    pub cmdline: String,
    pub workdir: String,
    pub port: u16,
    pub path: String,
    pub endpoint: String,
    /// Idle-lease duration in minutes.
    pub timeout: u64,
    #[serde(default)]
    pub conflicts_with: Vec<String>,
    #[serde(default)]
    pub body_regex: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate supervisor name `{0}`")]
    DuplicateName(String),
    #[error("`{entry}` conflicts_with unknown on-demand peer `{peer}`")]
    UnknownConflict { entry: String, peer: String },
    #[error("port {port} has more than one entry without `body_regex` (main)")]
    AmbiguousMain { port: u16 },
    #[error("invalid `body_regex` on `{entry}`: {source}")]
    InvalidRegex {
        entry: String,
        #[source]
        source: regex::Error,
    },
    #[error("empty `cmdline` on `{0}`")]
    EmptyCmdline(String),
}

/// One dispatcher's worth of configuration: every entry sharing a `port`, with the first
/// occurrence's `path` seeding the dispatcher as spec'd in §6.
pub struct DispatcherConfig {
    pub port: u16,
    pub path: String,
    pub backends: Vec<OndemandEntry>,
}

pub struct LoadedConfig {
    pub pausable: Vec<PausableEntry>,
    pub dispatchers: Vec<DispatcherConfig>,
}

pub fn load(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let entries: Vec<ProcessEntry> = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    validate(entries)
}

fn validate(entries: Vec<ProcessEntry>) -> Result<LoadedConfig, ConfigError> {
    let mut names: HashSet<String> = HashSet::new();
    let mut pausable = Vec::new();
    let mut by_port: HashMap<u16, DispatcherConfig> = HashMap::new();
    let mut port_order: Vec<u16> = Vec::new();
    let mut ondemand_names: HashSet<String> = HashSet::new();

    for entry in &entries {
        let name = match entry {
            ProcessEntry::Ondemand(e) => &e.name,
            ProcessEntry::Pausable(e) => &e.name,
        };
        if !names.insert(name.clone()) {
            return Err(ConfigError::DuplicateName(name.clone()));
        }
        if let ProcessEntry::Ondemand(e) = entry {
            ondemand_names.insert(e.name.clone());
        }
    }

    for entry in entries {
        match entry {
            ProcessEntry::Pausable(e) => {
                if split_cmdline(&e.cmdline).is_empty() {
                    return Err(ConfigError::EmptyCmdline(e.name));
                }
                pausable.push(e);
            }
            ProcessEntry::Ondemand(e) => {
                if split_cmdline(&e.cmdline).is_empty() {
                    return Err(ConfigError::EmptyCmdline(e.name));
                }
                if let Some(pattern) = &e.body_regex {
                    if let Err(source) = Regex::new(pattern) {
                        return Err(ConfigError::InvalidRegex {
                            entry: e.name.clone(),
                            source,
                        });
                    }
                }
                for peer in &e.conflicts_with {
                    if !ondemand_names.contains(peer) {
                        return Err(ConfigError::UnknownConflict {
                            entry: e.name.clone(),
                            peer: peer.clone(),
                        });
                    }
                }

                let is_main = e.body_regex.is_none();
                match by_port.get_mut(&e.port) {
                    Some(dispatcher) => {
                        if is_main && dispatcher.backends.iter().any(|b| b.body_regex.is_none()) {
                            return Err(ConfigError::AmbiguousMain { port: e.port });
                        }
                        dispatcher.backends.push(e);
                    }
                    None => {
                        port_order.push(e.port);
                        by_port.insert(
                            e.port,
                            DispatcherConfig {
                                port: e.port,
                                path: e.path.clone(),
                                backends: vec![e],
                            },
                        );
                    }
                }
            }
        }
    }

    let dispatchers = port_order
        .into_iter()
        .map(|port| by_port.remove(&port).expect("port was just inserted"))
        .collect();

    Ok(LoadedConfig { pausable, dispatchers })
}

/// Splits a space-separated argv string, per §6 (`cmdline`: space-separated argv; split on
/// single spaces).
pub fn split_cmdline(cmdline: &str) -> Vec<String> {
    cmdline.split(' ').filter(|s| !s.is_empty()).map(str::to_owned).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_names() {
        let json = r#"[
            {"type":"pausable","name":"p","cmdline":"sleep 1","workdir":"."},
            {"type":"pausable","name":"p","cmdline":"sleep 2","workdir":"."}
        ]"#;
        let entries: Vec<ProcessEntry> = serde_json::from_str(json).unwrap();
        assert!(matches!(validate(entries), Err(ConfigError::DuplicateName(_))));
    }

    #[test]
    fn rejects_dangling_conflict() {
        let json = r#"[
            {"type":"ondemand","name":"a","cmdline":"sleep 1","workdir":".","port":9000,"path":"/","endpoint":"http://x","timeout":1,"conflicts_with":["ghost"]}
        ]"#;
        let entries: Vec<ProcessEntry> = serde_json::from_str(json).unwrap();
        assert!(matches!(validate(entries), Err(ConfigError::UnknownConflict { .. })));
    }

    #[test]
    fn rejects_two_mains_on_same_port() {
        let json = r#"[
            {"type":"ondemand","name":"a","cmdline":"sleep 1","workdir":".","port":9000,"path":"/","endpoint":"http://x","timeout":1},
            {"type":"ondemand","name":"b","cmdline":"sleep 1","workdir":".","port":9000,"path":"/","endpoint":"http://x","timeout":1}
        ]"#;
        let entries: Vec<ProcessEntry> = serde_json::from_str(json).unwrap();
        assert!(matches!(validate(entries), Err(ConfigError::AmbiguousMain { .. })));
    }

    #[test]
    fn groups_same_port_entries_into_one_dispatcher() {
        let json = r#"[
            {"type":"ondemand","name":"a","cmdline":"sleep 1","workdir":".","port":9000,"path":"/v1","endpoint":"http://a","timeout":1},
            {"type":"ondemand","name":"b","cmdline":"sleep 1","workdir":".","port":9000,"path":"/ignored","endpoint":"http://b","timeout":1,"body_regex":"^query:"}
        ]"#;
        let entries: Vec<ProcessEntry> = serde_json::from_str(json).unwrap();
        let loaded = validate(entries).unwrap();
        assert_eq!(loaded.dispatchers.len(), 1);
        let d = &loaded.dispatchers[0];
        assert_eq!(d.path, "/v1"); // first occurrence wins
        assert_eq!(d.backends.len(), 2);
    }

    #[test]
    fn splits_cmdline_on_single_spaces() {
        assert_eq!(split_cmdline("bin --flag value"), vec!["bin", "--flag", "value"]);
    }
}
