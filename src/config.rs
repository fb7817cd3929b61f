//! The two startup configuration files.
//!
//! `Common.cfg` carries the swarm-wide tuning values and the target file;
//! `PeerInfo.cfg` is the static roster. Both are whitespace-separated text.
//! Any malformed line is fatal: a peer with a bad configuration must not
//! join the swarm.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("missing key {0}")]
    MissingKey(&'static str),

    #[error("unknown key {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("malformed peer line: {0}")]
    MalformedPeerLine(String),

    #[error("duplicate peer id {0}")]
    DuplicatePeerId(u32),

    #[error("peer id {0} is not in the roster")]
    UnknownLocalPeer(u32),

    #[error("{0}")]
    Invalid(String),
}

/// Swarm-wide settings from `Common.cfg`.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub preferred_neighbors: usize,
    pub unchoking_interval: Duration,
    pub optimistic_unchoking_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u64,
}

impl CommonConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut preferred_neighbors = None;
        let mut unchoking_interval = None;
        let mut optimistic_interval = None;
        let mut file_name = None;
        let mut file_size = None;
        let mut piece_size = None;

        for line in text.lines() {
            let mut parts = line.split_whitespace();
            let Some(key) = parts.next() else {
                continue;
            };
            let value = parts
                .next()
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: String::new(),
                })?
                .to_string();

            match key {
                "NumberOfPreferredNeighbors" => {
                    preferred_neighbors = Some(parse_num::<usize>(key, &value)?);
                }
                "UnchokingInterval" => {
                    unchoking_interval = Some(Duration::from_secs(parse_num(key, &value)?));
                }
                "OptimisticUnchokingInterval" => {
                    optimistic_interval = Some(Duration::from_secs(parse_num(key, &value)?));
                }
                "FileName" => file_name = Some(value),
                "FileSize" => file_size = Some(parse_num::<u64>(key, &value)?),
                "PieceSize" => piece_size = Some(parse_num::<u64>(key, &value)?),
                other => return Err(ConfigError::UnknownKey(other.to_string())),
            }
        }

        let config = Self {
            preferred_neighbors: preferred_neighbors
                .ok_or(ConfigError::MissingKey("NumberOfPreferredNeighbors"))?,
            unchoking_interval: unchoking_interval
                .ok_or(ConfigError::MissingKey("UnchokingInterval"))?,
            optimistic_unchoking_interval: optimistic_interval
                .ok_or(ConfigError::MissingKey("OptimisticUnchokingInterval"))?,
            file_name: file_name.ok_or(ConfigError::MissingKey("FileName"))?,
            file_size: file_size.ok_or(ConfigError::MissingKey("FileSize"))?,
            piece_size: piece_size.ok_or(ConfigError::MissingKey("PieceSize"))?,
        };

        if config.file_size == 0 || config.piece_size == 0 {
            return Err(ConfigError::Invalid(
                "FileSize and PieceSize must be positive".into(),
            ));
        }
        if config.preferred_neighbors == 0 {
            return Err(ConfigError::Invalid(
                "NumberOfPreferredNeighbors must be positive".into(),
            ));
        }

        Ok(config)
    }

    /// `ceil(FileSize / PieceSize)`.
    pub fn piece_count(&self) -> usize {
        self.file_size.div_ceil(self.piece_size) as usize
    }
}

/// One roster line from `PeerInfo.cfg`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

/// The ordered peer roster. Order is the dial order: a peer dials every
/// peer listed before it and accepts from the ones after.
#[derive(Debug, Clone)]
pub struct PeerRoster {
    peers: Vec<PeerInfo>,
}

impl PeerRoster {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut peers: Vec<PeerInfo> = Vec::new();

        for line in text.lines() {
            if line.split_whitespace().next().is_none() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(id), Some(host), Some(port), Some(has_file), None) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) else {
                return Err(ConfigError::MalformedPeerLine(line.to_string()));
            };

            let peer = PeerInfo {
                id: parse_num("peerId", id)?,
                host: host.to_string(),
                port: parse_num("port", port)?,
                has_file: match has_file {
                    "0" => false,
                    "1" => true,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            key: "hasFile".into(),
                            value: other.to_string(),
                        })
                    }
                },
            };

            if peers.iter().any(|p| p.id == peer.id) {
                return Err(ConfigError::DuplicatePeerId(peer.id));
            }
            peers.push(peer);
        }

        if peers.is_empty() {
            return Err(ConfigError::Invalid("empty peer roster".into()));
        }

        Ok(Self { peers })
    }

    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    pub fn get(&self, id: u32) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    /// The local peer's own roster entry.
    pub fn local(&self, id: u32) -> Result<&PeerInfo, ConfigError> {
        self.get(id).ok_or(ConfigError::UnknownLocalPeer(id))
    }

    /// Peers listed before `id`, in order: the ones we dial.
    pub fn dial_targets(&self, id: u32) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter().take_while(move |p| p.id != id)
    }

    /// Every peer other than `id`.
    pub fn remotes(&self, id: u32) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter().filter(move |p| p.id != id)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
