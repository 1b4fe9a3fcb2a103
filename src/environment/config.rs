//! Configuration of a process group
//!
//! A launcher describes the world to every process through environment variables:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `SPMD_RANK` | world rank of this process | required when `SPMD_PEERS` is set |
//! | `SPMD_PEERS` | comma-separated `host:port` list, one entry per rank | unset: a world of one |
//! | `SPMD_COLLECTIVES` | `tree` or `linear` | `tree` |
//! | `SPMD_CONNECT_TIMEOUT_MS` | how long to retry connecting to a peer | `30000` |
//! | `SPMD_POLL_INTERVAL_US` | how long blocking calls wait for the fabric per poll | `1000` |

use std::env;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::collective::{BinomialTree, CollectiveAlgorithms, Linear};
use crate::error::{Error, Result};

const RANK: &str = "SPMD_RANK";
const PEERS: &str = "SPMD_PEERS";
const COLLECTIVES: &str = "SPMD_COLLECTIVES";
const CONNECT_TIMEOUT_MS: &str = "SPMD_CONNECT_TIMEOUT_MS";
const POLL_INTERVAL_US: &str = "SPMD_POLL_INTERVAL_US";

/// Which set of collective algorithms a world uses
///
/// Derived communicators inherit the choice of their parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Collectives {
    /// Root-centric loops, see `collective::Linear`
    Linear,
    /// Logarithmic-depth trees, see `collective::BinomialTree`
    #[default]
    BinomialTree,
}

impl Collectives {
    pub(crate) fn algorithms(self) -> Arc<dyn CollectiveAlgorithms> {
        match self {
            Collectives::Linear => Arc::new(Linear),
            Collectives::BinomialTree => Arc::new(BinomialTree),
        }
    }
}

impl FromStr for Collectives {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Collectives::Linear),
            "tree" | "binomial" => Ok(Collectives::BinomialTree),
            other => Err(Error::Config(format!(
                "{}: unknown collective algorithms '{}', expected 'tree' or 'linear'",
                COLLECTIVES, other
            ))),
        }
    }
}

impl fmt::Display for Collectives {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collectives::Linear => write!(f, "linear"),
            Collectives::BinomialTree => write!(f, "tree"),
        }
    }
}

/// Everything needed to join a world
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// World rank of this process
    pub rank: usize,
    /// Listening address of every rank, in rank order. Empty for a world of one process that
    /// needs no network.
    pub peers: Vec<SocketAddr>,
    /// Collective algorithms of the world
    pub collectives: Collectives,
    /// How long to keep retrying a connection to a peer that is not listening yet
    pub connect_timeout: Duration,
    /// How long a blocking call waits on the fabric before checking for an abort
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rank: 0,
            peers: Vec::new(),
            collectives: Collectives::default(),
            connect_timeout: Duration::from_millis(30_000),
            poll_interval: Duration::from_micros(1_000),
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Config> {
        Config::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from `lookup`, which maps variable names to values.
    fn from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(collectives) = lookup(COLLECTIVES) {
            config.collectives = collectives.parse()?;
        }
        if let Some(ms) = lookup(CONNECT_TIMEOUT_MS) {
            config.connect_timeout = Duration::from_millis(parse_number(CONNECT_TIMEOUT_MS, &ms)?);
        }
        if let Some(us) = lookup(POLL_INTERVAL_US) {
            config.poll_interval = Duration::from_micros(parse_number(POLL_INTERVAL_US, &us)?);
        }
        let rank = lookup(RANK)
            .map(|rank| parse_number(RANK, &rank))
            .transpose()?;
        match lookup(PEERS) {
            Some(peers) => {
                config.peers = parse_peers(&peers)?;
                config.rank = rank.ok_or_else(|| {
                    Error::Config(format!("{} is set but {} is missing", PEERS, RANK))
                })? as usize;
                if config.rank >= config.peers.len() {
                    return Err(Error::Config(format!(
                        "{}={} is outside of a world of {} peers",
                        RANK,
                        config.rank,
                        config.peers.len()
                    )));
                }
            }
            None => {
                if rank.map_or(false, |rank| rank != 0) {
                    return Err(Error::Config(format!(
                        "{} is set without {}",
                        RANK, PEERS
                    )));
                }
            }
        }
        Ok(config)
    }

    /// Number of processes in the world
    pub fn size(&self) -> usize {
        self.peers.len().max(1)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{}='{}': {}", key, value, e)))
}

fn parse_peers(value: &str) -> Result<Vec<SocketAddr>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|peer| !peer.is_empty())
        .map(|peer| {
            peer.to_socket_addrs()
                .map_err(|e| Error::Config(format!("{}: cannot resolve '{}': {}", PEERS, peer, e)))?
                .next()
                .ok_or_else(|| {
                    Error::Config(format!("{}: '{}' resolves to no address", PEERS, peer))
                })
        })
        .collect::<Result<Vec<_>>>()
        .and_then(|peers| {
            if peers.is_empty() {
                Err(Error::Config(format!("{} lists no peers", PEERS)))
            } else {
                Ok(peers)
            }
        })
}
