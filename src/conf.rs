//! This module defines types used to configure a peer and the parsers for the
//! two plain-text files every peer reads at startup: the shared `Common.cfg`
//! and the `PeerInfo.cfg` roster.
//!
//! Both files are line oriented: blank lines and lines whose first
//! non-whitespace character is `#` are skipped. `Common.cfg` holds one
//! whitespace-delimited key-value pair per line, where the value is everything
//! after the first run of whitespace (so file names may contain spaces).
//! `PeerInfo.cfg` holds one `peer_id host port has_file` entry per line.

use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use crate::{error::*, PeerId};

/// The name of the configuration file shared by all peers of a swarm.
pub const COMMON_CONF_FILE: &str = "Common.cfg";

/// The name of the peer roster file.
pub const PEER_CONF_FILE: &str = "PeerInfo.cfg";

/// The full startup configuration of a peer: the shared parameters and the
/// static roster of all swarm members.
#[derive(Clone, Debug)]
pub struct Conf {
    pub common: CommonConf,
    /// All peers of the swarm keyed (and thus ordered) by id, the running
    /// peer included.
    pub peers: BTreeMap<PeerId, PeerConf>,
}

impl Conf {
    /// Reads and parses both configuration files from the given directory.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let common = CommonConf::parse(&read_conf_file(dir, COMMON_CONF_FILE)?)?;
        let peers = parse_peers(&read_conf_file(dir, PEER_CONF_FILE)?)?;
        Ok(Self { common, peers })
    }

    /// Returns the roster entry of the given peer, or a configuration error
    /// if the id is not part of the swarm.
    pub fn peer(&self, id: PeerId) -> Result<&PeerConf> {
        self.peers
            .get(&id)
            .ok_or_else(|| Error::Config(format!("peer id {} not found in {}", id, PEER_CONF_FILE)))
    }

    /// Returns the peers the given peer has to dial at startup: all peers
    /// with a strictly lower id, in ascending id order. Higher-id peers dial
    /// us instead.
    pub fn dial_targets(&self, id: PeerId) -> Vec<&PeerConf> {
        // BTreeMap iteration is already ascending by id
        self.peers.values().filter(|p| p.id < id).collect()
    }
}

/// The parameters shared by every peer of the swarm, from `Common.cfg`.
#[derive(Clone, Debug)]
pub struct CommonConf {
    /// How many neighbors a peer deliberately unchokes each unchoking
    /// interval (the `k` of the protocol).
    pub preferred_count: usize,
    /// The period of the preferred-neighbor recomputation.
    pub unchoking_interval: Duration,
    /// The period of the optimistic-unchoke rotation.
    pub optimistic_interval: Duration,
    /// The name of the distributed file. May contain spaces.
    pub file_name: String,
    /// The length of the distributed file, in bytes.
    pub file_len: u64,
    /// The nominal length of a piece. The last piece may be shorter.
    pub piece_len: u32,
}

impl CommonConf {
    /// Parses the contents of a `Common.cfg` file.
    pub fn parse(input: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (line_no, line) in conf_lines(input) {
            // split the key off at the first whitespace; the rest is the
            // value verbatim, as file names may contain spaces
            let key = line.split_whitespace().next().expect("line is not blank");
            let value = line[key.len()..].trim();
            if value.is_empty() {
                return Err(Error::Config(format!(
                    "{} line {}: expected 'key value'",
                    COMMON_CONF_FILE, line_no
                )));
            }
            entries.insert(key, value);
        }

        let preferred_count = parse_positive(&entries, "NumberOfPreferredNeighbors")? as usize;
        let unchoking_interval = Duration::from_secs(parse_positive(&entries, "UnchokingInterval")?);
        let optimistic_interval =
            Duration::from_secs(parse_positive(&entries, "OptimisticUnchokingInterval")?);
        let file_name = lookup(&entries, "FileName")?.to_string();
        let file_len = parse_positive(&entries, "FileSize")?;
        let piece_len = parse_positive(&entries, "PieceSize")?;
        if piece_len > u32::MAX as u64 {
            return Err(Error::Config("PieceSize does not fit in 32 bits".into()));
        }

        Ok(Self {
            preferred_count,
            unchoking_interval,
            optimistic_interval,
            file_name,
            file_len,
            piece_len: piece_len as u32,
        })
    }
}

/// One entry of the `PeerInfo.cfg` roster.
#[derive(Clone, Debug)]
pub struct PeerConf {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
    /// Whether the peer starts out owning the complete file.
    pub has_file: bool,
}

fn parse_peers(input: &str) -> Result<BTreeMap<PeerId, PeerConf>> {
    let mut peers = BTreeMap::new();
    for (line_no, line) in conf_lines(input) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(Error::Config(format!(
                "{} line {}: expected 'peer_id host port has_file', got {} fields",
                PEER_CONF_FILE,
                line_no,
                fields.len()
            )));
        }

        let id: PeerId = fields[0].parse().map_err(|_| {
            Error::Config(format!("{} line {}: invalid peer id", PEER_CONF_FILE, line_no))
        })?;
        if id == 0 {
            return Err(Error::Config(format!(
                "{} line {}: peer id must be positive",
                PEER_CONF_FILE, line_no
            )));
        }

        let port: u32 = fields[2].parse().map_err(|_| {
            Error::Config(format!("{} line {}: invalid port", PEER_CONF_FILE, line_no))
        })?;
        if port == 0 || port > u16::MAX as u32 {
            return Err(Error::Config(format!(
                "{} line {}: port {} out of range",
                PEER_CONF_FILE, line_no, port
            )));
        }

        let has_file = match fields[3] {
            "0" => false,
            "1" => true,
            other => {
                return Err(Error::Config(format!(
                    "{} line {}: has_file must be 0 or 1, got {:?}",
                    PEER_CONF_FILE, line_no, other
                )))
            }
        };

        let peer = PeerConf {
            id,
            host: fields[1].to_string(),
            port: port as u16,
            has_file,
        };
        if peers.insert(id, peer).is_some() {
            return Err(Error::Config(format!(
                "{} line {}: duplicate peer id {}",
                PEER_CONF_FILE, line_no, id
            )));
        }
    }

    if peers.is_empty() {
        return Err(Error::Config(format!("no peer entries in {}", PEER_CONF_FILE)));
    }

    Ok(peers)
}

/// Yields the payload-bearing lines of a configuration file along with their
/// 1-based line numbers, skipping blanks and `#` comments.
fn conf_lines(input: &str) -> impl Iterator<Item = (usize, &str)> {
    input
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn read_conf_file(dir: &Path, name: &str) -> Result<String> {
    fs::read_to_string(dir.join(name))
        .map_err(|e| Error::Config(format!("cannot read {}: {}", name, e)))
}

fn lookup<'a>(entries: &BTreeMap<&str, &'a str>, key: &str) -> Result<&'a str> {
    entries
        .get(key)
        .copied()
        .ok_or_else(|| Error::Config(format!("{} is missing key {}", COMMON_CONF_FILE, key)))
}

fn parse_positive(entries: &BTreeMap<&str, &str>, key: &str) -> Result<u64> {
    let value = lookup(entries, key)?;
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err(Error::Config(format!("{} must be positive", key))),
        Err(_) => Err(Error::Config(format!("{} is not a valid integer: {:?}", key, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMON: &str = "\
# shared swarm parameters
NumberOfPreferredNeighbors 2
UnchokingInterval 5
OptimisticUnchokingInterval 10

FileName the file.dat
FileSize 24301474
PieceSize 16384
";

    const PEERS: &str = "\
# id host port has_file
1001 lin114-00.cise.ufl.edu 6008 1
1002 lin114-01.cise.ufl.edu 6008 0
1003 lin114-02.cise.ufl.edu 6008 0
";

    #[test]
    fn test_parse_common() {
        let common = CommonConf::parse(COMMON).unwrap();
        assert_eq!(common.preferred_count, 2);
        assert_eq!(common.unchoking_interval, Duration::from_secs(5));
        assert_eq!(common.optimistic_interval, Duration::from_secs(10));
        // the value is everything after the first whitespace run
        assert_eq!(common.file_name, "the file.dat");
        assert_eq!(common.file_len, 24_301_474);
        assert_eq!(common.piece_len, 16_384);
    }

    #[test]
    fn test_parse_common_missing_key() {
        let input = COMMON.replace("PieceSize 16384\n", "");
        let err = CommonConf::parse(&input).unwrap_err();
        assert!(err.to_string().contains("PieceSize"));
    }

    #[test]
    fn test_parse_common_rejects_non_positive() {
        let input = COMMON.replace("UnchokingInterval 5", "UnchokingInterval 0");
        assert!(CommonConf::parse(&input).is_err());
        let input = COMMON.replace("FileSize 24301474", "FileSize banana");
        assert!(CommonConf::parse(&input).is_err());
    }

    #[test]
    fn test_parse_peers() {
        let peers = parse_peers(PEERS).unwrap();
        assert_eq!(peers.len(), 3);
        assert!(peers[&1001].has_file);
        assert!(!peers[&1002].has_file);
        assert_eq!(peers[&1003].host, "lin114-02.cise.ufl.edu");
        assert_eq!(peers[&1003].port, 6008);
    }

    #[test]
    fn test_parse_peers_rejects_duplicates_and_bad_fields() {
        let dup = format!("{}1002 otherhost 6009 0\n", PEERS);
        assert!(parse_peers(&dup).is_err());
        assert!(parse_peers("1001 host 0 1\n").is_err());
        assert!(parse_peers("1001 host 70000 1\n").is_err());
        assert!(parse_peers("1001 host 6008 2\n").is_err());
        assert!(parse_peers("0 host 6008 1\n").is_err());
        assert!(parse_peers("# only comments\n").is_err());
    }

    #[test]
    fn test_dial_targets() {
        let conf = Conf {
            common: CommonConf::parse(COMMON).unwrap(),
            peers: parse_peers(PEERS).unwrap(),
        };
        // a peer dials exactly the lower ids, in ascending order
        let targets: Vec<PeerId> = conf.dial_targets(1003).iter().map(|p| p.id).collect();
        assert_eq!(targets, vec![1001, 1002]);
        assert!(conf.dial_targets(1001).is_empty());
        assert!(conf.peer(1999).is_err());
    }
}
