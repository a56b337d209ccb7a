//! The engine wires a peer together: it sets up storage, the event log and
//! the swarm state, spawns the scheduler loops, dials the lower-id peers,
//! accepts connections from the higher-id ones, and watches for the swarm to
//! converge so it can shut everything down.

use std::{path::PathBuf, sync::Arc, time::Duration};

use futures::{select, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task, time,
};

use crate::{
    choker::Choker,
    conf::{Conf, PeerConf},
    disk::FileStore,
    error::*,
    event_log::EventLog,
    peer::PeerSession,
    storage_info::StorageInfo,
    swarm::Swarm,
    PeerId,
};

/// How long a single outbound connection attempt may take.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a failed dial is retried before the target is given up on. The
/// retries cover the window in which lower-id peers may still be starting.
const DIAL_RETRY_LIMIT: u32 = 5;

/// The backoff before the first redial; it doubles after every failure.
const DIAL_BACKOFF_START: Duration = Duration::from_secs(1);

/// How often the termination condition is re-checked.
const COMPLETION_POLL: Duration = Duration::from_secs(1);

/// Runs one peer to completion.
///
/// The peer's working directory `peer_<id>/` and its event log are created
/// under `root`. The call returns once every peer of the roster, this one
/// included, has been observed owning the complete file, or with an error if
/// startup fails.
pub async fn run(peer_id: PeerId, conf: Conf, root: impl Into<PathBuf>) -> Result<()> {
    let root = root.into();
    let my_conf = conf.peer(peer_id)?.clone();
    let info = StorageInfo::new(&conf.common);
    log::info!(
        "Starting peer {}: {:?}, {} bytes in {} pieces",
        peer_id,
        info.file_name,
        info.file_len,
        info.piece_count
    );

    let store = Arc::new(FileStore::new(&root, peer_id, info.clone(), my_conf.has_file)?);
    let events = Arc::new(EventLog::create(&root, peer_id)?);
    let roster = conf.peers.keys().copied().filter(|id| *id != peer_id).collect();
    let swarm = Arc::new(Swarm::new(
        peer_id,
        info,
        store,
        events,
        roster,
        my_conf.has_file,
    ));

    let (shutdown_chan, shutdown_port) = watch::channel(false);

    let choker = Arc::new(Choker::new(Arc::clone(&swarm), &conf.common));
    task::spawn(Arc::clone(&choker).run_preferred(shutdown_port.clone()));
    task::spawn(Arc::clone(&choker).run_optimistic(shutdown_port.clone()));

    // the listener must be up before any higher-id peer starts dialing us
    let listener = TcpListener::bind(("0.0.0.0", my_conf.port)).await?;
    log::info!("Peer {} listening on port {}", peer_id, my_conf.port);
    task::spawn(listen(Arc::clone(&swarm), listener, shutdown_port.clone()));

    // dial every lower-id peer, in ascending id order
    for target in conf.dial_targets(peer_id) {
        task::spawn(dial(
            Arc::clone(&swarm),
            target.clone(),
            shutdown_port.clone(),
        ));
    }

    // wait for the whole roster, ourselves included, to own the file
    let mut poll = time::interval(COMPLETION_POLL);
    loop {
        poll.tick().await;
        if swarm.is_swarm_complete().await {
            break;
        }
    }

    log::info!("Peer {}: every peer has the complete file, shutting down", peer_id);
    let _ = shutdown_chan.broadcast(true);
    swarm.shutdown_sessions().await;
    // let the session tasks drain their outbound queues
    time::delay_for(Duration::from_millis(250)).await;
    Ok(())
}

/// Accepts inbound connections until shutdown, running a session task for
/// each.
async fn listen(swarm: Arc<Swarm>, mut listener: TcpListener, shutdown: watch::Receiver<bool>) {
    let mut incoming = listener.incoming().fuse();
    let mut shutdown = shutdown.fuse();
    loop {
        select! {
            socket = incoming.select_next_some() => match socket {
                Ok(socket) => {
                    let swarm = Arc::clone(&swarm);
                    task::spawn(async move {
                        let addr = match socket.peer_addr() {
                            Ok(addr) => addr,
                            Err(e) => {
                                log::warn!("Accepted socket has no peer address: {}", e);
                                return;
                            }
                        };
                        let mut session = PeerSession::inbound(swarm, addr);
                        if let Err(e) = session.start(socket).await {
                            log::info!("Inbound session from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => log::warn!("Failed to accept connection: {}", e),
            },
            stop = shutdown.select_next_some() => if stop { break },
        }
    }
    log::debug!("Listener stopped");
}

/// Dials one peer, with retries, and runs the session over the established
/// connection. Dial failures are logged and never fatal: the target may be
/// down for good, or it may just not be up yet.
async fn dial(swarm: Arc<Swarm>, target: PeerConf, shutdown: watch::Receiver<bool>) {
    let addr = format!("{}:{}", target.host, target.port);
    let mut backoff = DIAL_BACKOFF_START;
    for attempt in 1..=DIAL_RETRY_LIMIT {
        if *shutdown.borrow() {
            return;
        }
        log::info!(
            "Dialing peer {} at {} (attempt {}/{})",
            target.id,
            addr,
            attempt,
            DIAL_RETRY_LIMIT
        );
        match time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(socket)) => {
                let peer_addr = match socket.peer_addr() {
                    Ok(addr) => addr,
                    Err(e) => {
                        log::warn!("Connected socket has no peer address: {}", e);
                        return;
                    }
                };
                let mut session = PeerSession::outbound(swarm, peer_addr, target.id);
                if let Err(e) = session.start(socket).await {
                    log::info!("Outbound session with peer {} ended: {}", target.id, e);
                }
                return;
            }
            Ok(Err(e)) => log::warn!("Dial to peer {} refused: {}", target.id, e),
            Err(_) => log::warn!("Dial to peer {} timed out", target.id),
        }
        time::delay_for(backoff).await;
        backoff *= 2;
    }
    log::warn!("Giving up on dialing peer {}", target.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{CommonConf, PeerConf};
    use std::{collections::BTreeMap, fs};

    fn free_ports() -> (u16, u16) {
        // hold both ephemeral ports at once so the OS hands out two distinct
        // ones, then release them for the engines to rebind
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let second = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        (
            first.local_addr().unwrap().port(),
            second.local_addr().unwrap().port(),
        )
    }

    fn test_conf(seeder_port: u16, leecher_port: u16) -> Conf {
        let mut peers = BTreeMap::new();
        peers.insert(
            1001,
            PeerConf {
                id: 1001,
                host: "127.0.0.1".to_string(),
                port: seeder_port,
                has_file: true,
            },
        );
        peers.insert(
            1002,
            PeerConf {
                id: 1002,
                host: "127.0.0.1".to_string(),
                port: leecher_port,
                has_file: false,
            },
        );
        Conf {
            common: CommonConf {
                preferred_count: 1,
                unchoking_interval: Duration::from_secs(1),
                optimistic_interval: Duration::from_secs(1),
                file_name: "payload.dat".to_string(),
                // 11 pieces, the last one 1000 bytes long
                file_len: 10 * 4096 + 1000,
                piece_len: 4096,
            },
            peers,
        }
    }

    #[tokio::test(threaded_scheduler)]
    async fn test_seeder_and_leecher_converge() {
        let seeder_root = tempfile::tempdir().unwrap();
        let leecher_root = tempfile::tempdir().unwrap();
        let (seeder_port, leecher_port) = free_ports();
        let conf = test_conf(seeder_port, leecher_port);

        let payload: Vec<u8> = (0..conf.common.file_len).map(|i| (i % 251) as u8).collect();
        let seed_dir = seeder_root.path().join("peer_1001");
        fs::create_dir_all(&seed_dir).unwrap();
        fs::write(seed_dir.join("payload.dat"), &payload).unwrap();

        let seeder = task::spawn(run(
            1001,
            conf.clone(),
            seeder_root.path().to_path_buf(),
        ));
        let leecher = task::spawn(run(
            1002,
            conf.clone(),
            leecher_root.path().to_path_buf(),
        ));

        let joined = time::timeout(Duration::from_secs(60), futures::future::join(seeder, leecher))
            .await
            .expect("the swarm did not converge in time");
        joined.0.unwrap().unwrap();
        joined.1.unwrap().unwrap();

        // the leecher ends up with a byte-identical file
        let downloaded = fs::read(leecher_root.path().join("peer_1002/payload.dat")).unwrap();
        assert_eq!(downloaded.len(), payload.len());
        assert!(downloaded == payload);

        // and its event log records the completion and all 11 pieces
        let log = fs::read_to_string(leecher_root.path().join("log_peer_1002.log")).unwrap();
        assert!(log.contains("Peer 1002 has downloaded the complete file."));
        assert_eq!(log.matches("has downloaded the piece").count(), 11);
        assert!(log.contains("Peer 1002 makes a connection to Peer 1001."));

        let seeder_log = fs::read_to_string(seeder_root.path().join("log_peer_1001.log")).unwrap();
        assert!(seeder_log.contains("Peer 1001 is connected from Peer 1002."));
        assert!(seeder_log.contains("received the 'interested' message from 1002"));
    }
}
