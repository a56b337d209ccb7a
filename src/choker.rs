//! The choker runs the two periodic scheduling loops that decide which
//! neighbors the peer serves: the preferred-neighbor recomputation and the
//! optimistic-unchoke rotation.
//!
//! Both loops work off snapshots of the per-session state and push their
//! decisions back into the sessions as choke/unchoke commands, so they never
//! hold more than one lock at a time. A failed tick is logged and suppressed;
//! the loop simply runs again at its next period.

use std::{sync::Arc, time::Duration};

use futures::{select, StreamExt};
use rand::{seq::SliceRandom, thread_rng, Rng};
use tokio::{
    sync::{watch, Mutex},
    time,
};

use crate::{
    conf::CommonConf,
    peer::Command,
    swarm::{NeighborSnapshot, Swarm},
    PeerId,
};

/// The choking decisions as of the last scheduler ticks.
#[derive(Debug, Default)]
struct ChokeSet {
    /// The up-to-k neighbors currently unchoked for their download
    /// contribution, in decision order.
    preferred: Vec<PeerId>,
    /// The one additional neighbor currently unchoked optimistically.
    /// Disjoint from `preferred`.
    optimistic: Option<PeerId>,
}

pub(crate) struct Choker {
    swarm: Arc<Swarm>,
    preferred_count: usize,
    unchoking_interval: Duration,
    optimistic_interval: Duration,
    state: Mutex<ChokeSet>,
}

impl Choker {
    pub fn new(swarm: Arc<Swarm>, common: &CommonConf) -> Self {
        Self {
            swarm,
            preferred_count: common.preferred_count,
            unchoking_interval: common.unchoking_interval,
            optimistic_interval: common.optimistic_interval,
            state: Mutex::new(ChokeSet::default()),
        }
    }

    /// Recomputes the preferred neighbors every unchoking interval until
    /// shutdown.
    pub async fn run_preferred(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let period = self.unchoking_interval;
        let mut ticks = time::interval_at(time::Instant::now() + period, period).fuse();
        let mut shutdown = shutdown.fuse();
        loop {
            select! {
                _ = ticks.select_next_some() => self.preferred_tick().await,
                stop = shutdown.select_next_some() => if stop { break },
            }
        }
        log::debug!("Preferred-neighbor loop stopped");
    }

    /// Rotates the optimistic unchoke every optimistic interval until
    /// shutdown.
    pub async fn run_optimistic(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let period = self.optimistic_interval;
        let mut ticks = time::interval_at(time::Instant::now() + period, period).fuse();
        let mut shutdown = shutdown.fuse();
        loop {
            select! {
                _ = ticks.select_next_some() => self.optimistic_tick().await,
                stop = shutdown.select_next_some() => if stop { break },
            }
        }
        log::debug!("Optimistic-unchoke loop stopped");
    }

    /// One preferred-neighbor recomputation: rank the interested neighbors,
    /// unchoke the top k, choke the demoted ones (sparing the optimistic
    /// unchoke), and start a fresh rate window.
    async fn preferred_tick(&self) {
        let snapshot = self.swarm.neighbor_snapshot().await;
        let seeding = self.swarm.self_complete().await;
        let new_preferred =
            rank_preferred(&snapshot, self.preferred_count, seeding, &mut thread_rng());

        let mut choke_set = self.state.lock().await;
        // the optimistic unchoke may have earned a preferred slot; the slot
        // wins and the optimistic rotation starts from a clean slate
        if let Some(optimistic) = choke_set.optimistic {
            if new_preferred.contains(&optimistic) {
                choke_set.optimistic = None;
            }
        }

        for peer_id in choke_set.preferred.iter() {
            if !new_preferred.contains(peer_id) && Some(*peer_id) != choke_set.optimistic {
                self.swarm.command(*peer_id, Command::Choke).await;
            }
        }
        for peer_id in new_preferred.iter() {
            if !choke_set.preferred.contains(peer_id) {
                self.swarm.command(*peer_id, Command::Unchoke).await;
            }
        }

        choke_set.preferred = new_preferred;
        if !choke_set.preferred.is_empty() {
            log::debug!("Preferred neighbors: {:?}", choke_set.preferred);
            self.swarm.events().preferred_neighbors(&choke_set.preferred);
        }
        drop(choke_set);

        // the window is tumbling: every tick rates start over, whether or
        // not anyone was interested this time
        self.swarm.reset_download_windows().await;
    }

    /// One optimistic-unchoke rotation: pick one choked, interested,
    /// non-preferred neighbor at random and unchoke it, re-choking the
    /// previous pick unless it got promoted to preferred meanwhile.
    async fn optimistic_tick(&self) {
        let snapshot = self.swarm.neighbor_snapshot().await;
        let mut choke_set = self.state.lock().await;

        let candidates = optimistic_candidates(&snapshot, &choke_set.preferred);
        let new = match candidates.choose(&mut thread_rng()) {
            Some(peer_id) => *peer_id,
            None => return,
        };

        if let Some(previous) = choke_set.optimistic {
            if previous != new && !choke_set.preferred.contains(&previous) {
                self.swarm.command(previous, Command::Choke).await;
            }
        }
        self.swarm.command(new, Command::Unchoke).await;
        choke_set.optimistic = Some(new);

        log::debug!("Optimistically unchoked peer {}", new);
        self.swarm.events().optimistic_unchoke(new);
    }
}

/// Ranks the interested neighbors and returns the up-to-k preferred ones.
///
/// While the peer is still downloading, neighbors are ordered by the bytes
/// they contributed over the last rate window; ties fall to a random shuffle
/// applied before the (stable) sort. A seeder has no download rates to rank
/// by and picks uniformly at random.
fn rank_preferred(
    snapshot: &[NeighborSnapshot],
    k: usize,
    seeding: bool,
    rng: &mut impl Rng,
) -> Vec<PeerId> {
    let mut interested: Vec<&NeighborSnapshot> =
        snapshot.iter().filter(|n| n.interested).collect();
    interested.shuffle(rng);
    if !seeding {
        interested.sort_by(|a, b| b.window_bytes.cmp(&a.window_bytes));
    }
    interested.iter().take(k).map(|n| n.peer_id).collect()
}

/// The neighbors eligible for the optimistic unchoke: interested, currently
/// choked, and not preferred.
fn optimistic_candidates(
    snapshot: &[NeighborSnapshot],
    preferred: &[PeerId],
) -> Vec<PeerId> {
    snapshot
        .iter()
        .filter(|n| n.interested && n.choked && !preferred.contains(&n.peer_id))
        .map(|n| n.peer_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn neighbor(peer_id: PeerId, interested: bool, choked: bool, window_bytes: u64) -> NeighborSnapshot {
        NeighborSnapshot {
            peer_id,
            interested,
            choked,
            window_bytes,
        }
    }

    #[test]
    fn test_leecher_ranks_by_download_rate() {
        let mut rng = StdRng::seed_from_u64(1);
        let snapshot = vec![
            neighbor(1001, true, false, 100),
            neighbor(1002, true, true, 900),
            neighbor(1003, false, true, 5000),
            neighbor(1004, true, true, 400),
        ];
        // 1003 contributed the most but isn't interested
        assert_eq!(rank_preferred(&snapshot, 2, false, &mut rng), vec![1002, 1004]);
        // k caps the set
        assert_eq!(rank_preferred(&snapshot, 1, false, &mut rng), vec![1002]);
        // k larger than the interested set returns everyone, ranked
        assert_eq!(
            rank_preferred(&snapshot, 10, false, &mut rng),
            vec![1002, 1004, 1001]
        );
    }

    #[test]
    fn test_rate_ties_break_by_shuffle_deterministically() {
        let snapshot = vec![
            neighbor(1001, true, true, 0),
            neighbor(1002, true, true, 0),
            neighbor(1003, true, true, 0),
        ];
        let mut a = StdRng::seed_from_u64(99);
        let mut b = StdRng::seed_from_u64(99);
        let first = rank_preferred(&snapshot, 2, false, &mut a);
        assert_eq!(first, rank_preferred(&snapshot, 2, false, &mut b));
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_seeder_picks_at_random_among_interested() {
        let snapshot = vec![
            neighbor(1001, true, true, 0),
            neighbor(1002, true, true, 10_000),
            neighbor(1003, true, true, 0),
            neighbor(1004, false, true, 0),
        ];
        let mut rng = StdRng::seed_from_u64(3);
        let picked = rank_preferred(&snapshot, 2, true, &mut rng);
        assert_eq!(picked.len(), 2);
        // only interested neighbors qualify, rates don't matter
        assert!(picked.iter().all(|id| [1001, 1002, 1003].contains(id)));

        // the selection is reproducible under the same seed
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(picked, rank_preferred(&snapshot, 2, true, &mut rng));
    }

    #[test]
    fn test_optimistic_candidates_exclude_preferred_and_unchoked() {
        let snapshot = vec![
            neighbor(1001, true, true, 0),
            // already unchoked
            neighbor(1002, true, false, 0),
            // not interested
            neighbor(1003, false, true, 0),
            // preferred
            neighbor(1004, true, true, 0),
        ];
        let candidates = optimistic_candidates(&snapshot, &[1004]);
        assert_eq!(candidates, vec![1001]);
        assert!(optimistic_candidates(&snapshot, &[1001, 1004]).is_empty());
    }

    #[tokio::test]
    async fn test_rank_reversal_swaps_with_one_choke_and_one_unchoke() {
        use crate::{conf::CommonConf, disk::FileStore, event_log::EventLog, storage_info::StorageInfo};
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let common = CommonConf {
            preferred_count: 1,
            unchoking_interval: Duration::from_secs(5),
            optimistic_interval: Duration::from_secs(10),
            file_name: "payload.dat".to_string(),
            file_len: 10,
            piece_len: 4,
        };
        let info = StorageInfo::new(&common);
        let store = Arc::new(FileStore::new(dir.path(), 1000, info.clone(), false).unwrap());
        let events = Arc::new(EventLog::create(dir.path(), 1000).unwrap());
        let roster = [1001, 1002].iter().copied().collect();
        let swarm = Arc::new(Swarm::new(1000, info, store, events, roster, false));
        let choker = Choker::new(Arc::clone(&swarm), &common);

        let (state_a, mut port_a) = swarm.register_session(1001).await.unwrap();
        let (state_b, mut port_b) = swarm.register_session(1002).await.unwrap();
        for state in [&state_a, &state_b].iter() {
            state.write().await.peer_interested = true;
        }

        let drain = |port: &mut crate::peer::Receiver| {
            let mut cmds = Vec::new();
            while let Ok(cmd) = port.try_recv() {
                cmds.push(cmd);
            }
            cmds
        };

        // 1001 is the faster downloader in the first window
        state_a.write().await.downloaded.record(100);
        state_b.write().await.downloaded.record(10);
        choker.preferred_tick().await;
        assert!(matches!(drain(&mut port_a)[..], [Command::Unchoke]));
        assert!(drain(&mut port_b).is_empty());

        // the tick started a fresh window in which the ranking reverses;
        // the swap is exactly one choke and one unchoke
        assert_eq!(state_a.read().await.downloaded.window(), 0);
        state_a.write().await.downloaded.record(5);
        state_b.write().await.downloaded.record(50);
        choker.preferred_tick().await;
        assert!(matches!(drain(&mut port_a)[..], [Command::Choke]));
        assert!(matches!(drain(&mut port_b)[..], [Command::Unchoke]));
    }
}
