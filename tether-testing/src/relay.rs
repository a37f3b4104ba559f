//! UDP relay that sits between a client and a server and misbehaves on
//! purpose.
//!
//! The client connects to [`LossyRelay::local_addr`]; every datagram is then
//! forwarded to the upstream server (and replies back to the last client
//! seen) unless the current [`RelayConditions`], [`FaultPlan`] or partition
//! say otherwise. Random decisions come from a seeded RNG so runs are
//! repeatable.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fault_injection::{Direction, FaultPlan};

#[derive(Debug, Clone)]
pub struct RelayConditions {
    /// Probability that a datagram is dropped
    pub drop_rate: f64,
    /// Probability that a forwarded datagram is delivered twice
    pub duplicate_rate: f64,
    pub seed: u64,
}

impl Default for RelayConditions {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            seed: 42,
        }
    }
}

impl RelayConditions {
    pub fn lossy(drop_rate: f64) -> Self {
        Self {
            drop_rate,
            ..Default::default()
        }
    }

    pub fn with_duplicate_rate(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub duplicated: u64,
}

impl RelayStats {
    pub fn drop_ratio(&self) -> f64 {
        if self.received > 0 {
            self.dropped as f64 / self.received as f64
        } else {
            0.0
        }
    }
}

struct RelayState {
    conditions: Mutex<RelayConditions>,
    rng: Mutex<StdRng>,
    faults: Mutex<FaultPlan>,
    partitioned: AtomicBool,
    stats: Mutex<RelayStats>,
}

impl RelayState {
    /// Number of copies of `datagram` to forward.
    fn copies(&self, direction: Direction, datagram: &[u8]) -> usize {
        let mut stats = self.stats.lock();
        stats.received += 1;

        let copies = if self.partitioned.load(Ordering::SeqCst) {
            0
        } else if let Some(planned) = self.faults.lock().apply(direction, datagram) {
            planned
        } else {
            let conditions = self.conditions.lock().clone();
            let mut rng = self.rng.lock();
            if rng.gen::<f64>() < conditions.drop_rate {
                0
            } else if rng.gen::<f64>() < conditions.duplicate_rate {
                2
            } else {
                1
            }
        };

        match copies {
            0 => {
                stats.dropped += 1;
                debug!("relay dropped {} bytes {}", datagram.len(), direction);
            }
            1 => stats.forwarded += 1,
            _ => {
                stats.forwarded += 1;
                stats.duplicated += 1;
            }
        }
        copies
    }
}

pub struct LossyRelay {
    local_addr: SocketAddr,
    state: Arc<RelayState>,
    task: JoinHandle<()>,
}

impl LossyRelay {
    /// Start relaying between a fresh loopback port and `upstream`.
    pub async fn start(upstream: SocketAddr, conditions: RelayConditions) -> anyhow::Result<Self> {
        let front = UdpSocket::bind("127.0.0.1:0").await?;
        let back = UdpSocket::bind("127.0.0.1:0").await?;
        back.connect(upstream).await?;
        let local_addr = front.local_addr()?;

        let state = Arc::new(RelayState {
            rng: Mutex::new(StdRng::seed_from_u64(conditions.seed)),
            conditions: Mutex::new(conditions),
            faults: Mutex::new(FaultPlan::new()),
            partitioned: AtomicBool::new(false),
            stats: Mutex::new(RelayStats::default()),
        });

        let task = tokio::spawn(run(front, back, state.clone()));
        info!("relay {} -> {} started", local_addr, upstream);

        Ok(Self {
            local_addr,
            state,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn set_conditions(&self, conditions: RelayConditions) {
        *self.state.rng.lock() = StdRng::seed_from_u64(conditions.seed);
        *self.state.conditions.lock() = conditions;
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        *self.state.faults.lock() = plan;
    }

    /// Drop everything in both directions until [`LossyRelay::heal`].
    pub fn partition(&self) {
        warn!("relay {} partitioned", self.local_addr);
        self.state.partitioned.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        info!("relay {} healed", self.local_addr);
        self.state.partitioned.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> RelayStats {
        self.state.stats.lock().clone()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for LossyRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(front: UdpSocket, back: UdpSocket, state: Arc<RelayState>) {
    let mut client: Option<SocketAddr> = None;
    let mut upstream_buf = vec![0u8; 64 * 1024];
    let mut downstream_buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            received = front.recv_from(&mut upstream_buf) => match received {
                Ok((len, from)) => {
                    client = Some(from);
                    let datagram = &upstream_buf[..len];
                    for _ in 0..state.copies(Direction::ToServer, datagram) {
                        if let Err(e) = back.send(datagram).await {
                            debug!("relay upstream send failed: {}", e);
                        }
                    }
                }
                Err(e) => debug!("relay front receive failed: {}", e),
            },
            received = back.recv(&mut downstream_buf) => match (received, client) {
                (Ok(len), Some(client)) => {
                    let datagram = &downstream_buf[..len];
                    for _ in 0..state.copies(Direction::ToClient, datagram) {
                        if let Err(e) = front.send_to(datagram, client).await {
                            debug!("relay downstream send failed: {}", e);
                        }
                    }
                }
                (Ok(_), None) => debug!("relay has no client for a server datagram"),
                // ICMP errors surface here while the server is down
                (Err(e), _) => debug!("relay back receive failed: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_injection::FaultPlan;
    use tether_core::header::DatagramHeader;

    fn state(conditions: RelayConditions) -> RelayState {
        RelayState {
            rng: Mutex::new(StdRng::seed_from_u64(conditions.seed)),
            conditions: Mutex::new(conditions),
            faults: Mutex::new(FaultPlan::new()),
            partitioned: AtomicBool::new(false),
            stats: Mutex::new(RelayStats::default()),
        }
    }

    #[test]
    fn test_seeded_loss_is_repeatable() {
        let datagram = DatagramHeader::new(0, -1, 0).frame(b"x");
        let run = || {
            let relay = state(RelayConditions::lossy(0.5).with_seed(7));
            (0..200)
                .map(|_| relay.copies(Direction::ToServer, &datagram))
                .collect::<Vec<_>>()
        };

        let first = run();
        assert_eq!(first, run());

        let dropped = first.iter().filter(|&&copies| copies == 0).count();
        assert!((60..140).contains(&dropped), "dropped {}", dropped);
    }

    #[test]
    fn test_partition_and_plan_take_precedence() {
        let relay = state(RelayConditions::default());
        let datagram = DatagramHeader::new(4, -1, 0).frame(b"x");

        *relay.faults.lock() = FaultPlan::new().drop_id(Direction::ToServer, 4, 1);
        assert_eq!(relay.copies(Direction::ToServer, &datagram), 0);
        assert_eq!(relay.copies(Direction::ToServer, &datagram), 1);

        relay.partitioned.store(true, Ordering::SeqCst);
        assert_eq!(relay.copies(Direction::ToClient, &datagram), 0);

        let stats = relay.stats.lock().clone();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.forwarded, 1);
    }
}
