use std::collections::HashMap;
use std::fmt;

use tether_core::header::DatagramHeader;

/// Which way a datagram travels through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToServer,
    ToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToServer => write!(f, "client->server"),
            Direction::ToClient => write!(f, "server->client"),
        }
    }
}

/// Deterministic faults keyed by datagram id.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    drops: HashMap<(Direction, i32), usize>,
    duplicates: HashMap<(Direction, i32), usize>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the next `times` datagrams with `id` travelling in `direction`.
    pub fn drop_id(mut self, direction: Direction, id: i32, times: usize) -> Self {
        *self.drops.entry((direction, id)).or_default() += times;
        self
    }

    /// Deliver the next `times` datagrams with `id` twice.
    pub fn duplicate_id(mut self, direction: Direction, id: i32, times: usize) -> Self {
        *self.duplicates.entry((direction, id)).or_default() += times;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.drops.is_empty() && self.duplicates.is_empty()
    }

    /// Copies of `datagram` to forward according to the plan, consuming one
    /// matching fault. `None` means the plan has no opinion.
    pub fn apply(&mut self, direction: Direction, datagram: &[u8]) -> Option<usize> {
        let (header, _) = DatagramHeader::deser(datagram).ok()?;
        let key = (direction, header.id);

        if take(&mut self.drops, key) {
            return Some(0);
        }
        if take(&mut self.duplicates, key) {
            return Some(2);
        }
        None
    }
}

fn take(faults: &mut HashMap<(Direction, i32), usize>, key: (Direction, i32)) -> bool {
    match faults.get_mut(&key) {
        Some(remaining) => {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(&key);
            }
            true
        }
        None => false,
    }
}
