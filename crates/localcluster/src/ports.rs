//! Port allocation for cluster nodes.
//!
//! Every node needs a full set of listening ports. Ports are drawn from
//! independent bands so that, e.g., client ports never collide with internal
//! ports. Each band is a monotonic counter starting at a fixed base plus an
//! offset that is re-drawn on every [`PortAllocator::reset`], which keeps
//! successive test runs on one machine away from sockets left in `TIME_WAIT`.

use rand::Rng;
use std::collections::BTreeSet;

/// First port of the lowest band.
pub const FIRST_BAND_BASE: u16 = 20_000;

/// Width of each band. Bands never overlap.
pub const BAND_WIDTH: u16 = 1_000;

/// Upper bound (exclusive) of the random seed offset.
pub const MAX_OFFSET: u16 = BAND_WIDTH / 2;

/// Number of replication ports each node binds.
pub const REPLICATION_PORTS: usize = 3;

/// Logical port bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortBand {
    Client,
    Admin,
    Internal,
    Discovery,
    Http,
    Replication,
    Messaging,
    Debug,
    Ipc,
}

impl PortBand {
    /// All bands in allocation order.
    pub const ALL: [PortBand; 9] = [
        PortBand::Client,
        PortBand::Admin,
        PortBand::Internal,
        PortBand::Discovery,
        PortBand::Http,
        PortBand::Replication,
        PortBand::Messaging,
        PortBand::Debug,
        PortBand::Ipc,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// First port of this band before the offset is applied.
    pub fn base(self) -> u16 {
        FIRST_BAND_BASE + self.index() as u16 * BAND_WIDTH
    }
}

/// Issues unique, monotonically increasing ports per band.
///
/// This is an explicit value owned by the cluster controller; there is no
/// process-wide port state.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    fixed_offset: Option<u16>,
    offset: u16,
    next: [u16; PortBand::ALL.len()],
}

impl PortAllocator {
    /// Creates an allocator that draws a random offset on every reset.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an allocator with a configured offset, reused on every reset.
    ///
    /// Offsets at or above [`MAX_OFFSET`] are wrapped into range.
    pub fn with_offset(offset: u16) -> Self {
        Self::build(Some(offset % MAX_OFFSET))
    }

    fn build(fixed_offset: Option<u16>) -> Self {
        let mut allocator = Self {
            fixed_offset,
            offset: 0,
            next: [0; PortBand::ALL.len()],
        };
        allocator.reset();
        allocator
    }

    /// Re-seeds every band counter.
    ///
    /// Must be called once at the start of every cluster run, before any node
    /// spec is computed.
    pub fn reset(&mut self) {
        self.offset = self
            .fixed_offset
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..MAX_OFFSET));
        for band in PortBand::ALL {
            self.next[band.index()] = band.base() + self.offset;
        }
        tracing::debug!(offset = self.offset, "port allocator reset");
    }

    /// Offset applied to every band since the last reset.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Returns the next port from `band`.
    ///
    /// Allocation never fails. A band wraps back to its base after
    /// [`BAND_WIDTH`] allocations; callers keep the total below that.
    pub fn next(&mut self, band: PortBand) -> u16 {
        let slot = &mut self.next[band.index()];
        let port = *slot;
        let end = band.base() + BAND_WIDTH;
        *slot = if port + 1 >= end { band.base() } else { port + 1 };
        port
    }

    /// Draws a complete port set for one node.
    pub fn next_port_set(&mut self, with_debug: bool, ipc_count: usize) -> PortSet {
        PortSet {
            client: self.next(PortBand::Client),
            admin: self.next(PortBand::Admin),
            internal: self.next(PortBand::Internal),
            discovery: self.next(PortBand::Discovery),
            http: self.next(PortBand::Http),
            replication: [
                self.next(PortBand::Replication),
                self.next(PortBand::Replication),
                self.next(PortBand::Replication),
            ],
            messaging: self.next(PortBand::Messaging),
            debug: with_debug.then(|| self.next(PortBand::Debug)),
            ipc: (0..ipc_count).map(|_| self.next(PortBand::Ipc)).collect(),
        }
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Full set of ports assigned to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSet {
    pub client: u16,
    pub admin: u16,
    pub internal: u16,
    pub discovery: u16,
    pub http: u16,
    pub replication: [u16; REPLICATION_PORTS],
    pub messaging: u16,
    pub debug: Option<u16>,
    /// Ports of the auxiliary execution-engine helper, one per site.
    pub ipc: Vec<u16>,
}

impl PortSet {
    /// Every port in this set.
    pub fn all(&self) -> Vec<u16> {
        let mut ports = vec![
            self.client,
            self.admin,
            self.internal,
            self.discovery,
            self.http,
            self.messaging,
        ];
        ports.extend(self.replication);
        ports.extend(self.debug);
        ports.extend(&self.ipc);
        ports
    }
}

/// Number of coordinators for a given k-factor: `k + 1`, capped at 3.
pub fn coordinator_count(kfactor: usize) -> usize {
    (kfactor + 1).min(3)
}

/// Computes the coordinator addresses every node uses to find the cluster.
///
/// `internal_ports` is indexed by node index. Intentionally removed hosts are
/// skipped; the first `min(k + 1, 3)` remaining nodes are coordinators.
pub fn coordinators(
    internal_ports: &[u16],
    kfactor: usize,
    removed: &BTreeSet<usize>,
) -> Vec<String> {
    internal_ports
        .iter()
        .enumerate()
        .filter(|(idx, _)| !removed.contains(idx))
        .take(coordinator_count(kfactor))
        .map(|(_, port)| format!("127.0.0.1:{port}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_bands_do_not_overlap() {
        for pair in PortBand::ALL.windows(2) {
            assert_eq!(pair[1].base() - pair[0].base(), BAND_WIDTH);
        }
        let last = PortBand::ALL[PortBand::ALL.len() - 1];
        assert!(u32::from(last.base()) + u32::from(BAND_WIDTH) <= u32::from(u16::MAX));
    }

    #[test]
    fn test_fixed_offset_is_reused_on_reset() {
        let mut ports = PortAllocator::with_offset(42);
        assert_eq!(ports.next(PortBand::Client), PortBand::Client.base() + 42);
        assert_eq!(ports.next(PortBand::Client), PortBand::Client.base() + 43);

        ports.reset();
        assert_eq!(ports.offset(), 42);
        assert_eq!(ports.next(PortBand::Client), PortBand::Client.base() + 42);
    }

    #[test]
    fn test_bands_are_independent() {
        let mut ports = PortAllocator::with_offset(0);
        assert_eq!(ports.next(PortBand::Admin), PortBand::Admin.base());
        assert_eq!(ports.next(PortBand::Client), PortBand::Client.base());
        assert_eq!(ports.next(PortBand::Admin), PortBand::Admin.base() + 1);
    }

    #[test]
    fn test_port_set_is_pairwise_distinct() {
        let mut ports = PortAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..5 {
            let set = ports.next_port_set(true, 2);
            assert_eq!(set.all().len(), 12);
            for port in set.all() {
                assert!(seen.insert(port), "port {port} issued twice");
            }
        }
    }

    #[test]
    fn test_band_wraps_to_base() {
        let mut ports = PortAllocator::with_offset(MAX_OFFSET - 1);
        let first = ports.next(PortBand::Debug);
        for _ in 1..(BAND_WIDTH - (MAX_OFFSET - 1)) {
            ports.next(PortBand::Debug);
        }
        assert_eq!(first, PortBand::Debug.base() + MAX_OFFSET - 1);
        assert_eq!(ports.next(PortBand::Debug), PortBand::Debug.base());
    }

    #[test]
    fn test_coordinators_capped_at_three() {
        let internal = [100, 101, 102, 103, 104];
        let none = BTreeSet::new();

        assert_eq!(coordinators(&internal, 0, &none), vec!["127.0.0.1:100"]);
        assert_eq!(coordinators(&internal, 1, &none).len(), 2);
        assert_eq!(coordinators(&internal, 2, &none).len(), 3);
        assert_eq!(coordinators(&internal, 4, &none).len(), 3);
    }

    #[test]
    fn test_coordinators_skip_removed_hosts() {
        let internal = [100, 101, 102, 103];
        let removed: BTreeSet<usize> = [0, 2].into_iter().collect();

        assert_eq!(
            coordinators(&internal, 2, &removed),
            vec!["127.0.0.1:101", "127.0.0.1:103"]
        );
    }

    proptest! {
        /// Property: no (band, port) pair repeats between resets.
        #[test]
        fn prop_no_repeat_without_reset(
            bands in prop::collection::vec(0usize..PortBand::ALL.len(), 1..400)
        ) {
            let mut ports = PortAllocator::new();
            let mut seen = HashSet::new();
            for idx in bands {
                let band = PortBand::ALL[idx];
                let port = ports.next(band);
                prop_assert!(seen.insert((band, port)));
            }
        }
    }
}
