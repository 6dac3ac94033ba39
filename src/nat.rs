//! NAT behaviour classification.
//!
//! Every reply tells us how the responder saw our address. Collecting those
//! observations from distinct referrers shows whether our NAT keeps the
//! external port stable, allocates it sequentially, or randomizes it.
//!
//! # Example
//!
//! ```
//! use dhtrpc::nat::{NatAnalyzer, NatType};
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! let mut nat = NatAnalyzer::default();
//! let external = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 40000);
//! for i in 0..4 {
//!     let referrer = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, i), 49737);
//!     nat.add(external, referrer);
//! }
//! assert_eq!(nat.analyze(3).nat_type, NatType::PortConsistent);
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::constants::{NAT_INCREMENTING_THRESHOLD, NAT_MAX_OUTLIERS, NAT_SAMPLE_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// Not enough (or not enough agreeing) samples.
    Unknown,
    /// The external port never changes; it is safe to advertise.
    PortConsistent,
    /// Ports are allocated sequentially; holepunching may work with coordination.
    PortIncrementing,
    /// Ports jump around; direct connectivity is unlikely.
    PortRandomized,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatType::Unknown => write!(f, "unknown"),
            NatType::PortConsistent => write!(f, "port consistent"),
            NatType::PortIncrementing => write!(f, "port incrementing"),
            NatType::PortRandomized => write!(f, "port randomized"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatSample {
    pub host: Ipv4Addr,
    pub port: u16,
    pub referrer: SocketAddrV4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatAnalysis {
    pub nat_type: NatType,
    /// The dominant observed host, once one exists.
    pub host: Option<Ipv4Addr>,
    /// The median observed port of the dominant host.
    pub port: Option<u16>,
}

impl NatAnalysis {
    fn unknown() -> Self {
        Self {
            nat_type: NatType::Unknown,
            host: None,
            port: None,
        }
    }

    /// The external address, when the NAT keeps it stable.
    pub fn stable_addr(&self) -> Option<SocketAddrV4> {
        match (self.nat_type, self.host, self.port) {
            (NatType::PortConsistent, Some(host), Some(port)) => {
                Some(SocketAddrV4::new(host, port))
            }
            _ => None,
        }
    }
}

/// Fixed-capacity ring of external address observations, one per referrer.
#[derive(Debug, Clone)]
pub struct NatAnalyzer {
    capacity: usize,
    samples: VecDeque<NatSample>,
}

impl Default for NatAnalyzer {
    fn default() -> Self {
        Self::new(NAT_SAMPLE_CAPACITY)
    }
}

impl NatAnalyzer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Records that `referrer` saw us as `observed`.
    ///
    /// A referrer already in the ring has its sample updated in place and
    /// `false` is returned. Otherwise the oldest sample is evicted when full.
    pub fn add(&mut self, observed: SocketAddrV4, referrer: SocketAddrV4) -> bool {
        let sample = NatSample {
            host: *observed.ip(),
            port: observed.port(),
            referrer,
        };

        if let Some(existing) = self.samples.iter_mut().find(|s| s.referrer == referrer) {
            *existing = sample;
            return false;
        }

        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        true
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &NatSample> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn analyze(&self, min_samples: usize) -> NatAnalysis {
        let total = self.samples.len();
        if total == 0 || total < min_samples {
            return NatAnalysis::unknown();
        }

        let Some((host, count)) = self.dominant_host() else {
            return NatAnalysis::unknown();
        };
        if count * 2 < total {
            return NatAnalysis::unknown();
        }

        let mut ports: Vec<u32> = self
            .samples
            .iter()
            .filter(|s| s.host == host)
            .map(|s| s.port as u32)
            .collect();
        ports.sort_unstable();

        let trim = if ports.len() >= 6 {
            NAT_MAX_OUTLIERS.min((ports.len() - 2) / 4)
        } else {
            0
        };
        let port = median(&ports[trim..ports.len() - trim]);

        // Deviations over the dominant host only; other hosts' ports say
        // nothing about this mapping.
        let mut deviations: Vec<u32> = ports.iter().map(|p| p.abs_diff(port)).collect();

        let nat_type = if deviations.iter().all(|&d| d == 0) {
            NatType::PortConsistent
        } else {
            deviations.sort_unstable();
            if median(&deviations) < NAT_INCREMENTING_THRESHOLD {
                NatType::PortIncrementing
            } else {
                NatType::PortRandomized
            }
        };

        NatAnalysis {
            nat_type,
            host: Some(host),
            port: Some(port as u16),
        }
    }

    fn dominant_host(&self) -> Option<(Ipv4Addr, usize)> {
        let mut counts: HashMap<Ipv4Addr, usize> = HashMap::new();
        let mut best: Option<(Ipv4Addr, usize)> = None;

        for sample in &self.samples {
            let count = counts.entry(sample.host).or_default();
            *count += 1;
            if best.map_or(true, |(_, c)| *count > c) {
                best = Some((sample.host, *count));
            }
        }

        best
    }
}

/// Median of a sorted, non-empty slice.
fn median(sorted: &[u32]) -> u32 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn referrer(i: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, i), 49737)
    }

    fn observed(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), port)
    }

    fn feed(ports: &[u16]) -> NatAnalyzer {
        let mut nat = NatAnalyzer::default();
        for (i, &port) in ports.iter().enumerate() {
            assert!(nat.add(observed(port), referrer(i as u8)));
        }
        nat
    }

    #[test]
    fn test_consistent_ports() {
        let nat = feed(&[40000; 10]);
        let analysis = nat.analyze(3);
        assert_eq!(analysis.nat_type, NatType::PortConsistent);
        assert_eq!(analysis.stable_addr(), Some(observed(40000)));
    }

    #[test]
    fn test_incrementing_ports() {
        let ports: Vec<u16> = (0..10).map(|i| 40000 + i).collect();
        let analysis = feed(&ports).analyze(3);
        assert_eq!(analysis.nat_type, NatType::PortIncrementing);
        assert_eq!(analysis.stable_addr(), None);
    }

    #[test]
    fn test_randomized_ports() {
        let ports = [
            1024, 60000, 12000, 45000, 3000, 30000, 52000, 8000, 21000, 39000,
        ];
        let analysis = feed(&ports).analyze(3);
        assert_eq!(analysis.nat_type, NatType::PortRandomized);
    }

    #[test]
    fn test_too_few_samples() {
        let nat = feed(&[40000, 40000]);
        assert_eq!(nat.analyze(3).nat_type, NatType::Unknown);
        assert_eq!(nat.analyze(2).nat_type, NatType::PortConsistent);
    }

    #[test]
    fn test_no_dominant_host() {
        let mut nat = NatAnalyzer::default();
        for i in 0..6u8 {
            let host = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, i), 40000);
            nat.add(host, referrer(i));
        }
        assert_eq!(nat.analyze(3).nat_type, NatType::Unknown);
    }

    #[test]
    fn test_outliers_do_not_move_median() {
        let mut ports = vec![40000u16; 8];
        ports.push(1);
        ports.push(65000);
        let analysis = feed(&ports).analyze(3);
        assert_eq!(analysis.port, Some(40000));
        // Two samples deviate, but the median deviation is still zero.
        assert_eq!(analysis.nat_type, NatType::PortIncrementing);
    }

    #[test]
    fn test_same_referrer_replaces_sample() {
        let mut nat = NatAnalyzer::default();
        assert!(nat.add(observed(1000), referrer(1)));
        assert!(!nat.add(observed(2000), referrer(1)));
        assert_eq!(nat.len(), 1);
        assert_eq!(nat.samples().next().map(|s| s.port), Some(2000));
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut nat = NatAnalyzer::new(3);
        for i in 0..5u8 {
            nat.add(observed(1000 + i as u16), referrer(i));
        }
        assert_eq!(nat.len(), 3);
        let ports: Vec<u16> = nat.samples().map(|s| s.port).collect();
        assert_eq!(ports, vec![1002, 1003, 1004]);
    }
}
