//! Host viability and scoring.
//!
//! A host is viable when its free CPU and memory both cover the request.
//! Among viable hosts the one with the highest score wins:
//!
//! ```text
//! score = 10 * (cpu_free - cpu)
//!       +  1 * floor((mem_free - memory_mb) / 100)
//!       + 50 if host.zone == preferred_zone
//! ```
//!
//! Ties go to the smallest host ID so placement is reproducible.

use minicloud_store::Host;

use crate::types::{Candidate, ResourceRequest};

/// Weight of each spare CPU left after placement.
pub const WEIGHT_CPU: i64 = 10;

/// Weight of each spare 100 MB of memory left after placement.
pub const WEIGHT_MEM: i64 = 1;

/// Bonus for a host in the preferred zone.
pub const ZONE_BONUS: i64 = 50;

/// Whether `host` has enough free capacity for `request`.
#[must_use]
pub const fn is_viable(host: &Host, request: &ResourceRequest) -> bool {
    host.cpu_free() >= request.cpu && host.memory_free_mb() >= request.memory_mb
}

/// Score of placing `request` on `host`, or `None` if the host is not viable.
#[must_use]
pub fn score(host: &Host, request: &ResourceRequest) -> Option<i64> {
    if !is_viable(host, request) {
        return None;
    }

    let cpu_left = i64::from(host.cpu_free() - request.cpu);
    let mem_left = i64::from((host.memory_free_mb() - request.memory_mb) / 100);
    let zone = match &request.preferred_zone {
        Some(zone) if *zone == host.zone => ZONE_BONUS,
        _ => 0,
    };

    Some(WEIGHT_CPU * cpu_left + WEIGHT_MEM * mem_left + zone)
}

/// Pick the best viable host.
///
/// Hosts may be given in any order; ties are broken by the smallest ID.
#[must_use]
pub fn select<'a, I>(hosts: I, request: &ResourceRequest) -> Option<Candidate>
where
    I: IntoIterator<Item = &'a Host>,
{
    let mut best: Option<(&Host, i64)> = None;

    for host in hosts {
        let Some(s) = score(host, request) else {
            continue;
        };
        best = match best {
            Some((current, current_score))
                if current_score > s || (current_score == s && current.id < host.id) =>
            {
                Some((current, current_score))
            }
            _ => Some((host, s)),
        };
    }

    best.map(|(host, score)| Candidate {
        host_id: host.id.clone(),
        score,
        generation: host.generation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn host(id: &str, zone: &str, cpu_free: u32, mem_free: u32) -> Host {
        Host::new(id.parse().unwrap(), id, zone, cpu_free, mem_free)
    }

    #[test]
    fn prefers_host_with_more_headroom() {
        let hosts = vec![
            host("host-001", "a", 8, 16384),
            host("host-002", "a", 4, 8192),
        ];
        let request = ResourceRequest::new(2, 4096);

        assert_eq!(score(&hosts[0], &request), Some(182));
        assert_eq!(score(&hosts[1], &request), Some(60));

        let chosen = select(&hosts, &request).unwrap();
        assert_eq!(chosen.host_id.as_str(), "host-001");
        assert_eq!(chosen.score, 182);
    }

    #[test]
    fn zone_bonus_applies_only_on_match() {
        let a = host("host-001", "a", 4, 4096);
        let b = host("host-002", "b", 4, 4096);
        let request = ResourceRequest::new(1, 1024).with_zone("b");

        assert_eq!(score(&a, &request), Some(30 + 30));
        assert_eq!(score(&b, &request), Some(30 + 30 + ZONE_BONUS));
        assert_eq!(
            select([&a, &b], &request).unwrap().host_id.as_str(),
            "host-002"
        );
    }

    #[test]
    fn ties_go_to_smallest_id() {
        let hosts = vec![
            host("host-b", "a", 4, 4096),
            host("host-a", "a", 4, 4096),
            host("host-c", "a", 4, 4096),
        ];
        let chosen = select(&hosts, &ResourceRequest::new(1, 512)).unwrap();
        assert_eq!(chosen.host_id.as_str(), "host-a");
    }

    #[test]
    fn no_viable_host() {
        let hosts = vec![host("host-001", "a", 1, 65536), host("host-002", "a", 16, 256)];
        assert!(select(&hosts, &ResourceRequest::new(2, 512)).is_none());
    }

    #[test]
    fn exact_fit_is_viable() {
        let h = host("host-001", "a", 2, 512);
        assert_eq!(score(&h, &ResourceRequest::new(2, 512)), Some(0));
    }

    fn arb_host(index: usize) -> impl Strategy<Value = Host> {
        (0u32..=32, 0u32..=65536, 0u32..=32, 0u32..=65536, prop_oneof!["a", "b", "c"])
            .prop_map(move |(cpu_total, mem_total, cpu_used, mem_used, zone)| {
                let mut h = Host::new(
                    format!("host-{index:03}").parse().unwrap(),
                    "h",
                    zone,
                    cpu_total,
                    mem_total,
                );
                h.cpu_allocated = cpu_used.min(cpu_total);
                h.memory_allocated_mb = mem_used.min(mem_total);
                h
            })
    }

    fn arb_hosts() -> impl Strategy<Value = Vec<Host>> {
        (0usize..8).prop_flat_map(|n| (0..n).map(arb_host).collect::<Vec<_>>())
    }

    proptest! {
        #[test]
        fn selection_is_optimal(
            mut hosts in arb_hosts(),
            cpu in 1u32..=16,
            memory_mb in 512u32..=32768,
            zone in proptest::option::of(prop_oneof!["a", "b", "c"]),
        ) {
            let request = ResourceRequest { cpu, memory_mb, preferred_zone: zone };
            hosts.reverse();
            let chosen = select(&hosts, &request);

            let viable: Vec<&Host> = hosts.iter().filter(|h| is_viable(h, &request)).collect();
            match chosen {
                None => prop_assert!(viable.is_empty()),
                Some(c) => {
                    let best = viable.iter().filter_map(|h| score(h, &request)).max().unwrap();
                    prop_assert_eq!(c.score, best);
                    let lowest_id = viable
                        .iter()
                        .filter(|h| score(h, &request) == Some(best))
                        .map(|h| h.id.clone())
                        .min()
                        .unwrap();
                    prop_assert_eq!(c.host_id, lowest_id);
                }
            }
        }
    }
}
