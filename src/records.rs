//! In-memory DNS record store
//!
//! Holds the A/AAAA and CNAME records observed by the DNS proxy with
//! TTL-bounded deadlines. The store answers two questions for the group
//! engine:
//!
//! - which addresses are currently known for a name (`get_a`), and
//! - which observed names eventually resolve *to* a name through CNAME
//!   hops (`aliases`).
//!
//! Names are stored lowercase without the trailing dot. Expired entries
//! are purged lazily on the read path; purging takes the write lock so
//! reads stay serialized with writers. Callers never hold the lock across
//! external I/O.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// A live address record with its expiry deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ARecord {
    /// The address (v4 or v6)
    pub address: IpAddr,
    /// Absolute deadline after which the record is expired
    pub deadline: Instant,
}

impl ARecord {
    /// Remaining lifetime in whole seconds, zero if expired
    #[must_use]
    pub fn remaining_secs(&self, now: Instant) -> u32 {
        let remaining = self.deadline.saturating_duration_since(now).as_secs();
        u32::try_from(remaining).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Default)]
struct RecordsInner {
    /// name -> address -> deadline (v4 and v6 share the map)
    a_records: HashMap<String, HashMap<IpAddr, Instant>>,
    /// name -> cname target -> deadline
    cname_records: HashMap<String, HashMap<String, Instant>>,
}

/// Concurrent DNS record store
///
/// Single-writer / multi-reader via an internal [`RwLock`]; see the
/// module docs for the purge discipline.
#[derive(Debug, Default)]
pub struct Records {
    inner: RwLock<RecordsInner>,
}

impl Records {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an A/AAAA answer for `name`
    ///
    /// The deadline only ever moves forward: a refresh with a shorter TTL
    /// than the remaining lifetime leaves the entry untouched, so
    /// concurrent answers for the same `(name, addr)` settle on the later
    /// deadline.
    pub fn put_a(&self, name: &str, address: IpAddr, ttl_secs: u32) {
        let deadline = Instant::now() + Duration::from_secs(u64::from(ttl_secs));
        let mut inner = self.inner.write();
        let entry = inner
            .a_records
            .entry(normalize(name))
            .or_default()
            .entry(address)
            .or_insert(deadline);
        if deadline > *entry {
            *entry = deadline;
        }
    }

    /// Record a CNAME answer `name -> target`
    ///
    /// Same later-deadline-wins semantics as [`Records::put_a`].
    pub fn put_cname(&self, name: &str, target: &str, ttl_secs: u32) {
        let deadline = Instant::now() + Duration::from_secs(u64::from(ttl_secs));
        let mut inner = self.inner.write();
        let entry = inner
            .cname_records
            .entry(normalize(name))
            .or_default()
            .entry(normalize(target))
            .or_insert(deadline);
        if deadline > *entry {
            *entry = deadline;
        }
    }

    /// Live A/AAAA entries for `name` (no CNAME recursion)
    ///
    /// Expired entries encountered on the way are removed.
    pub fn get_a(&self, name: &str) -> Vec<ARecord> {
        let now = Instant::now();
        let name = normalize(name);
        let mut inner = self.inner.write();

        let Some(entries) = inner.a_records.get_mut(&name) else {
            return Vec::new();
        };

        entries.retain(|_, deadline| *deadline > now);

        let records = entries
            .iter()
            .map(|(address, deadline)| ARecord {
                address: *address,
                deadline: *deadline,
            })
            .collect();

        if entries.is_empty() {
            inner.a_records.remove(&name);
        }

        records
    }

    /// All names that resolve to `name` through zero or more CNAME hops
    ///
    /// The result always contains `name` itself. Cycles are tolerated:
    /// every visited name is recorded and never revisited, so the walk is
    /// finite. Expired CNAME entries are ignored and purged.
    pub fn aliases(&self, name: &str) -> Vec<String> {
        let now = Instant::now();
        let name = normalize(name);
        let mut inner = self.inner.write();

        // Purge expired CNAMEs, then build the reverse relation
        // (target -> owners) for this walk.
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        inner.cname_records.retain(|_, targets| {
            targets.retain(|_, deadline| *deadline > now);
            !targets.is_empty()
        });
        for (owner, targets) in &inner.cname_records {
            for target in targets.keys() {
                reverse.entry(target.as_str()).or_default().push(owner.as_str());
            }
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut order: Vec<String> = Vec::new();
        let mut queue: Vec<&str> = vec![name.as_str()];

        while let Some(current) = queue.pop() {
            if !visited.insert(current) {
                continue;
            }
            order.push(current.to_string());
            if let Some(owners) = reverse.get(current) {
                for owner in owners {
                    if !visited.contains(owner) {
                        queue.push(owner);
                    }
                }
            }
        }

        order
    }

    /// Union of all names known to the store
    ///
    /// Used for full reconciliation when a group is added at runtime.
    pub fn list_known_domains(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: HashSet<&String> = inner.a_records.keys().collect();
        names.extend(inner.cname_records.keys());
        names.into_iter().cloned().collect()
    }
}

/// Lowercase and strip the trailing dot of a DNS name
fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_put_and_get_a() {
        let records = Records::new();
        records.put_a("example.com", addr("1.2.3.4"), 60);

        let entries = records.get_a("example.com");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].address, addr("1.2.3.4"));
        assert!(entries[0].remaining_secs(Instant::now()) <= 60);
    }

    #[test]
    fn test_name_normalization() {
        let records = Records::new();
        records.put_a("Example.COM.", addr("1.2.3.4"), 60);

        assert_eq!(records.get_a("example.com").len(), 1);
        assert_eq!(records.get_a("example.com.").len(), 1);
    }

    #[test]
    fn test_v4_and_v6_share_the_map() {
        let records = Records::new();
        records.put_a("dual.example", addr("1.2.3.4"), 60);
        records.put_a("dual.example", addr("2001:db8::1"), 60);

        let entries = records.get_a("dual.example");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_expired_entries_are_purged_on_read() {
        let records = Records::new();
        records.put_a("gone.example", addr("1.2.3.4"), 0);

        assert!(records.get_a("gone.example").is_empty());
        // The key itself is gone too.
        assert!(records.list_known_domains().is_empty());
    }

    #[test]
    fn test_later_deadline_wins() {
        let records = Records::new();
        records.put_a("example.com", addr("1.2.3.4"), 50);
        records.put_a("example.com", addr("1.2.3.4"), 100);

        let long = records.get_a("example.com")[0].deadline;

        // A refresh with a shorter TTL must not shorten the deadline.
        records.put_a("example.com", addr("1.2.3.4"), 10);
        let after = records.get_a("example.com")[0].deadline;
        assert_eq!(after, long);
    }

    #[test]
    fn test_aliases_without_cnames() {
        let records = Records::new();
        assert_eq!(records.aliases("example.com"), vec!["example.com"]);
    }

    #[test]
    fn test_aliases_reverse_chain() {
        let records = Records::new();
        // svc.corp -> a.cdn, www.svc.corp -> svc.corp
        records.put_cname("svc.corp", "a.cdn", 300);
        records.put_cname("www.svc.corp", "svc.corp", 300);

        let mut aliases = records.aliases("a.cdn");
        aliases.sort();
        assert_eq!(aliases, vec!["a.cdn", "svc.corp", "www.svc.corp"]);

        // Forward direction yields only the name itself plus direct owners.
        let aliases = records.aliases("www.svc.corp");
        assert_eq!(aliases, vec!["www.svc.corp"]);
    }

    #[test]
    fn test_aliases_cycle_terminates() {
        let records = Records::new();
        records.put_cname("a.example", "b.example", 300);
        records.put_cname("b.example", "a.example", 300);

        let mut aliases = records.aliases("a.example");
        aliases.sort();
        assert_eq!(aliases, vec!["a.example", "b.example"]);

        // Self-referential entry is also finite.
        records.put_cname("loop.example", "loop.example", 300);
        assert_eq!(records.aliases("loop.example"), vec!["loop.example"]);
    }

    #[test]
    fn test_aliases_ignores_expired_cnames() {
        let records = Records::new();
        records.put_cname("old.example", "target.example", 0);

        assert_eq!(records.aliases("target.example"), vec!["target.example"]);
    }

    #[test]
    fn test_list_known_domains() {
        let records = Records::new();
        records.put_a("a.example", IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 60);
        records.put_cname("b.example", "a.example", 60);

        let mut names = records.list_known_domains();
        names.sort();
        assert_eq!(names, vec!["a.example", "b.example"]);
    }
}
