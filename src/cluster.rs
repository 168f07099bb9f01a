//! Cluster membership descriptor.
//!
//! A [`Cluster`] is the set of [`Member`]s a node is configured (or
//! discovered) to run with.  Its textual form is the one accepted by
//! `--bootstrap-config` and returned by the discovery service:
//! `name=url[,name=url...]`.  A name repeated with several URLs forms a
//! single member that owns all of them.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// The null member ID.  No member may carry it.
pub const NONE: u64 = 0;

/// Errors raised while building a [`Cluster`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// An entry was not of the form `name=url`.
    #[error("malformed cluster entry {0:?}: expected name=url")]
    MalformedEntry(String),

    /// A member was given without any peer URL.
    #[error("empty URL given for member {0:?}")]
    EmptyUrl(String),

    /// A peer URL could not be parsed or is not http(s).
    #[error("invalid peer URL {url:?} for member {name:?}")]
    InvalidUrl { name: String, url: String },

    /// Two members hash to (or were given) the same ID.
    #[error("member with id {0:016x} already exists")]
    DuplicateId(u64),

    /// The member ID is the null sentinel.
    #[error("cannot use none({NONE}) as member id")]
    NoneId,
}

/// A named participant in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    pub name: String,
    /// Sorted, deduplicated peer URLs.
    pub peer_urls: Vec<String>,
}

impl Member {
    /// Build a member, deriving its ID from its name and peer URLs.
    pub fn new(name: impl Into<String>, peer_urls: Vec<String>) -> Self {
        let name = name.into();
        let mut peer_urls = peer_urls;
        peer_urls.sort();
        peer_urls.dedup();
        let id = member_id(&name, &peer_urls);
        Self {
            id,
            name,
            peer_urls,
        }
    }

    /// The `name=url` pairs for this member, joined with commas.
    pub fn config_string(&self) -> String {
        self.peer_urls
            .iter()
            .map(|url| format!("{}={}", self.name, url))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// First eight bytes (big endian) of SHA-256 over the sorted URLs and name.
fn member_id(name: &str, sorted_urls: &[String]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(sorted_urls.join(",").as_bytes());
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(id)
}

/// The membership of a cluster, keyed by member ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cluster {
    members: BTreeMap<u64, Member>,
}

impl Cluster {
    /// Parse the `name=url[,name=url...]` form.
    pub fn parse(s: &str) -> Result<Self, ClusterError> {
        // Group URLs by name, keeping first-seen name order irrelevant.
        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, url) = entry
                .split_once('=')
                .ok_or_else(|| ClusterError::MalformedEntry(entry.to_string()))?;
            let name = name.trim();
            let url = url.trim();
            if name.is_empty() {
                return Err(ClusterError::MalformedEntry(entry.to_string()));
            }
            if url.is_empty() {
                return Err(ClusterError::EmptyUrl(name.to_string()));
            }
            validate_url(name, url)?;
            by_name
                .entry(name.to_string())
                .or_default()
                .push(url.to_string());
        }

        let mut cluster = Cluster::default();
        for (name, urls) in by_name {
            cluster.add(Member::new(name, urls))?;
        }
        Ok(cluster)
    }

    /// Add a member.  Fails if the ID is the null sentinel or already taken.
    pub fn add(&mut self, member: Member) -> Result<(), ClusterError> {
        if member.id == NONE {
            return Err(ClusterError::NoneId);
        }
        if self.members.contains_key(&member.id) {
            return Err(ClusterError::DuplicateId(member.id));
        }
        self.members.insert(member.id, member);
        Ok(())
    }

    /// Find the member with the given name.
    pub fn find_name(&self, name: &str) -> Option<&Member> {
        self.members.values().find(|m| m.name == name)
    }

    /// Find the member with the given ID.
    pub fn find_id(&self, id: u64) -> Option<&Member> {
        self.members.get(&id)
    }

    /// All member IDs, ascending.
    pub fn ids(&self) -> Vec<u64> {
        self.members.keys().copied().collect()
    }

    /// Every peer URL of every member, sorted.
    pub fn peer_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .members
            .values()
            .flat_map(|m| m.peer_urls.iter().cloned())
            .collect();
        urls.sort();
        urls
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<String> = self.members.values().map(Member::config_string).collect();
        entries.sort();
        f.write_str(&entries.join(","))
    }
}

fn validate_url(name: &str, url: &str) -> Result<(), ClusterError> {
    let invalid = || ClusterError::InvalidUrl {
        name: name.to_string(),
        url: url.to_string(),
    };
    let parsed = reqwest::Url::parse(url).map_err(|_| invalid())?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_member() {
        let cluster = Cluster::parse("node1=http://10.0.0.1:7001").unwrap();
        assert_eq!(cluster.len(), 1);
        let m = cluster.find_name("node1").unwrap();
        assert_eq!(m.peer_urls, vec!["http://10.0.0.1:7001".to_string()]);
        assert_ne!(m.id, NONE);
    }

    #[test]
    fn test_parse_repeated_name_merges_urls() {
        let cluster =
            Cluster::parse("a=http://h2:7001,a=http://h1:7001,b=http://h3:7001").unwrap();
        assert_eq!(cluster.len(), 2);
        let a = cluster.find_name("a").unwrap();
        assert_eq!(
            a.peer_urls,
            vec!["http://h1:7001".to_string(), "http://h2:7001".to_string()]
        );
    }

    #[test]
    fn test_member_id_is_deterministic() {
        let a = Member::new("a", vec!["http://h2:1".into(), "http://h1:1".into()]);
        let b = Member::new("a", vec!["http://h1:1".into(), "http://h2:1".into()]);
        assert_eq!(a.id, b.id);
        let c = Member::new("c", vec!["http://h1:1".into(), "http://h2:1".into()]);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(
            Cluster::parse("node1"),
            Err(ClusterError::MalformedEntry("node1".into()))
        );
        assert_eq!(
            Cluster::parse("node1="),
            Err(ClusterError::EmptyUrl("node1".into()))
        );
        assert!(matches!(
            Cluster::parse("node1=localhost:7001"),
            Err(ClusterError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_add_rejects_duplicate_and_none() {
        let mut cluster = Cluster::default();
        let m = Member::new("a", vec!["http://h:1".into()]);
        cluster.add(m.clone()).unwrap();
        assert_eq!(cluster.add(m.clone()), Err(ClusterError::DuplicateId(m.id)));

        let none = Member {
            id: NONE,
            name: "z".into(),
            peer_urls: vec!["http://z:1".into()],
        };
        assert_eq!(cluster.add(none), Err(ClusterError::NoneId));
    }

    #[test]
    fn test_ids_and_peer_urls_sorted() {
        let cluster = Cluster::parse("b=http://b:1,a=http://a:1,c=http://c:1").unwrap();
        let ids = cluster.ids();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(
            cluster.peer_urls(),
            vec!["http://a:1", "http://b:1", "http://c:1"]
        );
    }

    #[test]
    fn test_display_round_trip() {
        let cluster = Cluster::parse("b=http://b:1,a=http://a:1,a=http://a:2").unwrap();
        let text = cluster.to_string();
        assert_eq!(text, "a=http://a:1,a=http://a:2,b=http://b:1");
        assert_eq!(Cluster::parse(&text).unwrap(), cluster);
    }

    #[test]
    fn test_find_id() {
        let cluster = Cluster::parse("a=http://a:1").unwrap();
        let id = cluster.find_name("a").unwrap().id;
        assert_eq!(cluster.find_id(id).unwrap().name, "a");
        assert!(cluster.find_id(id.wrapping_add(1)).is_none());
    }
}
