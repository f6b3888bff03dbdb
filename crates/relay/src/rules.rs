use std::{collections::HashMap, net::SocketAddr};

use ahash::AHashMap;

use crate::Error;

/// Forwarding rules, fixed for the lifetime of one broker.
///
/// A *match key* is one or more source IPs joined by `;`; the value is the
/// `host:port` the matching backend dials the broker from. The same table
/// answers both directions: which key owns a client's claimed source IP,
/// and which key a newly accepted socket registers under.
///
/// Keys are unique, every IP component appears in at most one key, and a
/// key maps to exactly one backend address, so both lookups are
/// unambiguous linear scans.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: AHashMap<String, String>,
}

impl RuleTable {
    /// Rule updates go through a broker restart, never through a live
    /// table, which is why construction takes the map by value.
    pub fn new(rules: HashMap<String, String>) -> Result<Self, Error> {
        if rules.is_empty() {
            return Err(Error::EmptyRuleTable);
        }

        Ok(Self {
            rules: rules.into_iter().collect(),
        })
    }

    /// The match key owning a client source IP: any `;`-separated
    /// component equal to the IP claims it.
    pub fn source_key(&self, ip: &str) -> Option<&str> {
        self.rules
            .keys()
            .find(|key| key.split(';').any(|component| component == ip))
            .map(String::as_str)
    }

    /// The match key of a registering backend, identified by the exact
    /// `host:port` it dialed from.
    pub fn backend_key(&self, peer: &SocketAddr) -> Option<&str> {
        let peer = peer.to_string();
        self.rules
            .iter()
            .find(|(_, backend)| **backend == peer)
            .map(|(key, _)| key.as_str())
    }
}
