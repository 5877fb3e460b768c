use std::collections::{HashMap, HashSet};

use clippy_utilities::OverflowArithmetic;

use crate::consts::{DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT};

use super::Error;

/// One participant of the replicated store's consensus group.
/// Exactly one workload instance runs per member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Member {
    /// Member name, `<cluster>-<4-digit-counter>`
    pub(crate) name: String,
    /// Id assigned by the data plane on join, zero until known
    pub(crate) id: u64,
    /// Advertised peer urls
    pub(crate) peer_urls: Vec<String>,
    /// Advertised client urls
    pub(crate) client_urls: Vec<String>,
}

impl Member {
    /// A member that is not yet registered with the data plane
    pub(crate) fn new(name: &str, namespace: &str, cluster_suffix: &str) -> Self {
        Self {
            name: name.to_owned(),
            id: 0,
            peer_urls: vec![peer_url(name, namespace, cluster_suffix)],
            client_urls: vec![client_url(name, namespace, cluster_suffix)],
        }
    }
}

/// The name of the member carrying the sequence number `seq`
pub(crate) fn member_name(cluster_name: &str, seq: u64) -> String {
    format!("{cluster_name}-{seq:04}")
}

/// Extract the sequence number a member name carries.
/// Member names end with `-<decimal counter>`, a name that does not parse
/// halts the reconciliation of its cluster.
pub(crate) fn member_ordinal(name: &str) -> Result<u64, Error> {
    name.rsplit_once('-')
        .and_then(|(_, seq)| seq.parse().ok())
        .ok_or_else(|| Error::BadMemberName(name.to_owned()))
}

/// The in-cluster peer url of a member, routed by its per-member service
pub(crate) fn peer_url(name: &str, namespace: &str, cluster_suffix: &str) -> String {
    format!("http://{name}.{namespace}.svc.{cluster_suffix}:{DEFAULT_PEER_PORT}")
}

/// The in-cluster client url of a member, routed by its per-member service
pub(crate) fn client_url(name: &str, namespace: &str, cluster_suffix: &str) -> String {
    format!("http://{name}.{namespace}.svc.{cluster_suffix}:{DEFAULT_CLIENT_PORT}")
}

/// The set of currently known members, keyed by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MemberSet {
    /// Members by name
    members: HashMap<String, Member>,
}

impl MemberSet {
    /// Insert a member, replacing a member of the same name
    pub(crate) fn insert(&mut self, member: Member) {
        let _prev = self.members.insert(member.name.clone(), member);
    }

    /// Remove a member by name
    pub(crate) fn remove(&mut self, name: &str) -> Option<Member> {
        self.members.remove(name)
    }

    /// Look up a member by name
    pub(crate) fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    /// Number of members
    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the set is empty
    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// All member names
    pub(crate) fn names(&self) -> HashSet<String> {
        self.members.keys().cloned().collect()
    }

    /// Members without a counterpart in `instances`, ordered by name.
    /// These members lost their instance and are dead to the data plane.
    pub(crate) fn absent_from(&self, instances: &HashSet<String>) -> Vec<&Member> {
        let mut absent: Vec<_> = self
            .members
            .values()
            .filter(|member| !instances.contains(&member.name))
            .collect();
        absent.sort_by(|a, b| a.name.cmp(&b.name));
        absent
    }

    /// `name=peer_url` pairs, the bootstrap peer list of a joining instance
    pub(crate) fn peer_url_pairs(&self) -> String {
        let mut pairs: Vec<_> = self
            .members
            .values()
            .flat_map(|member| {
                member
                    .peer_urls
                    .iter()
                    .map(move |url| format!("{}={url}", member.name))
            })
            .collect();
        pairs.sort();
        pairs.join(",")
    }

    /// The quorum size of this membership
    pub(crate) fn quorum(&self) -> usize {
        (self.members.len() / 2).overflow_add(1)
    }

    /// The smallest sequence number no current member name reaches.
    /// Bootstraps the name counter after a controller restart.
    pub(crate) fn next_seq(&self) -> Result<u64, Error> {
        self.members.keys().try_fold(0, |acc: u64, name| {
            Ok(acc.max(member_ordinal(name)?.overflow_add(1)))
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::{member_name, member_ordinal, Member, MemberSet};

    fn member(name: &str) -> Member {
        Member::new(name, "default", "cluster.local")
    }

    #[test]
    fn name_seq_round_trip() {
        for seq in [0, 7, 42, 9999, 10000] {
            let name = member_name("my-etcd", seq);
            assert_eq!(member_ordinal(&name).unwrap(), seq);
        }
        assert_eq!(member_name("my-etcd", 3), "my-etcd-0003");
    }

    #[test]
    fn bad_member_name_does_not_parse() {
        for bad in ["boot", "my-etcd-abc", "my-etcd-"] {
            assert!(member_ordinal(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn urls_route_through_the_member_service() {
        let m = member("my-etcd-0001");
        assert_eq!(
            m.peer_urls,
            vec!["http://my-etcd-0001.default.svc.cluster.local:2380".to_owned()]
        );
        assert_eq!(
            m.client_urls,
            vec!["http://my-etcd-0001.default.svc.cluster.local:2379".to_owned()]
        );
    }

    #[test]
    fn absent_from_is_the_set_difference() {
        let mut members = MemberSet::default();
        members.insert(member("c-0000"));
        members.insert(member("c-0001"));
        members.insert(member("c-0002"));

        let instances: HashSet<String> = ["c-0000", "c-0002"]
            .iter()
            .map(|name| (*name).to_owned())
            .collect();
        let absent = members.absent_from(&instances);
        assert_eq!(absent.len(), 1);
        assert_eq!(absent[0].name, "c-0001");

        let all: HashSet<String> = members.names();
        assert!(members.absent_from(&all).is_empty());
    }

    #[test]
    fn peer_url_pairs_build_the_bootstrap_list() {
        let mut members = MemberSet::default();
        members.insert(member("c-0001"));
        members.insert(member("c-0000"));
        assert_eq!(
            members.peer_url_pairs(),
            format!(
                "c-0000={},c-0001={}",
                "http://c-0000.default.svc.cluster.local:2380",
                "http://c-0001.default.svc.cluster.local:2380"
            )
        );
    }

    #[test]
    fn quorum_is_a_majority() {
        let mut members = MemberSet::default();
        assert_eq!(members.quorum(), 1);
        for (seq, quorum) in [(0, 1), (1, 2), (2, 2), (3, 3), (4, 3)] {
            members.insert(member(&member_name("c", seq)));
            assert_eq!(members.quorum(), quorum);
        }
    }

    #[test]
    fn next_seq_scans_the_largest_suffix() {
        let mut members = MemberSet::default();
        assert_eq!(members.next_seq().unwrap(), 0);
        members.insert(member("c-0004"));
        members.insert(member("c-0002"));
        assert_eq!(members.next_seq().unwrap(), 5);

        members.insert(member("c-nonsense"));
        assert!(members.next_seq().is_err());
    }
}
