use std::collections::{HashMap, HashSet};

use clippy_utilities::OverflowArithmetic;
use crd_api::ClusterPhase;
use tracing::{info, warn};

use super::etcd;
use super::k8s::{ClusterState, PodPlan, PodSummary};
use super::member::{client_url, member_name, Member, MemberSet};
use super::{Cluster, Error};

/// The single corrective action of one reconciliation tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Step {
    /// Remove a member whose instance is gone from the data plane
    RemoveDead(String),
    /// Delete an instance that is not registered as a member
    RemoveOrphan(String),
    /// Register and start one new member
    Grow,
    /// Remove one member to approach the desired size
    Shrink(String),
    /// Recreate one instance at the target version
    Upgrade(String),
    /// The observed state matches the specification
    InSync,
}

/// Decide the next corrective action from the data-plane view `members` and
/// the orchestrator view `running`. At most one action fires per tick, so
/// the membership never moves by more than a one-member delta and quorum
/// survives any single step.
pub(super) fn next_step(
    members: &MemberSet,
    running: &HashSet<String>,
    versions: &HashMap<String, String>,
    desired_size: usize,
    desired_version: &str,
) -> Step {
    // dead members leave the data plane before anything is added
    if let Some(dead) = members.absent_from(running).first() {
        return Step::RemoveDead(dead.name.clone());
    }
    let known = members.names();
    let mut orphans: Vec<_> = running.difference(&known).cloned().collect();
    orphans.sort();
    if let Some(orphan) = orphans.into_iter().next() {
        return Step::RemoveOrphan(orphan);
    }
    if members.len() < desired_size {
        return Step::Grow;
    }
    if members.len() > desired_size {
        // the zero-padded counter makes the lexicographic maximum the youngest
        if let Some(victim) = members.names().into_iter().max() {
            return Step::Shrink(victim);
        }
    }
    let desired = desired_version.trim_start_matches('v');
    let mut outdated: Vec<_> = versions
        .iter()
        .filter(|(_, version)| version.trim_start_matches('v') != desired)
        .map(|(name, _)| name.clone())
        .collect();
    outdated.sort();
    match outdated.into_iter().next() {
        Some(name) => Step::Upgrade(name),
        None => Step::InSync,
    }
}

impl Cluster {
    /// One reconciliation step
    pub(super) async fn reconcile_once(&mut self) -> Result<(), Error> {
        if self.resource.spec.paused {
            self.status.phase = ClusterPhase::Paused;
            self.status.control_paused = self.status.control_paused.overflow_add(1);
            return Ok(());
        }
        self.status.phase = ClusterPhase::Running;
        self.status.control_ticks = self.status.control_ticks.overflow_add(1);

        let pods = self.k8s.list_pods().await?;
        let pending = pods
            .iter()
            .filter(|pod| pod.phase == "Pending" || pod.phase == "Unknown")
            .count();
        if pending > 0 {
            return Err(Error::NotReady(format!(
                "{pending} instances are still materializing"
            )));
        }
        let running: Vec<&PodSummary> = pods.iter().filter(|pod| pod.phase == "Running").collect();
        if running.is_empty() {
            return self.disaster_recovery(&pods).await;
        }
        self.reconcile_membership(&running).await?;
        let mut names: Vec<String> = self.members.names().into_iter().collect();
        names.sort();
        self.status.members = names;
        Ok(())
    }

    /// Synchronize the data-plane view and drive it one step towards the spec
    async fn reconcile_membership(&mut self, running: &[&PodSummary]) -> Result<(), Error> {
        let endpoints: Vec<String> = running
            .iter()
            .map(|pod| client_url(&pod.name, &self.namespace, &self.cluster_suffix))
            .collect();
        self.sync_members(&endpoints).await?;

        let running_names: HashSet<String> =
            running.iter().map(|pod| pod.name.clone()).collect();
        let versions: HashMap<String, String> = running
            .iter()
            .filter_map(|pod| {
                pod.version
                    .clone()
                    .map(|version| (pod.name.clone(), version))
            })
            .collect();
        let step = next_step(
            &self.members,
            &running_names,
            &versions,
            self.resource.spec.size,
            &self.resource.spec.version_tag(),
        );
        match step {
            Step::RemoveDead(name) => self.remove_dead_member(&endpoints, &name).await,
            Step::RemoveOrphan(name) => {
                warn!("cluster {}: deleting orphan instance {name}", self.name);
                self.k8s.delete_pod(&name).await
            }
            Step::Grow => self.add_one_member(&endpoints).await,
            Step::Shrink(name) => self.remove_one_member(&endpoints, &name).await,
            Step::Upgrade(name) => {
                info!(
                    "cluster {}: recreating instance {name} at version {}",
                    self.name,
                    self.resource.spec.version_tag()
                );
                // the replacement joins through the regular removal and growth paths
                self.k8s.delete_pod(&name).await
            }
            Step::InSync => Ok(()),
        }
    }

    /// Rebuild the in-memory membership from the data plane and advance the
    /// name counter. A member with an empty name has not started yet, the
    /// whole tick is skipped until the view settles.
    async fn sync_members(&mut self, endpoints: &[String]) -> Result<(), Error> {
        let raw = etcd::member_list(endpoints).await?;
        if raw.iter().any(|member| member.name.is_empty()) {
            return Err(Error::NotReady(
                "a data-plane member has not published its name yet".to_owned(),
            ));
        }
        let mut members = MemberSet::default();
        for member in raw {
            members.insert(member);
        }
        self.seq = self.seq.max(members.next_seq()?);
        self.members = members;
        Ok(())
    }

    /// Remove a member whose instance disappeared, then drop its lingering
    /// resources
    async fn remove_dead_member(&mut self, endpoints: &[String], name: &str) -> Result<(), Error> {
        let Some(member) = self.members.get(name) else {
            return Ok(());
        };
        let id = member.id;
        etcd::member_remove(endpoints, id).await?;
        let _removed = self.members.remove(name);
        info!(
            "cluster {}: removed dead member {name}, quorum is now {}",
            self.name,
            self.members.quorum()
        );
        self.k8s.delete_pod(name).await?;
        self.k8s.delete_service(name).await?;
        Ok(())
    }

    /// Register one fresh member with the data plane, then start its
    /// instance with the current member set as the bootstrap peer list
    async fn add_one_member(&mut self, endpoints: &[String]) -> Result<(), Error> {
        let name = member_name(&self.name, self.seq);
        let mut member = Member::new(&name, &self.namespace, &self.cluster_suffix);
        let added = etcd::member_add(endpoints, member.peer_urls.clone()).await?;
        member.id = added.id;
        self.members.insert(member.clone());
        self.seq = self.seq.overflow_add(1);
        self.k8s.create_member_service(&name).await?;
        let plan = PodPlan {
            initial_cluster: self.members.peer_url_pairs(),
            member,
            cluster_state: ClusterState::Existing,
            token: None,
            recovery: None,
        };
        self.k8s.create_member_pod(&plan).await?;
        info!("cluster {}: added member {name}", self.name);
        Ok(())
    }

    /// Remove one member to shrink towards the desired size
    async fn remove_one_member(&mut self, endpoints: &[String], name: &str) -> Result<(), Error> {
        let Some(member) = self.members.get(name) else {
            return Ok(());
        };
        let id = member.id;
        etcd::member_remove(endpoints, id).await?;
        let _removed = self.members.remove(name);
        self.k8s.delete_pod(name).await?;
        self.k8s.delete_service(name).await?;
        info!("cluster {}: removed member {name}", self.name);
        Ok(())
    }

    /// No instance is left. With a backup and a snapshot the cluster reseeds
    /// itself from the latest snapshot, otherwise the failure is terminal.
    async fn disaster_recovery(&mut self, residual: &[PodSummary]) -> Result<(), Error> {
        let snapshot_exists = match self.backup {
            Some(ref coordinator) => coordinator.latest_snapshot_exists().await?,
            None => false,
        };
        if !snapshot_exists {
            return Err(Error::NoBackup);
        }
        warn!(
            "cluster {}: no live instance left, recovering from the latest snapshot",
            self.name
        );
        // drop the residual instances and bookkeeping before reseeding
        for pod in residual {
            self.k8s.delete_pod(&pod.name).await?;
            self.k8s.delete_service(&pod.name).await?;
        }
        if !self.members.is_empty() {
            let stale: Vec<String> = self.members.names().into_iter().collect();
            for member in stale {
                self.k8s.delete_service(&member).await?;
            }
            self.members = MemberSet::default();
        }
        self.create_seed_member(true).await
    }
}

#[cfg(test)]
mod test {
    use std::collections::{HashMap, HashSet};

    use crate::cluster::member::{member_name, Member, MemberSet};

    use super::{next_step, Step};

    fn member_set(names: &[&str]) -> MemberSet {
        let mut members = MemberSet::default();
        for name in names {
            members.insert(Member::new(name, "default", "cluster.local"));
        }
        members
    }

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|name| (*name).to_owned()).collect()
    }

    fn versions(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, version)| ((*name).to_owned(), (*version).to_owned()))
            .collect()
    }

    fn uniform_versions(list: &[&str], version: &str) -> HashMap<String, String> {
        list.iter().map(|name| ((*name).to_owned(), version.to_owned())).collect()
    }

    #[test]
    fn dead_member_removal_precedes_everything() {
        let members = member_set(&["c-0000", "c-0001", "c-0002"]);
        let running = names(&["c-0000", "c-0002"]);
        // even though the cluster is undersized, the dead member goes first
        let step = next_step(
            &members,
            &running,
            &uniform_versions(&["c-0000", "c-0002"], "v3.1.0"),
            5,
            "v3.1.0",
        );
        assert_eq!(step, Step::RemoveDead("c-0001".to_owned()));
    }

    #[test]
    fn orphan_instances_are_deleted_not_adopted() {
        let members = member_set(&["c-0000"]);
        let running = names(&["c-0000", "intruder"]);
        let step = next_step(
            &members,
            &running,
            &uniform_versions(&["c-0000"], "v3.1.0"),
            3,
            "v3.1.0",
        );
        assert_eq!(step, Step::RemoveOrphan("intruder".to_owned()));
    }

    #[test]
    fn grow_one_member_at_a_time() {
        let members = member_set(&["c-0000"]);
        let running = names(&["c-0000"]);
        let step = next_step(
            &members,
            &running,
            &uniform_versions(&["c-0000"], "v3.1.0"),
            3,
            "v3.1.0",
        );
        assert_eq!(step, Step::Grow);
    }

    #[test]
    fn shrink_removes_the_youngest_member() {
        let all = ["c-0000", "c-0001", "c-0002", "c-0003", "c-0004"];
        let members = member_set(&all);
        let step = next_step(
            &members,
            &names(&all),
            &uniform_versions(&all, "v3.1.0"),
            3,
            "v3.1.0",
        );
        assert_eq!(step, Step::Shrink("c-0004".to_owned()));
    }

    #[test]
    fn upgrade_recreates_exactly_one_outdated_instance() {
        let all = ["c-0000", "c-0001", "c-0002"];
        let members = member_set(&all);
        let mixed = versions(&[
            ("c-0000", "v3.2.0"),
            ("c-0001", "v3.1.0"),
            ("c-0002", "v3.1.0"),
        ]);
        let step = next_step(&members, &names(&all), &mixed, 3, "v3.2.0");
        assert_eq!(step, Step::Upgrade("c-0001".to_owned()));
    }

    #[test]
    fn version_prefix_does_not_trigger_upgrades() {
        let all = ["c-0000"];
        let members = member_set(&all);
        let step = next_step(
            &members,
            &names(&all),
            &uniform_versions(&all, "3.2.13"),
            1,
            "v3.2.13",
        );
        assert_eq!(step, Step::InSync);
    }

    #[test]
    fn steady_state_is_a_no_op() {
        let all = ["c-0000", "c-0001", "c-0002"];
        let members = member_set(&all);
        let step = next_step(
            &members,
            &names(&all),
            &uniform_versions(&all, "v3.1.0"),
            3,
            "v3.1.0",
        );
        assert_eq!(step, Step::InSync);
    }

    #[test]
    fn fresh_bootstrap_grows_to_the_desired_size() {
        // tick by tick from the seed member, every tick adds exactly one
        let mut present = vec!["c-0000".to_owned()];
        let mut seq = 1;
        loop {
            let refs: Vec<&str> = present.iter().map(String::as_str).collect();
            let members = member_set(&refs);
            let step = next_step(
                &members,
                &names(&refs),
                &uniform_versions(&refs, "v3.1.0"),
                3,
                "v3.1.0",
            );
            if step == Step::InSync {
                break;
            }
            assert_eq!(step, Step::Grow);
            present.push(member_name("c", seq));
            seq += 1;
        }
        assert_eq!(present, vec!["c-0000", "c-0001", "c-0002"]);
    }

    #[test]
    fn rolling_upgrade_converges_one_instance_per_tick() {
        // 3 members at the old version, the upgrade recreates instances one
        // by one through delete, dead-member removal and growth
        let mut members = member_set(&["c-0000", "c-0001", "c-0002"]);
        let mut versions = uniform_versions(&["c-0000", "c-0001", "c-0002"], "v3.1.0");
        let mut seq = 3;
        let mut mutations = 0;
        loop {
            let running: HashSet<String> = versions.keys().cloned().collect();
            let step = next_step(&members, &running, &versions, 3, "v3.2.0");
            match step {
                Step::Upgrade(name) => {
                    // the instance is deleted, the member lingers in the data plane
                    let _old = versions.remove(&name);
                }
                Step::RemoveDead(name) => {
                    let _gone = members.remove(&name);
                }
                Step::Grow => {
                    let name = member_name("c", seq);
                    seq += 1;
                    members.insert(Member::new(&name, "default", "cluster.local"));
                    let _new = versions.insert(name, "v3.2.0".to_owned());
                }
                Step::InSync => break,
                Step::RemoveOrphan(_) | Step::Shrink(_) => {
                    panic!("unexpected step {step:?}")
                }
            }
            mutations += 1;
            assert!(mutations < 20, "the upgrade must converge");
        }
        assert_eq!(members.len(), 3);
        assert!(versions.values().all(|version| version == "v3.2.0"));
        // names were never reused
        assert!(members.names().iter().all(|name| name.as_str() != "c-0000"));
    }
}
