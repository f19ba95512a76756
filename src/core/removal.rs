//! State removal: computes the transitive closure of states and external
//! datasets a removal would take with it, gates on confirmation, and
//! destroys in dependency order (children before parents, clones before the
//! snapshot they came from).

use super::{Machines, RemovalNeedsConfirmation, StateSel};
use crate::parsing::{remove_tag, split_snapshot_name};
use crate::sys::zfs::{Dataset, Transaction, Zfs, PROP_BOOTFS_DATASETS};
use crate::sys::CancelToken;
use anyhow::{anyhow, bail, Result};
use std::collections::{HashMap, HashSet};

/// What a removal will touch, in destruction order.
#[derive(Debug, Clone, Default)]
pub struct RemovalPlan {
    pub states: Vec<String>,
    pub external_datasets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum DepState {
    System {
        machine_id: String,
        id: String,
    },
    User {
        machine_id: String,
        user: String,
        id: String,
        /// System state being removed alongside; its tag is stripped instead
        /// of destroying outright, unless the tag list empties.
        linked_state_id: Option<String>,
    },
}

impl DepState {
    fn id(&self) -> &str {
        match self {
            DepState::System { id, .. } => id,
            DepState::User { id, .. } => id,
        }
    }
}

#[derive(Default)]
struct DatasetIndex {
    system: HashMap<String, (String, String)>,
    user: HashMap<String, (String, String, String)>,
}

struct DependencyWalk<'a> {
    machines: &'a Machines,
    zfs: &'a dyn Zfs,
    index: DatasetIndex,
    out: Vec<DepState>,
    external: Vec<Dataset>,
    pushed: HashSet<(String, Option<String>)>,
    expanded: HashSet<String>,
}

impl Machines {
    fn dataset_index(&self) -> DatasetIndex {
        let mut index = DatasetIndex::default();
        for machine in self.all.values() {
            for state in machine.all_states() {
                for d in state.system_datasets() {
                    index
                        .system
                        .entry(d.name.clone())
                        .or_insert_with(|| (machine.id.clone(), state.id.clone()));
                }
            }
            for (user, routes) in &machine.all_users_states {
                for us in routes.values() {
                    for d in us.all_datasets() {
                        index
                            .user
                            .entry(d.name.clone())
                            .or_insert_with(|| (machine.id.clone(), user.clone(), us.id.clone()));
                    }
                }
            }
        }
        index
    }

    /// Removes a state after resolving what depends on it.
    ///
    /// Without `force` the call fails with [`RemovalNeedsConfirmation`] when
    /// anything beyond the state and its own user states is affected. With
    /// `dryrun` the plan is returned and nothing is destroyed.
    pub fn remove_state(
        &mut self,
        ctx: &CancelToken,
        zfs: &dyn Zfs,
        name: &str,
        user: Option<&str>,
        force: bool,
        dryrun: bool,
    ) -> Result<RemovalPlan> {
        let sel = self.id_to_state(name, user)?;
        if let Some(machine) = self.current() {
            if sel.user.is_none() {
                if let Some(root) = super::cmdline::root_from_cmdline(&self.cmdline) {
                    if machine.booted_state_id(&root).ok() == Some(sel.id.clone()) {
                        bail!("cannot remove the current state {}", sel.id);
                    }
                }
            }
        }

        let mut walk = DependencyWalk {
            machines: self,
            zfs,
            index: self.dataset_index(),
            out: Vec::new(),
            external: Vec::new(),
            pushed: HashSet::new(),
            expanded: HashSet::new(),
        };
        match &sel.user {
            None => walk.push_system(&sel.machine_id, &sel.id)?,
            Some(user) => walk.push_user(&sel.machine_id, user, &sel.id, None)?,
        }
        let (deps, external) = (walk.out, walk.external);

        if !force {
            let extra: Vec<String> = deps
                .iter()
                .filter(|d| match d {
                    DepState::System { id, .. } => *id != sel.id,
                    DepState::User { id, linked_state_id, .. } => {
                        *id != sel.id && linked_state_id.as_deref() != Some(sel.id.as_str())
                    }
                })
                .map(|d| d.id().to_string())
                .collect();
            if !extra.is_empty() || !external.is_empty() {
                return Err(RemovalNeedsConfirmation {
                    id: sel.id,
                    states: extra,
                    datasets: external.iter().map(|d| d.name.clone()).collect(),
                }
                .into());
            }
        }

        if sel.user.is_some() {
            let offenders: Vec<String> = deps
                .iter()
                .filter_map(|d| match d {
                    DepState::User { id, .. } if *id != sel.id => self
                        .parent_system_state(id)
                        .map(|(_, s)| format!("{} (linked to {})", id, s.id)),
                    _ => None,
                })
                .collect();
            if !offenders.is_empty() {
                bail!(
                    "user state {} has dependent user states linked to system states: {}",
                    sel.id,
                    offenders.join(", ")
                );
            }
        }

        let plan = RemovalPlan {
            states: deps.iter().map(|d| d.id().to_string()).collect(),
            external_datasets: external.iter().map(|d| d.name.clone()).collect(),
        };
        if dryrun {
            return Ok(plan);
        }

        for d in external.iter().rev() {
            ctx.ensure()?;
            zfs.destroy(&d.name)?;
        }
        self.destroy_states(ctx, zfs, &sel, &deps)?;
        self.rescan(ctx, zfs)?;
        Ok(plan)
    }

    fn destroy_states(&self, ctx: &CancelToken, zfs: &dyn Zfs, sel: &StateSel, deps: &[DepState]) -> Result<()> {
        // Filesystem datasets scheduled for recursive destruction: their
        // snapshots go down with them and must not be destroyed separately.
        let mut doomed_filesystems: HashSet<String> = HashSet::new();
        for dep in deps {
            match dep {
                DepState::System { machine_id, id } if !id.contains('@') => {
                    if let Some(state) = self.all.get(machine_id).and_then(|m| m.state_by_id(id)) {
                        doomed_filesystems.extend(state.system_datasets().map(|d| d.name.clone()));
                    }
                }
                DepState::User {
                    machine_id,
                    user,
                    id,
                    linked_state_id,
                } if !id.contains('@') => {
                    let us = self.lookup_user_state(machine_id, user, id);
                    if let Some(us) = us {
                        for d in us.all_datasets() {
                            let gone = match linked_state_id {
                                Some(linked) => remove_tag(&d.bootfs_datasets, linked)
                                    .map(|tags| tags.is_empty())
                                    .unwrap_or_else(|| d.bootfs_datasets.is_empty()),
                                None => true,
                            };
                            if gone {
                                doomed_filesystems.insert(d.name.clone());
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let mut destroyed: HashSet<String> = HashSet::new();
        for dep in deps {
            ctx.ensure()?;
            match dep {
                DepState::System { machine_id, id } => {
                    let state = match self.all.get(machine_id).and_then(|m| m.state_by_id(id)) {
                        Some(state) => state,
                        None => continue,
                    };
                    for root in state.route_roots() {
                        self.destroy_dataset(zfs, &root.name, &doomed_filesystems, &mut destroyed)?;
                    }
                }
                DepState::User {
                    machine_id,
                    user,
                    id,
                    linked_state_id,
                } => {
                    let us = match self.lookup_user_state(machine_id, user, id) {
                        Some(us) => us,
                        None => continue,
                    };
                    // Snapshot user states carry no tags: destroy directly.
                    if us.is_snapshot() {
                        for root in us.route_roots() {
                            self.destroy_dataset(zfs, &root.name, &doomed_filesystems, &mut destroyed)?;
                        }
                        continue;
                    }
                    match linked_state_id {
                        Some(linked) => {
                            let mut txn = Transaction::new(zfs, ctx);
                            let mut to_destroy: Vec<String> = Vec::new();
                            for d in us.all_datasets().filter(|d| !d.is_snapshot) {
                                match remove_tag(&d.bootfs_datasets, linked) {
                                    Some(tags) if tags.is_empty() => to_destroy.push(d.name.clone()),
                                    Some(tags) => txn.set_property(PROP_BOOTFS_DATASETS, &tags, &d.name, false)?,
                                    None if d.bootfs_datasets.is_empty() => to_destroy.push(d.name.clone()),
                                    None => {}
                                }
                            }
                            txn.done();
                            for root in us.route_roots() {
                                if to_destroy.contains(&root.name) {
                                    self.destroy_dataset(zfs, &root.name, &doomed_filesystems, &mut destroyed)?;
                                }
                            }
                        }
                        None => {
                            for root in us.route_roots() {
                                self.destroy_dataset(zfs, &root.name, &doomed_filesystems, &mut destroyed)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn destroy_dataset(
        &self,
        zfs: &dyn Zfs,
        name: &str,
        doomed_filesystems: &HashSet<String>,
        destroyed: &mut HashSet<String>,
    ) -> Result<()> {
        if destroyed.contains(name) {
            return Ok(());
        }
        if let Some((base, _)) = split_snapshot_name(name) {
            // Snapshots on a filesystem going down with this removal are
            // dropped by its recursive destroy.
            if doomed_filesystems.contains(base) || destroyed.contains(base) {
                destroyed.insert(name.to_string());
                return Ok(());
            }
        }
        zfs.destroy(name)?;
        destroyed.insert(name.to_string());
        Ok(())
    }

    fn lookup_user_state(&self, machine_id: &str, user: &str, id: &str) -> Option<&super::UserState> {
        self.all
            .get(machine_id)?
            .all_users_states
            .get(user)?
            .values()
            .find(|us| us.id == id)
    }
}

impl<'a> DependencyWalk<'a> {
    /// Expands a system state: its filesystem dependency closure first, then
    /// the user states of every system state involved, then the state.
    fn push_system(&mut self, machine_id: &str, state_id: &str) -> Result<()> {
        if self.pushed.contains(&(state_id.to_string(), None)) {
            return Ok(());
        }
        if self.expanded.insert(format!("sys:{}", state_id)) {
            let roots: Vec<String> = match self.machines.all.get(machine_id).and_then(|m| m.state_by_id(state_id)) {
                Some(state) => state.route_roots().map(|d| d.name.clone()).collect(),
                None => return Err(anyhow!("unknown state {}", state_id)),
            };
            for root in roots {
                let closure = self.zfs.dependencies(&root)?;
                for dep in closure {
                    self.route_dependency(dep, state_id)?;
                }
            }
        }
        // Users land right before their system state.
        let users: Vec<(String, String)> = self
            .machines
            .all
            .get(machine_id)
            .and_then(|m| m.state_by_id(state_id))
            .map(|s| s.users.iter().map(|(user, us)| (user.clone(), us.id.clone())).collect())
            .unwrap_or_default();
        for (user, us_id) in users {
            self.push_user(machine_id, &user, &us_id, Some(state_id))?;
        }
        if self.pushed.insert((state_id.to_string(), None)) {
            self.out.push(DepState::System {
                machine_id: machine_id.to_string(),
                id: state_id.to_string(),
            });
        }
        Ok(())
    }

    fn push_user(&mut self, machine_id: &str, user: &str, us_id: &str, linked: Option<&str>) -> Result<()> {
        if self.expanded.insert(format!("usr:{}", us_id)) {
            let roots: Vec<String> = self
                .machines
                .lookup_user_state(machine_id, user, us_id)
                .map(|us| us.route_roots().map(|d| d.name.clone()).collect())
                .unwrap_or_default();
            for root in roots {
                let closure = self.zfs.dependencies(&root)?;
                for dep in closure {
                    self.route_dependency(dep, us_id)?;
                }
            }
        }
        let key = (us_id.to_string(), linked.map(|l| l.to_string()));
        if self.pushed.contains(&(us_id.to_string(), None)) || !self.pushed.insert(key) {
            return Ok(());
        }
        self.out.push(DepState::User {
            machine_id: machine_id.to_string(),
            user: user.to_string(),
            id: us_id.to_string(),
            linked_state_id: linked.map(|l| l.to_string()),
        });
        Ok(())
    }

    fn route_dependency(&mut self, dep: Dataset, origin_state: &str) -> Result<()> {
        if let Some((machine_id, state_id)) = self.index.system.get(&dep.name).cloned() {
            if state_id != origin_state {
                self.push_system(&machine_id, &state_id)?;
            }
            return Ok(());
        }
        if let Some((machine_id, user, us_id)) = self.index.user.get(&dep.name).cloned() {
            if us_id != origin_state {
                self.push_user(&machine_id, &user, &us_id, None)?;
            }
            return Ok(());
        }
        if !self.external.iter().any(|d| d.name == dep.name) {
            self.external.push(dep);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Config;
    use crate::sys::mock::{dataset, MemoryZfs};
    use crate::sys::zfs::CanMount;

    fn fixture() -> MemoryZfs {
        MemoryZfs::new(vec![
            dataset("rpool").mountpoint("/").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT").mountpoint("none").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT/ubuntu_1234").mountpoint("/").bootfs().last_used(100).build(),
            dataset("rpool/ROOT/ubuntu_1234@snap1").mountpoint("/").last_used(50).build(),
            dataset("rpool/ROOT/ubuntu_5678")
                .mountpoint("/")
                .mounted()
                .bootfs()
                .origin("rpool/ROOT/ubuntu_1234@snap1")
                .last_used(200)
                .build(),
        ])
    }

    fn machines_on(zfs: &MemoryZfs, boot_cmdline: &str) -> Machines {
        Machines::new(&CancelToken::new(), zfs, boot_cmdline, Config::default()).unwrap()
    }

    #[test]
    fn removal_without_force_is_gated_with_the_full_closure() {
        let zfs = fixture();
        let mut machines = machines_on(&zfs, "root=ZFS=rpool/ROOT/ubuntu_5678");
        let err = machines
            .remove_state(&CancelToken::new(), &zfs, "ubuntu_1234", None, false, false)
            .unwrap_err();
        let gate = err.downcast_ref::<RemovalNeedsConfirmation>().expect("typed gate error");
        assert_eq!(
            gate.states,
            vec!["rpool/ROOT/ubuntu_5678", "rpool/ROOT/ubuntu_1234@snap1"]
        );
        assert!(gate.datasets.is_empty());
        // Nothing was destroyed.
        assert!(zfs.dataset("rpool/ROOT/ubuntu_1234").is_some());
    }

    #[test]
    fn forced_removal_destroys_clone_then_snapshot_then_filesystem() {
        let zfs = fixture();
        let mut machines = machines_on(&zfs, "root=ZFS=rpool/ROOT/ubuntu_5678");
        let plan = machines
            .remove_state(&CancelToken::new(), &zfs, "ubuntu_1234", None, true, false)
            .unwrap();
        assert_eq!(
            plan.states,
            vec![
                "rpool/ROOT/ubuntu_5678",
                "rpool/ROOT/ubuntu_1234@snap1",
                "rpool/ROOT/ubuntu_1234"
            ]
        );
        assert!(zfs.dataset("rpool/ROOT/ubuntu_5678").is_none());
        assert!(zfs.dataset("rpool/ROOT/ubuntu_1234@snap1").is_none());
        assert!(zfs.dataset("rpool/ROOT/ubuntu_1234").is_none());
    }

    #[test]
    fn dryrun_reports_without_destroying() {
        let zfs = fixture();
        let mut machines = machines_on(&zfs, "root=ZFS=rpool/ROOT/ubuntu_5678");
        let plan = machines
            .remove_state(&CancelToken::new(), &zfs, "ubuntu_1234", None, true, true)
            .unwrap();
        assert_eq!(plan.states.len(), 3);
        assert!(zfs.dataset("rpool/ROOT/ubuntu_1234").is_some());
        assert!(zfs.dataset("rpool/ROOT/ubuntu_5678").is_some());
    }

    #[test]
    fn current_state_cannot_be_removed() {
        let zfs = fixture();
        let mut machines = machines_on(&zfs, "root=ZFS=rpool/ROOT/ubuntu_5678");
        let err = machines
            .remove_state(&CancelToken::new(), &zfs, "ubuntu_5678", None, true, false)
            .unwrap_err();
        assert!(err.to_string().contains("current state"));
    }

    #[test]
    fn snapshot_state_removal_is_direct() {
        let zfs = MemoryZfs::new(vec![
            dataset("rpool/ROOT/ubuntu_1234").mountpoint("/").mounted().bootfs().last_used(100).build(),
            dataset("rpool/ROOT/ubuntu_1234@snap1").mountpoint("/").last_used(50).build(),
        ]);
        let mut machines = machines_on(&zfs, "root=ZFS=rpool/ROOT/ubuntu_1234");
        let plan = machines
            .remove_state(&CancelToken::new(), &zfs, "snap1", None, false, false)
            .unwrap();
        assert_eq!(plan.states, vec!["rpool/ROOT/ubuntu_1234@snap1"]);
        assert!(zfs.dataset("rpool/ROOT/ubuntu_1234@snap1").is_none());
        assert!(zfs.dataset("rpool/ROOT/ubuntu_1234").is_some());
    }

    #[test]
    fn system_removal_unlinks_shared_user_data_and_destroys_exclusive() {
        let zfs = MemoryZfs::new(vec![
            dataset("rpool").mountpoint("/").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT").mountpoint("none").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT/ubuntu_1234").mountpoint("/").mounted().bootfs().last_used(100).build(),
            dataset("rpool/ROOT/ubuntu_9999").mountpoint("/").bootfs().last_used(90).build(),
            dataset("rpool/USERDATA").mountpoint("/").canmount(CanMount::Off).build(),
            // Shared between both states: only untagged on removal.
            dataset("rpool/USERDATA/user1_shared")
                .mountpoint("/home/user1")
                .bootfs_datasets("rpool/ROOT/ubuntu_1234,rpool/ROOT/ubuntu_9999")
                .last_used(90)
                .build(),
            // Exclusive to the removed state: destroyed.
            dataset("rpool/USERDATA/user2_solo")
                .mountpoint("/home/user2")
                .bootfs_datasets("rpool/ROOT/ubuntu_9999")
                .last_used(90)
                .build(),
        ]);
        let mut machines = machines_on(&zfs, "root=ZFS=rpool/ROOT/ubuntu_1234");
        machines
            .remove_state(&CancelToken::new(), &zfs, "ubuntu_9999", None, true, false)
            .unwrap();

        assert!(zfs.dataset("rpool/ROOT/ubuntu_9999").is_none());
        let shared = zfs.dataset("rpool/USERDATA/user1_shared").unwrap();
        assert_eq!(shared.bootfs_datasets, "rpool/ROOT/ubuntu_1234");
        assert!(zfs.dataset("rpool/USERDATA/user2_solo").is_none());
    }

    #[test]
    fn user_state_removal_destroys_its_datasets() {
        let zfs = MemoryZfs::new(vec![
            dataset("rpool").mountpoint("/").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT").mountpoint("none").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT/ubuntu_1234").mountpoint("/").mounted().bootfs().last_used(100).build(),
            dataset("rpool/USERDATA").mountpoint("/").canmount(CanMount::Off).build(),
            dataset("rpool/USERDATA/user1_abcd")
                .mountpoint("/home/user1")
                .bootfs_datasets("rpool/ROOT/ubuntu_1234")
                .last_used(90)
                .build(),
        ]);
        let mut machines = machines_on(&zfs, "root=ZFS=rpool/ROOT/ubuntu_1234");
        machines
            .remove_state(&CancelToken::new(), &zfs, "user1_abcd", Some("user1"), true, false)
            .unwrap();
        assert!(zfs.dataset("rpool/USERDATA/user1_abcd").is_none());
    }
}
