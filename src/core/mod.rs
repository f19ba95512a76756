pub mod boot;
pub mod cmdline;
pub mod gc;
pub mod machines;
pub mod removal;
pub mod snapshot;
pub mod userdata;

use crate::model::Config;
use crate::parsing::base_name;
use crate::sys::zfs::Dataset;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

/// Per-user state: the datasets of one user's home data, grouped by route.
/// The same user state can be associated with several system states through
/// the bootfs-datasets tag list of its datasets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserState {
    pub id: String,
    /// Route (root dataset name) to the root and its children, depth order.
    pub datasets: BTreeMap<String, Vec<Dataset>>,
    pub last_used: i64,
}

impl UserState {
    pub fn is_snapshot(&self) -> bool {
        self.id.contains('@')
    }

    pub fn all_datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values().flatten()
    }

    pub fn route_roots(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values().filter_map(|group| group.first())
    }
}

/// A bootable system state: live (identified by a dataset name) or history
/// (identified by `dataset@tag` for snapshots, or by a clone dataset name).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub id: String,
    /// Route (root dataset name) to the root and its children, depth order.
    /// Spans several routes when the state covers more than one pool.
    pub datasets: BTreeMap<String, Vec<Dataset>>,
    pub users: BTreeMap<String, UserState>,
    pub last_used: i64,
}

impl State {
    pub fn is_snapshot(&self) -> bool {
        self.id.contains('@')
    }

    pub fn system_datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values().flatten()
    }

    pub fn user_datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.users.values().flat_map(|us| us.all_datasets())
    }

    pub fn route_roots(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values().filter_map(|group| group.first())
    }

    /// The dataset the state id names.
    pub fn root_dataset(&self) -> Option<&Dataset> {
        self.system_datasets().find(|d| d.name == self.id)
    }
}

/// One machine per main bootable root dataset.
#[derive(Debug, Clone, Default)]
pub struct Machine {
    pub id: String,
    /// True when the root dataset opted into full lifecycle management.
    pub is_zsys: bool,
    pub state: State,
    pub history: BTreeMap<String, State>,
    /// Every known user state on any of this machine's states:
    /// user name, then route id, to the state.
    pub all_users_states: BTreeMap<String, BTreeMap<String, UserState>>,
    pub persistent_datasets: Vec<Dataset>,
}

impl Machine {
    pub fn all_states(&self) -> impl Iterator<Item = &State> {
        std::iter::once(&self.state).chain(self.history.values())
    }

    pub fn state_by_id(&self, id: &str) -> Option<&State> {
        if self.state.id == id {
            Some(&self.state)
        } else {
            self.history.get(id)
        }
    }

    /// State the session actually booted from, given the kernel command line
    /// root identifier. A snapshot identifier resolves to the filesystem
    /// state the boot loader synthesized from it, recognized by its root
    /// being mounted at `/`.
    pub fn booted_state_id(&self, root: &str) -> Result<String> {
        if let Some(state) = self.state_by_id(root) {
            if !state.is_snapshot() {
                return Ok(state.id.clone());
            }
        }
        if root.contains('@') {
            if let Some(state) = self.all_states().find(|s| {
                !s.is_snapshot()
                    && s.root_dataset()
                        .map(|d| d.mounted && d.mountpoint == "/")
                        .unwrap_or(false)
            }) {
                return Ok(state.id.clone());
            }
        }
        Err(anyhow!("no booted state for {} on machine {}", root, self.id))
    }
}

/// The whole managed graph, rebuilt from a filesystem scan.
#[derive(Debug, Clone, Default)]
pub struct Machines {
    pub all: BTreeMap<String, Machine>,
    pub cmdline: String,
    pub(crate) current: Option<String>,
    pub all_system_datasets: Vec<Dataset>,
    pub all_user_datasets: Vec<Dataset>,
    pub all_persistent_datasets: Vec<Dataset>,
    pub unmanaged_datasets: Vec<Dataset>,
    pub(crate) config: Config,
}

impl Machines {
    pub fn current(&self) -> Option<&Machine> {
        self.current.as_ref().and_then(|id| self.all.get(id))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// System state the given user state hangs off, compared by state id.
    pub fn parent_system_state(&self, user_state_id: &str) -> Option<(&Machine, &State)> {
        for machine in self.all.values() {
            for state in machine.all_states() {
                if state.users.values().any(|us| us.id == user_state_id) {
                    return Some((machine, state));
                }
            }
        }
        None
    }

    /// Resolves a state name to a unique state.
    ///
    /// Matches the full id, the id basename, a trailing snapshot tag
    /// (`@name`) or a trailing suffix (`_name`). With `user` set the search
    /// scope is that user's states on every machine, otherwise every system
    /// state. Several matches are an error listing the candidates.
    pub fn id_to_state(&self, name: &str, user: Option<&str>) -> Result<StateSel> {
        if name.is_empty() {
            return Err(anyhow!("state name is mandatory"));
        }
        let mut matches: Vec<StateSel> = Vec::new();
        match user {
            None => {
                for machine in self.all.values() {
                    for state in machine.all_states() {
                        if id_matches(&state.id, name) {
                            matches.push(StateSel {
                                machine_id: machine.id.clone(),
                                user: None,
                                route: None,
                                id: state.id.clone(),
                            });
                        }
                    }
                }
            }
            Some(user) => {
                for machine in self.all.values() {
                    if let Some(routes) = machine.all_users_states.get(user) {
                        for (route, us) in routes {
                            if id_matches(&us.id, name) {
                                matches.push(StateSel {
                                    machine_id: machine.id.clone(),
                                    user: Some(user.to_string()),
                                    route: Some(route.clone()),
                                    id: us.id.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
        // The same user state can be indexed under several routes.
        matches.dedup_by(|a, b| a.machine_id == b.machine_id && a.id == b.id);
        match matches.len() {
            0 => Err(anyhow!("no state matches {}", name)),
            1 => Ok(matches.pop().unwrap()),
            _ => Err(anyhow!(
                "{} matches multiple states: {}",
                name,
                matches.iter().map(|m| m.id.as_str()).collect::<Vec<_>>().join(", ")
            )),
        }
    }

    pub fn system_state(&self, sel: &StateSel) -> Option<&State> {
        self.all.get(&sel.machine_id).and_then(|m| m.state_by_id(&sel.id))
    }

    pub fn user_state(&self, sel: &StateSel) -> Option<&UserState> {
        let machine = self.all.get(&sel.machine_id)?;
        let routes = machine.all_users_states.get(sel.user.as_deref()?)?;
        match &sel.route {
            Some(route) => routes.get(route),
            None => routes.values().find(|us| us.id == sel.id),
        }
    }
}

fn id_matches(id: &str, name: &str) -> bool {
    id == name
        || base_name(id) == name
        || id.ends_with(&format!("@{}", name))
        || id.ends_with(&format!("_{}", name))
}

/// Owned handle on a resolved state, valid until the next rescan.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSel {
    pub machine_id: String,
    pub user: Option<String>,
    pub route: Option<String>,
    pub id: String,
}

/// Removal gate: raised by state removal without force when more than the
/// target and its own user states would be destroyed. Callers match on it
/// with `anyhow::Error::downcast_ref`.
#[derive(thiserror::Error, Debug)]
#[error(
    "removing {id} affects other states and datasets, confirmation required. \
     Dependent states: [{}]. External datasets: [{}]",
    .states.join(", "),
    .datasets.join(", ")
)]
pub struct RemovalNeedsConfirmation {
    pub id: String,
    pub states: Vec<String>,
    pub datasets: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Machines {
        let mut machines = Machines::default();
        let mut machine = Machine {
            id: "rpool/ROOT/ubuntu_1234".to_string(),
            is_zsys: true,
            ..Machine::default()
        };
        machine.state.id = machine.id.clone();
        machine.history.insert(
            "rpool/ROOT/ubuntu_1234@snap1".to_string(),
            State {
                id: "rpool/ROOT/ubuntu_1234@snap1".to_string(),
                ..State::default()
            },
        );
        machine.history.insert(
            "rpool/ROOT/ubuntu_9999".to_string(),
            State {
                id: "rpool/ROOT/ubuntu_9999".to_string(),
                ..State::default()
            },
        );
        let mut user_routes = BTreeMap::new();
        user_routes.insert(
            "rpool/USERDATA/user1_abcd".to_string(),
            UserState {
                id: "rpool/USERDATA/user1_abcd".to_string(),
                ..UserState::default()
            },
        );
        machine.all_users_states.insert("user1".to_string(), user_routes);
        machine
            .state
            .users
            .insert("user1".to_string(), UserState {
                id: "rpool/USERDATA/user1_abcd".to_string(),
                ..UserState::default()
            });
        machines.all.insert(machine.id.clone(), machine);
        let mut other = Machine {
            id: "opool/ROOT/ubuntu_1234".to_string(),
            ..Machine::default()
        };
        other.state.id = other.id.clone();
        machines.all.insert(other.id.clone(), other);
        machines.current = Some("rpool/ROOT/ubuntu_1234".to_string());
        machines
    }

    #[test]
    fn id_lookup_matches_suffix_and_tag() {
        let machines = sample();
        assert_eq!(
            machines.id_to_state("snap1", None).unwrap().id,
            "rpool/ROOT/ubuntu_1234@snap1"
        );
        assert_eq!(machines.id_to_state("9999", None).unwrap().id, "rpool/ROOT/ubuntu_9999");
        assert_eq!(
            machines.id_to_state("ubuntu_9999", None).unwrap().id,
            "rpool/ROOT/ubuntu_9999"
        );
    }

    #[test]
    fn ambiguous_lookup_lists_candidates() {
        let machines = sample();
        let err = machines.id_to_state("ubuntu", None).unwrap_err();
        assert!(err.to_string().contains("no state matches"));
        // ubuntu_1234 exists on two pools.
        let err = machines.id_to_state("ubuntu_1234", None).unwrap_err();
        assert!(err.to_string().contains("multiple states"));
    }

    #[test]
    fn user_scope_lookup() {
        let machines = sample();
        let sel = machines.id_to_state("user1_abcd", Some("user1")).unwrap();
        assert_eq!(sel.id, "rpool/USERDATA/user1_abcd");
        assert!(machines.user_state(&sel).is_some());
    }

    #[test]
    fn parent_system_state_scans_users() {
        let machines = sample();
        let (machine, state) = machines.parent_system_state("rpool/USERDATA/user1_abcd").unwrap();
        assert_eq!(machine.id, "rpool/ROOT/ubuntu_1234");
        assert_eq!(state.id, "rpool/ROOT/ubuntu_1234");
        assert!(machines.parent_system_state("rpool/USERDATA/user2_zzzz").is_none());
    }

    #[test]
    fn confirmation_error_is_downcastable() {
        let err: anyhow::Error = RemovalNeedsConfirmation {
            id: "rpool/ROOT/ubuntu_1234".to_string(),
            states: vec!["rpool/ROOT/ubuntu_5678".to_string()],
            datasets: vec![],
        }
        .into();
        assert!(err.downcast_ref::<RemovalNeedsConfirmation>().is_some());
        assert!(err.to_string().contains("ubuntu_5678"));
    }
}
