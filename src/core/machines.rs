//! Builds the [`Machines`] graph from a flat dataset scan.
//!
//! The builder is deterministic for a given scan: datasets are sorted by
//! depth then name so parents always precede children, origins are resolved
//! to the root of their clone chain, and population happens in three groups
//! (main roots, clones, everything else) followed by the boot and user
//! dataset passes.

use super::{cmdline, Machine, Machines, State, UserState};
use crate::model::Config;
use crate::parsing::{base_name, dataset_depth, is_user_dataset_name, parse_tags, split_snapshot_name};
use crate::sys::zfs::{CanMount, Dataset, Zfs};
use crate::sys::CancelToken;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap, HashSet};

impl Machines {
    /// Scans the filesystem and assembles the machine graph.
    pub fn new(ctx: &CancelToken, zfs: &dyn Zfs, boot_cmdline: &str, config: Config) -> Result<Machines> {
        ctx.ensure()?;
        let datasets = zfs.scan()?;
        Ok(build(datasets, boot_cmdline, config))
    }

    /// Rebuilds the graph from a fresh scan, keeping command line and
    /// configuration. Every mutating operation ends here.
    pub fn rescan(&mut self, ctx: &CancelToken, zfs: &dyn Zfs) -> Result<()> {
        ctx.ensure()?;
        let datasets = zfs.scan()?;
        let boot_cmdline = self.cmdline.clone();
        let config = self.config.clone();
        *self = build(datasets, &boot_cmdline, config);
        Ok(())
    }
}

fn build(mut datasets: Vec<Dataset>, boot_cmdline: &str, config: Config) -> Machines {
    datasets.sort_by(|a, b| {
        dataset_depth(&a.name)
            .cmp(&dataset_depth(&b.name))
            .then_with(|| a.name.cmp(&b.name))
    });
    let (origins, broken) = resolve_origins(&datasets);

    let mut machines = Machines {
        cmdline: boot_cmdline.to_string(),
        config,
        ..Machines::default()
    };
    let mut boots: Vec<Dataset> = Vec::new();
    let mut userdatas: Vec<Dataset> = Vec::new();
    let mut persistent: Vec<Dataset> = Vec::new();
    let mut unmanaged: Vec<Dataset> = Vec::new();

    // Main roots first, then clones, then the rest, keeping the sort inside
    // each group.
    let mut ordered: Vec<Dataset> = Vec::with_capacity(datasets.len());
    let mut clones: Vec<Dataset> = Vec::new();
    let mut others: Vec<Dataset> = Vec::new();
    for d in datasets {
        match origins.get(&d.name).map(String::as_str) {
            Some("") => ordered.push(d),
            Some(_) => clones.push(d),
            None => others.push(d),
        }
    }
    ordered.extend(clones);
    ordered.extend(others);

    for d in ordered {
        if is_user_dataset_name(&d.name) {
            userdatas.push(d);
            continue;
        }
        if d.mountpoint.starts_with("/boot") {
            boots.push(d);
            continue;
        }
        if broken.contains(&d.name) {
            unmanaged.push(d);
            continue;
        }
        match origins.get(&d.name).map(String::as_str) {
            Some("") => {
                if d.canmount != CanMount::Off {
                    let mut state = State {
                        id: d.name.clone(),
                        last_used: d.last_used,
                        ..State::default()
                    };
                    state.datasets.insert(d.name.clone(), vec![d.clone()]);
                    machines.all.insert(
                        d.name.clone(),
                        Machine {
                            id: d.name.clone(),
                            is_zsys: d.bootfs,
                            state,
                            ..Machine::default()
                        },
                    );
                } else {
                    unmanaged.push(d);
                }
                continue;
            }
            Some(root) => {
                match machines.all.get_mut(root) {
                    Some(machine) => {
                        let mut state = State {
                            id: d.name.clone(),
                            last_used: d.last_used,
                            ..State::default()
                        };
                        state.datasets.insert(d.name.clone(), vec![d.clone()]);
                        machine.history.insert(d.name.clone(), state);
                    }
                    None => {
                        slog_scope::warn!("clone {} resolves to {} which is not a machine", d.name, root);
                        unmanaged.push(d);
                    }
                }
                continue;
            }
            None => {}
        }
        if machines.all.values_mut().any(|m| attach_system(m, &d)) {
            continue;
        }
        if !d.is_snapshot && d.canmount != CanMount::Off {
            persistent.push(d);
        } else {
            unmanaged.push(d);
        }
    }

    for d in attach_boots(&mut machines, boots) {
        if !d.is_snapshot && d.canmount != CanMount::Off {
            persistent.push(d);
        } else {
            unmanaged.push(d);
        }
    }
    for machine in machines.all.values_mut() {
        machine.persistent_datasets = persistent.clone();
    }

    unmanaged.extend(attach_userdata(&mut machines, userdatas));

    select_current(&mut machines);
    aggregate(&mut machines, persistent, unmanaged);
    machines
}

/// Resolves each root-mountable dataset to the origin-less end of its clone
/// chain (empty string for datasets that are no clone themselves). Datasets
/// whose chain cannot be resolved are reported in the second value.
fn resolve_origins(datasets: &[Dataset]) -> (HashMap<String, String>, HashSet<String>) {
    let by_name: HashMap<&str, &Dataset> = datasets.iter().map(|d| (d.name.as_str(), d)).collect();
    let mut origins = HashMap::new();
    let mut broken = HashSet::new();
    for d in datasets.iter().filter(|d| !d.is_snapshot && d.mountpoint == "/") {
        let mut origin = d.origin.clone();
        let mut hops = 0;
        let resolved = loop {
            if origin.is_empty() {
                break Some(String::new());
            }
            let base = origin.splitn(2, '@').next().unwrap_or("").to_string();
            match by_name.get(base.as_str()) {
                None => {
                    slog_scope::warn!("origin {} of {} does not exist", origin, d.name);
                    break None;
                }
                Some(o) if o.origin.is_empty() => break Some(base),
                Some(o) => origin = o.origin.clone(),
            }
            hops += 1;
            if hops > 100 {
                slog_scope::warn!("origin chain of {} does not terminate", d.name);
                break None;
            }
        };
        match resolved {
            Some(root) if root != d.name => {
                origins.insert(d.name.clone(), root);
            }
            Some(_) => {
                broken.insert(d.name.clone());
            }
            None => {
                broken.insert(d.name.clone());
            }
        }
    }
    (origins, broken)
}

/// Attaches a dataset to the machine's states by name: children extend their
/// parent's route, snapshots open (or extend) the history state of their tag.
fn attach_system(machine: &mut Machine, d: &Dataset) -> bool {
    if !d.is_snapshot {
        if let Some(route) = route_of(&machine.state, d) {
            machine.state.datasets.get_mut(&route).unwrap().push(d.clone());
            return true;
        }
        let mut target: Option<(String, String)> = None;
        for (hid, hs) in &machine.history {
            if let Some(route) = route_of(hs, d) {
                target = Some((hid.clone(), route));
                break;
            }
        }
        if let Some((hid, route)) = target {
            let state = machine.history.get_mut(&hid).unwrap();
            state.datasets.get_mut(&route).unwrap().push(d.clone());
            return true;
        }
        return false;
    }

    if d.canmount == CanMount::Off {
        return false;
    }
    let (snap_base, tag) = match split_snapshot_name(&d.name) {
        Some(parts) => parts,
        None => return false,
    };
    // Snapshot of the machine root or of a history clone root.
    if snap_base == machine.id || machine.history.contains_key(snap_base) {
        let state = machine.history.entry(d.name.clone()).or_insert_with(|| State {
            id: d.name.clone(),
            last_used: d.last_used,
            ..State::default()
        });
        state.datasets.entry(snap_base.to_string()).or_default().push(d.clone());
        return true;
    }
    // Snapshot of a child: lands in the history state of its owning
    // filesystem state, same route.
    let mut target: Option<(String, String)> = None;
    for s in std::iter::once(&machine.state).chain(machine.history.values()) {
        if s.is_snapshot() {
            continue;
        }
        for (route, group) in &s.datasets {
            if group.iter().any(|x| x.name == snap_base) {
                target = Some((s.id.clone(), route.clone()));
                break;
            }
        }
        if target.is_some() {
            break;
        }
    }
    if let Some((owner_id, route)) = target {
        let hid = format!("{}@{}", owner_id, tag);
        let state = machine.history.entry(hid.clone()).or_insert_with(|| State {
            id: hid,
            last_used: d.last_used,
            ..State::default()
        });
        state.datasets.entry(route).or_default().push(d.clone());
        return true;
    }
    false
}

fn route_of(state: &State, d: &Dataset) -> Option<String> {
    state.datasets.keys().find(|route| d.is_child_of(route)).cloned()
}

/// Second pass: boot-pool datasets attach by basename for filesystem states
/// and by snapshot tag for history snapshots. Returns what nothing claimed.
fn attach_boots(machines: &mut Machines, boots: Vec<Dataset>) -> Vec<Dataset> {
    let mut leftovers = Vec::new();
    for d in boots {
        let mut attached = false;
        for machine in machines.all.values_mut() {
            attached |= attach_boot(machine, &d);
        }
        if !attached {
            leftovers.push(d);
        }
    }
    leftovers
}

fn attach_boot(machine: &mut Machine, d: &Dataset) -> bool {
    if !d.is_snapshot {
        let suffix = format!("/{}", base_name(&machine.id));
        if d.name.ends_with(&suffix) {
            machine.state.datasets.insert(d.name.clone(), vec![d.clone()]);
            return true;
        }
        if let Some(route) = route_of(&machine.state, d) {
            machine.state.datasets.get_mut(&route).unwrap().push(d.clone());
            return true;
        }
        let mut target: Option<(String, String, bool)> = None;
        for (hid, hs) in &machine.history {
            if hs.is_snapshot() {
                continue;
            }
            let clone_suffix = format!("/{}", base_name(hid));
            if d.name.ends_with(&clone_suffix) {
                target = Some((hid.clone(), d.name.clone(), true));
                break;
            }
            if let Some(route) = route_of(hs, d) {
                target = Some((hid.clone(), route, false));
                break;
            }
        }
        if let Some((hid, route, new_route)) = target {
            let state = machine.history.get_mut(&hid).unwrap();
            if new_route {
                state.datasets.insert(route, vec![d.clone()]);
            } else {
                state.datasets.get_mut(&route).unwrap().push(d.clone());
            }
            return true;
        }
        return false;
    }

    let (boot_base, boot_tag) = match split_snapshot_name(&d.name) {
        Some(parts) => parts,
        None => return false,
    };
    let mut target: Option<(String, String, bool)> = None;
    for (hid, hs) in &machine.history {
        let (state_base, state_tag) = match split_snapshot_name(hid) {
            Some(parts) => parts,
            None => continue,
        };
        if state_tag != boot_tag {
            continue;
        }
        if base_name(boot_base) == base_name(state_base) {
            target = Some((hid.clone(), boot_base.to_string(), true));
            break;
        }
        if let Some(route) = hs.datasets.keys().find(|route| {
            boot_base == route.as_str() || (boot_base.starts_with(route.as_str()) && boot_base[route.len()..].starts_with('/'))
        }) {
            target = Some((hid.clone(), route.clone(), false));
            break;
        }
    }
    if let Some((hid, route, new_route)) = target {
        let state = machine.history.get_mut(&hid).unwrap();
        if new_route {
            state.datasets.entry(route).or_default().push(d.clone());
        } else {
            state.datasets.get_mut(&route).unwrap().push(d.clone());
        }
        return true;
    }
    false
}

/// Third pass: user datasets. Filesystem user states associate through their
/// bootfs-datasets tags, snapshots through their tag, and orphans through
/// their origin chain. Returns the datasets of fully unassociated groups.
fn attach_userdata(machines: &mut Machines, userdatas: Vec<Dataset>) -> Vec<Dataset> {
    let fs_names: HashSet<&str> = userdatas.iter().filter(|d| !d.is_snapshot).map(|d| d.name.as_str()).collect();
    let is_root = |name: &str| -> bool {
        match name.rsplitn(2, '/').nth(1) {
            Some(parent) => !fs_names.contains(parent) || !is_user_dataset_name(parent),
            None => true,
        }
    };

    let mut leftovers: Vec<Dataset> = Vec::new();
    let mut orphans: Vec<&Dataset> = Vec::new();

    // Filesystem user states, tag-associated.
    for root in userdatas.iter().filter(|d| !d.is_snapshot && is_root(&d.name)) {
        let group: Vec<&Dataset> = std::iter::once(root)
            .chain(userdatas.iter().filter(|c| !c.is_snapshot && c.is_child_of(&root.name)))
            .collect();
        let user = user_name(&root.name);
        let tags: Vec<&str> = parse_tags(&root.bootfs_datasets);
        let mut assoc: Vec<(String, String)> = Vec::new();
        for machine in machines.all.values() {
            for state in machine.all_states() {
                if tags.contains(&state.id.as_str()) {
                    assoc.push((machine.id.clone(), state.id.clone()));
                }
            }
        }
        if assoc.is_empty() {
            orphans.push(root);
            continue;
        }
        for (machine_id, state_id) in assoc {
            let members: Vec<&Dataset> = group
                .iter()
                .filter(|d| d.name == root.name || parse_tags(&d.bootfs_datasets).contains(&state_id.as_str()))
                .cloned()
                .collect();
            let us = user_state_from(&root.name, &members);
            let machine = machines.all.get_mut(&machine_id).unwrap();
            if machine.state.id == state_id {
                machine.state.users.insert(user.clone(), us.clone());
            } else if let Some(hs) = machine.history.get_mut(&state_id) {
                hs.users.insert(user.clone(), us.clone());
            }
            machine
                .all_users_states
                .entry(user.clone())
                .or_default()
                .insert(us.id.clone(), us);
        }
    }

    // Orphans hook in through their origin chain.
    let by_name: HashMap<&str, &Dataset> = userdatas.iter().map(|d| (d.name.as_str(), d)).collect();
    for root in orphans {
        let group: Vec<&Dataset> = std::iter::once(root)
            .chain(userdatas.iter().filter(|c| !c.is_snapshot && c.is_child_of(&root.name)))
            .collect();
        let user = user_name(&root.name);
        let mut origin = root.origin.clone();
        let mut parents: Vec<(String, String)> = Vec::new();
        let mut hops = 0;
        while !origin.is_empty() && parents.is_empty() && hops < 100 {
            let origin_base = origin.splitn(2, '@').next().unwrap_or("").to_string();
            for machine in machines.all.values() {
                for routes in machine.all_users_states.values() {
                    for us in routes.values() {
                        if us.all_datasets().any(|d| d.name == origin_base || d.name == origin) {
                            for state in machine.all_states() {
                                if state.users.values().any(|su| su.id == us.id) {
                                    parents.push((machine.id.clone(), state.id.clone()));
                                }
                            }
                        }
                    }
                }
            }
            origin = by_name.get(origin_base.as_str()).map(|d| d.origin.clone()).unwrap_or_default();
            hops += 1;
        }
        if parents.is_empty() {
            slog_scope::warn!("user dataset {} has no association with any state", root.name);
            leftovers.extend(group.into_iter().cloned());
            continue;
        }
        parents.dedup();
        for (machine_id, state_id) in parents {
            let us = user_state_from(&root.name, &group);
            let machine = machines.all.get_mut(&machine_id).unwrap();
            machine
                .all_users_states
                .entry(user.clone())
                .or_default()
                .insert(format!("{}-{}", state_id, root.name), us);
        }
    }

    // Snapshot user states: by tag against system states, else grouped under
    // the user's base state machine.
    for root in userdatas.iter().filter(|d| d.is_snapshot) {
        let (snap_base, tag) = match split_snapshot_name(&root.name) {
            Some(parts) => parts,
            None => continue,
        };
        if !is_root(snap_base) {
            continue;
        }
        let group: Vec<&Dataset> = std::iter::once(root)
            .chain(userdatas.iter().filter(|c| {
                c.is_snapshot
                    && c.name.ends_with(&format!("@{}", tag))
                    && split_snapshot_name(&c.name)
                        .map(|(b, _)| b != snap_base && b.starts_with(snap_base) && b[snap_base.len()..].starts_with('/'))
                        .unwrap_or(false)
            }))
            .collect();
        let user = user_name(snap_base);
        let tag_suffix = format!("@{}", tag);
        let mut assoc: Vec<(String, String)> = Vec::new();
        for machine in machines.all.values() {
            for state in machine.all_states() {
                if state.id.ends_with(&tag_suffix) {
                    assoc.push((machine.id.clone(), state.id.clone()));
                }
            }
        }
        if !assoc.is_empty() {
            for (machine_id, state_id) in assoc {
                let us = user_state_from(&root.name, &group);
                let machine = machines.all.get_mut(&machine_id).unwrap();
                if let Some(hs) = machine.history.get_mut(&state_id) {
                    hs.users.insert(user.clone(), us.clone());
                } else if machine.state.id == state_id {
                    machine.state.users.insert(user.clone(), us.clone());
                }
                machine
                    .all_users_states
                    .entry(user.clone())
                    .or_default()
                    .insert(us.id.clone(), us);
            }
            continue;
        }
        // No matching system state: keep it reachable under the machine that
        // owns the base user state.
        let owner = machines
            .all
            .iter()
            .find(|(_, m)| {
                m.all_users_states
                    .get(&user)
                    .map(|routes| routes.values().any(|us| us.all_datasets().any(|d| d.name == snap_base)))
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone());
        match owner {
            Some(machine_id) => {
                let us = user_state_from(&root.name, &group);
                let machine = machines.all.get_mut(&machine_id).unwrap();
                machine
                    .all_users_states
                    .entry(user.clone())
                    .or_default()
                    .insert(us.id.clone(), us);
            }
            None => leftovers.extend(group.into_iter().cloned()),
        }
    }

    leftovers
}

fn user_state_from(root_name: &str, members: &[&Dataset]) -> UserState {
    let route = split_snapshot_name(root_name)
        .map(|(base, _)| base.to_string())
        .unwrap_or_else(|| root_name.to_string());
    let mut us = UserState {
        id: root_name.to_string(),
        last_used: members.first().map(|d| d.last_used).unwrap_or_default(),
        ..UserState::default()
    };
    us.datasets.insert(route, members.iter().map(|d| (*d).clone()).collect());
    us
}

/// User a dataset belongs to: the basename up to the last `_`.
fn user_name(dataset_name: &str) -> String {
    let base = base_name(dataset_name);
    let base = base.splitn(2, '@').next().unwrap_or(base);
    match base.rfind('_') {
        Some(idx) => base[..idx].to_string(),
        None => base.to_string(),
    }
}

fn select_current(machines: &mut Machines) {
    let root = match cmdline::root_from_cmdline(&machines.cmdline) {
        Some(root) => root,
        None => return,
    };
    let mut current = machines
        .all
        .values()
        .find(|m| m.id == root || m.history.contains_key(&root))
        .map(|m| m.id.clone());
    if current.is_none() && root.contains('@') {
        current = machines
            .all
            .values()
            .find(|m| {
                m.all_states().any(|s| {
                    !s.is_snapshot()
                        && s.root_dataset()
                            .map(|d| d.mounted && d.mountpoint == "/")
                            .unwrap_or(false)
                })
            })
            .map(|m| m.id.clone());
    }
    machines.current = current;
}

fn aggregate(machines: &mut Machines, persistent: Vec<Dataset>, unmanaged: Vec<Dataset>) {
    let mut system: BTreeMap<String, Dataset> = BTreeMap::new();
    let mut users: BTreeMap<String, Dataset> = BTreeMap::new();
    for machine in machines.all.values() {
        for state in machine.all_states() {
            for d in state.system_datasets() {
                system.insert(d.name.clone(), d.clone());
            }
        }
        for routes in machine.all_users_states.values() {
            for us in routes.values() {
                for d in us.all_datasets() {
                    users.insert(d.name.clone(), d.clone());
                }
            }
        }
    }
    machines.all_system_datasets = system.into_iter().map(|(_, d)| d).collect();
    machines.all_user_datasets = users.into_iter().map(|(_, d)| d).collect();
    machines.all_persistent_datasets = persistent;
    machines.unmanaged_datasets = unmanaged;
}
