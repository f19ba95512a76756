//! Time-bucketed garbage collection of history states and stray user data.
//!
//! One run walks three disjoint scopes: system history states, user states
//! no kept system state references, and unmanaged user datasets. Buckets go
//! backward from now following the configured rules; inside a bucket the
//! even-placement selector decides which states fill the sample slots.

use super::Machines;
use crate::model::HistoryConfig;
use crate::parsing::{is_user_dataset_name, split_snapshot_name};
use crate::sys::clock::Clock;
use crate::sys::zfs::{Dataset, Zfs};
use crate::sys::CancelToken;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use std::collections::{HashMap, HashSet};

const AUTO_SNAPSHOT_PREFIX: &str = "autozsys_";

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub start: i64,
    pub end: i64,
    /// Number of states to retain inside the bucket. -1 keeps everything,
    /// 0 makes everything eligible.
    pub samples: i64,
}

/// Buckets newest to oldest: the keep-everything window, the configured
/// rules walking backward, and a terminal catch-all down to the epoch floor.
pub fn compute_buckets(now: DateTime<Utc>, config: &HistoryConfig) -> Vec<Bucket> {
    let today = now.date().and_hms(0, 0, 0);
    let first_start = today - Duration::days(config.gc_start_after);
    let mut buckets = vec![Bucket {
        start: first_start.timestamp(),
        end: now.timestamp(),
        samples: -1,
    }];
    let mut end = first_start;
    for rule in &config.gc_rules {
        for i in 0..i64::from(rule.buckets) {
            buckets.push(Bucket {
                start: (end - Duration::days(rule.bucket_length * (i + 1))).timestamp(),
                end: (end - Duration::days(rule.bucket_length * i)).timestamp(),
                samples: rule.samples_per_bucket,
            });
        }
        end = end - Duration::days(rule.bucket_length * i64::from(rule.buckets));
    }
    buckets.push(Bucket {
        start: i64::MIN,
        end: end.timestamp(),
        samples: 0,
    });
    buckets
}

#[derive(Debug, Clone)]
struct GcCandidate {
    id: String,
    last_used: i64,
    is_snapshot: bool,
    /// Dataset roots destruction starts from.
    roots: Vec<String>,
    /// Every dataset name the candidate holds.
    datasets: Vec<String>,
}

#[derive(Debug, Default)]
struct GcIndexes {
    /// Snapshot name to the clones originating from it.
    origins: HashMap<String, HashSet<String>>,
    /// Filesystem dataset to its snapshots.
    snapshots_by_dataset: HashMap<String, HashSet<String>>,
}

impl GcIndexes {
    fn has_snapshot(&self, datasets: &[String]) -> bool {
        datasets.iter().any(|d| {
            self.snapshots_by_dataset
                .get(d)
                .map(|s| !s.is_empty())
                .unwrap_or(false)
        })
    }

    fn has_clone(&self, datasets: &[String]) -> bool {
        datasets
            .iter()
            .any(|d| self.origins.get(d).map(|c| !c.is_empty()).unwrap_or(false))
    }

    /// Later buckets see the graph as it will be once this candidate is gone.
    fn reclaim(&mut self, candidate: &GcCandidate) {
        for name in &candidate.datasets {
            match split_snapshot_name(name) {
                Some((base, _)) => {
                    if let Some(snaps) = self.snapshots_by_dataset.get_mut(base) {
                        snaps.remove(name);
                    }
                    self.origins.remove(name);
                }
                None => {
                    if let Some(snaps) = self.snapshots_by_dataset.remove(name) {
                        for snap in snaps {
                            self.origins.remove(&snap);
                        }
                    }
                    for clones in self.origins.values_mut() {
                        clones.remove(name);
                    }
                }
            }
        }
    }
}

enum PassScope {
    System,
    UserStates,
    UnmanagedUserData,
}

impl Machines {
    /// One full garbage collection run. With `all`, manual (non-`autozsys_`)
    /// snapshots become eligible too.
    pub fn gc(&mut self, ctx: &CancelToken, zfs: &dyn Zfs, clock: &dyn Clock, all: bool) -> Result<()> {
        let buckets = compute_buckets(clock.now(), &self.config.history);
        let mut keep_on_error: HashSet<String> = HashSet::new();

        for scope in &[PassScope::System, PassScope::UserStates, PassScope::UnmanagedUserData] {
            loop {
                let indexes = self.gc_indexes();
                let groups = self.candidate_groups(scope);
                let mut to_remove: Vec<GcCandidate> = Vec::new();
                {
                    let mut indexes = indexes;
                    for mut group in groups {
                        group.sort_by(|a, b| b.last_used.cmp(&a.last_used).then_with(|| a.id.cmp(&b.id)));
                        // The newest states are retained unconditionally and
                        // stay out of the buckets.
                        let eligible: Vec<GcCandidate> = group
                            .into_iter()
                            .skip(self.config.history.keep_last)
                            .collect();
                        self.bucket_removals(scope, &buckets, eligible, &mut indexes, all, &keep_on_error, &mut to_remove);
                    }
                }
                if to_remove.is_empty() {
                    break;
                }
                // Clones go before the snapshots they originate from.
                to_remove.sort_by_key(|c| c.is_snapshot);

                let doomed: HashSet<&str> = to_remove
                    .iter()
                    .flat_map(|c| c.datasets.iter().map(String::as_str))
                    .collect();
                let mut destroyed_any = false;
                for candidate in &to_remove {
                    ctx.ensure()?;
                    if let PassScope::UnmanagedUserData = scope {
                        // Refuse partial destruction: every dependency must
                        // be going away in this round too.
                        if !self.dependencies_covered(zfs, candidate, &doomed)? {
                            keep_on_error.insert(candidate.id.clone());
                            continue;
                        }
                    }
                    match destroy_candidate(zfs, candidate, &doomed) {
                        Ok(true) => destroyed_any = true,
                        Ok(false) => {}
                        Err(err) => {
                            slog_scope::warn!("cannot destroy state {}: {}", candidate.id, err);
                            keep_on_error.insert(candidate.id.clone());
                        }
                    }
                }
                self.rescan(ctx, zfs)?;
                if !destroyed_any {
                    break;
                }
            }
        }
        Ok(())
    }

    fn gc_indexes(&self) -> GcIndexes {
        let mut indexes = GcIndexes::default();
        let datasets = self
            .all_system_datasets
            .iter()
            .chain(self.all_user_datasets.iter())
            .chain(self.all_persistent_datasets.iter())
            .chain(self.unmanaged_datasets.iter());
        for d in datasets {
            if let Some((base, _)) = split_snapshot_name(&d.name) {
                indexes
                    .snapshots_by_dataset
                    .entry(base.to_string())
                    .or_default()
                    .insert(d.name.clone());
            }
            if !d.origin.is_empty() {
                indexes
                    .origins
                    .entry(d.origin.clone())
                    .or_default()
                    .insert(d.name.clone());
            }
        }
        indexes
    }

    /// Candidate lists per collection scope; keep-last applies within each
    /// returned group.
    fn candidate_groups(&self, scope: &PassScope) -> Vec<Vec<GcCandidate>> {
        match scope {
            PassScope::System => self
                .all
                .values()
                .map(|machine| {
                    machine
                        .history
                        .values()
                        .map(|state| GcCandidate {
                            id: state.id.clone(),
                            last_used: state.last_used,
                            is_snapshot: state.is_snapshot(),
                            roots: state.route_roots().map(|d| d.name.clone()).collect(),
                            datasets: state.system_datasets().map(|d| d.name.clone()).collect(),
                        })
                        .collect()
                })
                .collect(),
            PassScope::UserStates => {
                let mut groups = Vec::new();
                for machine in self.all.values() {
                    for routes in machine.all_users_states.values() {
                        let mut group = Vec::new();
                        let mut seen: HashSet<&str> = HashSet::new();
                        for us in routes.values() {
                            if !seen.insert(us.id.as_str()) {
                                continue;
                            }
                            if self.parent_system_state(&us.id).is_some() {
                                continue;
                            }
                            group.push(GcCandidate {
                                id: us.id.clone(),
                                last_used: us.last_used,
                                is_snapshot: us.is_snapshot(),
                                roots: us.route_roots().map(|d| d.name.clone()).collect(),
                                datasets: us.all_datasets().map(|d| d.name.clone()).collect(),
                            });
                        }
                        if !group.is_empty() {
                            groups.push(group);
                        }
                    }
                }
                groups
            }
            PassScope::UnmanagedUserData => {
                let user_datasets: Vec<&Dataset> = self
                    .unmanaged_datasets
                    .iter()
                    .filter(|d| is_user_dataset_name(&d.name))
                    .collect();
                let fs_names: HashSet<&str> = user_datasets
                    .iter()
                    .filter(|d| !d.is_snapshot)
                    .map(|d| d.name.as_str())
                    .collect();
                let mut group = Vec::new();
                for root in user_datasets.iter().filter(|d| {
                    !d.is_snapshot
                        && d.name
                            .rsplitn(2, '/')
                            .nth(1)
                            .map(|parent| !fs_names.contains(parent))
                            .unwrap_or(true)
                }) {
                    let children: Vec<&Dataset> = user_datasets
                        .iter()
                        .filter(|c| {
                            if c.name == root.name {
                                return false;
                            }
                            match split_snapshot_name(&c.name) {
                                Some((b, _)) => {
                                    b == root.name
                                        || (b.starts_with(&root.name) && b[root.name.len()..].starts_with('/'))
                                }
                                None => c.is_child_of(&root.name),
                            }
                        })
                        .map(|c| *c)
                        .collect();
                    group.push(GcCandidate {
                        id: root.name.clone(),
                        last_used: root.last_used,
                        is_snapshot: false,
                        roots: vec![root.name.clone()],
                        datasets: std::iter::once(root.name.clone())
                            .chain(children.iter().map(|c| c.name.clone()))
                            .collect(),
                    });
                }
                // Stray user snapshots with no filesystem dataset in the
                // unmanaged scope stand alone.
                for snap in user_datasets.iter().filter(|d| {
                    d.is_snapshot
                        && split_snapshot_name(&d.name)
                            .map(|(b, _)| !fs_names.contains(b))
                            .unwrap_or(false)
                }) {
                    group.push(GcCandidate {
                        id: snap.name.clone(),
                        last_used: snap.last_used,
                        is_snapshot: true,
                        roots: vec![snap.name.clone()],
                        datasets: vec![snap.name.clone()],
                    });
                }
                if group.is_empty() {
                    Vec::new()
                } else {
                    vec![group]
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn bucket_removals(
        &self,
        scope: &PassScope,
        buckets: &[Bucket],
        states: Vec<GcCandidate>,
        indexes: &mut GcIndexes,
        all: bool,
        keep_on_error: &HashSet<String>,
        out: &mut Vec<GcCandidate>,
    ) {
        for bucket in buckets {
            if bucket.samples < 0 {
                continue;
            }
            let members: Vec<&GcCandidate> = states
                .iter()
                .filter(|s| s.last_used > bucket.start && s.last_used <= bucket.end)
                .collect();
            if members.is_empty() || members.len() as i64 - bucket.samples <= 0 {
                continue;
            }
            let keeps: Vec<bool> = members
                .iter()
                .map(|c| self.keep_status(scope, c, indexes, all, keep_on_error))
                .collect();
            for candidate in select_states_to_remove(bucket.samples, &members, &keeps) {
                indexes.reclaim(candidate);
                out.push(candidate.clone());
            }
        }
    }

    fn keep_status(
        &self,
        scope: &PassScope,
        candidate: &GcCandidate,
        indexes: &GcIndexes,
        all: bool,
        keep_on_error: &HashSet<String>,
    ) -> bool {
        if keep_on_error.contains(&candidate.id) {
            return true;
        }
        if !candidate.is_snapshot {
            // A filesystem state with snapshots anywhere in its hierarchy
            // stays: the snapshots depend on it.
            if indexes.has_snapshot(&candidate.datasets) {
                return true;
            }
            if let PassScope::UserStates = scope {
                if self.parent_system_state(&candidate.id).is_some() {
                    return true;
                }
            }
            return false;
        }
        let tag = split_snapshot_name(&candidate.id).map(|(_, t)| t).unwrap_or_default();
        if !tag.starts_with(AUTO_SNAPSHOT_PREFIX) && !all {
            return true;
        }
        if let PassScope::UserStates = scope {
            let tag_suffix = format!("@{}", tag);
            if self
                .all
                .values()
                .any(|m| m.all_states().any(|s| s.id.ends_with(&tag_suffix)))
            {
                return true;
            }
        }
        if indexes.has_clone(&candidate.datasets) {
            return true;
        }
        false
    }

    fn dependencies_covered(&self, zfs: &dyn Zfs, candidate: &GcCandidate, doomed: &HashSet<&str>) -> Result<bool> {
        for root in &candidate.roots {
            for dep in zfs.dependencies(root)? {
                if !doomed.contains(dep.name.as_str()) && !candidate.datasets.contains(&dep.name) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// Destroys the candidate's roots. Snapshots whose filesystem goes down in
/// the same round are left to its recursive destroy.
fn destroy_candidate(zfs: &dyn Zfs, candidate: &GcCandidate, doomed: &HashSet<&str>) -> Result<bool> {
    let mut destroyed = false;
    for root in &candidate.roots {
        if let Some((base, _)) = split_snapshot_name(root) {
            if doomed.contains(base) {
                continue;
            }
        }
        zfs.destroy(root)?;
        destroyed = true;
    }
    Ok(destroyed)
}

/// Even-placement selector: fills the bucket's free slots with the
/// combination of non-kept states whose retained average sits closest to the
/// middle of the bucket's time interval. First match wins on ties.
fn select_states_to_remove<'a>(samples: i64, states: &[&'a GcCandidate], keeps: &[bool]) -> Vec<&'a GcCandidate> {
    if states.len() as i64 <= samples {
        return Vec::new();
    }
    let n_keep = keeps.iter().filter(|k| **k).count() as i64;
    let keep_sum: i64 = states
        .iter()
        .zip(keeps)
        .filter(|(_, k)| **k)
        .map(|(s, _)| s.last_used)
        .sum();
    let start = states.iter().map(|s| s.last_used).min().unwrap_or(0);
    let end = states.iter().map(|s| s.last_used).max().unwrap_or(0);

    let non_kept: Vec<&GcCandidate> = states
        .iter()
        .zip(keeps)
        .filter(|(_, k)| !**k)
        .map(|(s, _)| *s)
        .collect();
    // The keep-marked group anchors one retained slot; the rest are free.
    let mut free = samples - n_keep;
    if n_keep > 0 {
        free += 1;
    }
    if free <= 0 {
        return non_kept;
    }
    if free as usize >= non_kept.len() {
        return Vec::new();
    }

    let middle = (start + (end - start) / 2) as f64;
    let denominator = (n_keep + free) as f64;
    let mut best: Option<(f64, Vec<usize>)> = None;
    for combination in (0..non_kept.len()).combinations(free as usize) {
        let sum: i64 = combination.iter().map(|i| non_kept[*i].last_used).sum();
        let distance = ((keep_sum + sum) as f64 / denominator - middle).abs();
        if best.as_ref().map(|(d, _)| distance < *d).unwrap_or(true) {
            best = Some((distance, combination));
        }
    }
    let chosen: HashSet<usize> = best.map(|(_, c)| c.into_iter().collect()).unwrap_or_default();
    non_kept
        .iter()
        .enumerate()
        .filter(|(i, _)| !chosen.contains(i))
        .map(|(_, s)| *s)
        .collect()
}


#[cfg(test)]
mod selector_tests {
    use super::*;

    fn candidate(id: &str, last_used: i64) -> GcCandidate {
        GcCandidate {
            id: id.to_string(),
            last_used,
            is_snapshot: true,
            roots: vec![id.to_string()],
            datasets: vec![id.to_string()],
        }
    }

    #[test]
    fn keeps_all_candidates_when_the_average_is_centered() {
        // samples=4, keeps at {1,3,5}, candidates at {2,4}: both survive.
        let states: Vec<GcCandidate> = vec![
            candidate("e", 5),
            candidate("d", 4),
            candidate("c", 3),
            candidate("b", 2),
            candidate("a", 1),
        ];
        let refs: Vec<&GcCandidate> = states.iter().collect();
        let keeps = vec![true, false, true, false, true];
        let removed = select_states_to_remove(4, &refs, &keeps);
        assert!(removed.is_empty());
    }

    #[test]
    fn picks_the_candidate_closest_to_the_interval_middle() {
        // samples=3, keeps {10,20,30}, candidates {12,17,25}: 17 survives.
        let states: Vec<GcCandidate> = vec![
            candidate("k30", 30),
            candidate("c25", 25),
            candidate("k20", 20),
            candidate("c17", 17),
            candidate("c12", 12),
            candidate("k10", 10),
        ];
        let refs: Vec<&GcCandidate> = states.iter().collect();
        let keeps = vec![true, false, true, false, false, true];
        let removed = select_states_to_remove(3, &refs, &keeps);
        let removed_ids: Vec<&str> = removed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(removed_ids, vec!["c25", "c12"]);
    }

    #[test]
    fn first_combination_wins_on_ties() {
        // Identical timestamps: the two newest (listed first) survive.
        let states: Vec<GcCandidate> = (0..7).map(|i| candidate(&format!("s{}", i), 100)).collect();
        let refs: Vec<&GcCandidate> = states.iter().collect();
        let keeps = vec![false; 7];
        let removed = select_states_to_remove(2, &refs, &keeps);
        let removed_ids: Vec<&str> = removed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(removed_ids, vec!["s2", "s3", "s4", "s5", "s6"]);
    }

    #[test]
    fn everything_non_kept_goes_when_keeps_exhaust_the_slots() {
        let states: Vec<GcCandidate> = vec![
            candidate("k3", 30),
            candidate("k2", 20),
            candidate("c1", 15),
            candidate("k1", 10),
        ];
        let refs: Vec<&GcCandidate> = states.iter().collect();
        let keeps = vec![true, true, false, true];
        let removed = select_states_to_remove(1, &refs, &keeps);
        let removed_ids: Vec<&str> = removed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(removed_ids, vec!["c1"]);
    }
}
