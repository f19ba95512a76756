//! In-memory implementation of the [`Zfs`](crate::sys::zfs::Zfs) capability
//! set with copy-on-write semantics: recursive snapshots and clones, origin
//! inversion on promote, and destroys that refuse to orphan external clones.
//! It backs the core tests and is usable by consumers that want a dry
//! filesystem.

use crate::parsing::split_snapshot_name;
use crate::sys::zfs::{clone_dataset_name, dependency_closure, CanMount, Dataset, Zfs};
use anyhow::{anyhow, bail, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

pub struct MemoryZfs {
    inner: RefCell<Inner>,
}

struct Inner {
    datasets: BTreeMap<String, Dataset>,
    pool_free: HashMap<String, u8>,
    next_id: u64,
    tick: i64,
}

impl MemoryZfs {
    pub fn new(datasets: Vec<Dataset>) -> Self {
        let tick = datasets.iter().map(|d| d.last_used).max().unwrap_or(0) + 1;
        Self {
            inner: RefCell::new(Inner {
                datasets: datasets.into_iter().map(|d| (d.name.clone(), d)).collect(),
                pool_free: HashMap::new(),
                next_id: 0,
                tick,
            }),
        }
    }

    pub fn set_pool_free_space(&self, pool: &str, percent: u8) {
        self.inner.borrow_mut().pool_free.insert(pool.to_string(), percent);
    }

    /// Current copy of a dataset, for assertions.
    pub fn dataset(&self, name: &str) -> Option<Dataset> {
        self.inner.borrow().datasets.get(name).cloned()
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.inner.borrow().datasets.keys().cloned().collect()
    }

    fn subtree_names(inner: &Inner, root: &str) -> Vec<String> {
        inner
            .datasets
            .values()
            .filter(|d| !d.is_snapshot && (d.name == root || d.is_child_of(root)))
            .map(|d| d.name.clone())
            .collect()
    }
}

impl Zfs for MemoryZfs {
    fn scan(&self) -> Result<Vec<Dataset>> {
        Ok(self.inner.borrow().datasets.values().cloned().collect())
    }

    fn create(&self, path: &str, mountpoint: &str, canmount: CanMount) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.datasets.contains_key(path) {
            bail!("dataset {} already exists", path);
        }
        if let Some(parent) = path.rsplitn(2, '/').nth(1) {
            if !inner.datasets.contains_key(parent) {
                bail!("parent dataset {} does not exist", parent);
            }
        }
        let tick = inner.tick;
        inner.tick += 1;
        inner.datasets.insert(
            path.to_string(),
            Dataset {
                name: path.to_string(),
                is_snapshot: false,
                origin: String::new(),
                mountpoint: mountpoint.to_string(),
                canmount,
                mounted: false,
                bootfs: false,
                bootfs_datasets: String::new(),
                last_used: tick,
                last_booted_kernel: String::new(),
            },
        );
        Ok(())
    }

    fn snapshot(&self, tag: &str, dataset: &str, recursive: bool) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let targets = if recursive {
            Self::subtree_names(&inner, dataset)
        } else {
            vec![dataset.to_string()]
        };
        if targets.is_empty() || !inner.datasets.contains_key(dataset) {
            bail!("dataset {} does not exist", dataset);
        }
        for name in &targets {
            if inner.datasets.contains_key(&format!("{}@{}", name, tag)) {
                bail!("snapshot {}@{} already exists", name, tag);
            }
        }
        let tick = inner.tick;
        inner.tick += 1;
        let mut snapshots = Vec::new();
        for name in &targets {
            let source = &inner.datasets[name];
            let mut snap = source.clone();
            snap.name = format!("{}@{}", name, tag);
            snap.is_snapshot = true;
            snap.origin = String::new();
            snap.mounted = false;
            snap.last_used = tick;
            snapshots.push(snap);
        }
        for snap in snapshots {
            inner.datasets.insert(snap.name.clone(), snap);
        }
        Ok(())
    }

    fn clone_from(&self, snapshot: &str, suffix: &str, skip_bootfs: bool, recursive: bool) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let (snap_base, tag) =
            split_snapshot_name(snapshot).ok_or_else(|| anyhow!("{} is not a snapshot name", snapshot))?;
        if !inner.datasets.contains_key(snapshot) {
            bail!("snapshot {} does not exist", snapshot);
        }
        let root_target = clone_dataset_name(snap_base, suffix);
        if inner.datasets.contains_key(&root_target) {
            bail!("dataset {} already exists", root_target);
        }
        let members = if recursive {
            Self::subtree_names(&inner, snap_base)
        } else {
            vec![snap_base.to_string()]
        };
        let tick = inner.tick;
        inner.tick += 1;
        let mut clones = Vec::new();
        for name in &members {
            let source_snapshot = format!("{}@{}", name, tag);
            let snap = match inner.datasets.get(&source_snapshot) {
                Some(s) => s,
                None => continue,
            };
            let target = if name == snap_base {
                root_target.clone()
            } else {
                format!("{}{}", root_target, &name[snap_base.len()..])
            };
            clones.push(Dataset {
                name: target,
                is_snapshot: false,
                origin: source_snapshot,
                mountpoint: snap.mountpoint.clone(),
                canmount: CanMount::NoAuto,
                mounted: false,
                bootfs: if skip_bootfs { false } else { snap.bootfs },
                bootfs_datasets: String::new(),
                last_used: tick,
                last_booted_kernel: snap.last_booted_kernel.clone(),
            });
        }
        if clones.is_empty() {
            bail!("no dataset cloned from {}", snapshot);
        }
        for clone in clones {
            inner.datasets.insert(clone.name.clone(), clone);
        }
        Ok(())
    }

    fn promote(&self, dataset: &str) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let clone = inner
            .datasets
            .get(dataset)
            .ok_or_else(|| anyhow!("dataset {} does not exist", dataset))?
            .clone();
        if clone.origin.is_empty() {
            bail!("dataset {} is not a clone", dataset);
        }
        let (origin_base, _) = split_snapshot_name(&clone.origin)
            .ok_or_else(|| anyhow!("origin {} is not a snapshot name", clone.origin))?;
        let origin_base = origin_base.to_string();
        let clone_point = inner
            .datasets
            .get(&clone.origin)
            .map(|s| s.last_used)
            .unwrap_or_default();

        // Snapshots of the former origin taken up to the clone point migrate
        // onto the promoted dataset.
        let migrating: Vec<String> = inner
            .datasets
            .values()
            .filter(|s| {
                s.is_snapshot
                    && split_snapshot_name(&s.name).map(|(b, _)| b) == Some(origin_base.as_str())
                    && s.last_used <= clone_point
            })
            .map(|s| s.name.clone())
            .collect();
        let mut renames: Vec<(String, String)> = Vec::new();
        for old in migrating {
            let tag = split_snapshot_name(&old).map(|(_, t)| t.to_string()).unwrap();
            renames.push((old, format!("{}@{}", dataset, tag)));
        }
        for (old, new) in &renames {
            if let Some(mut snap) = inner.datasets.remove(old) {
                snap.name = new.clone();
                inner.datasets.insert(new.clone(), snap);
            }
            for d in inner.datasets.values_mut() {
                if d.origin == *old {
                    d.origin = new.clone();
                }
            }
        }

        let new_former_origin = renames
            .iter()
            .find(|(old, _)| *old == clone.origin)
            .map(|(_, new)| new.clone())
            .unwrap_or_else(|| clone.origin.clone());
        if let Some(former) = inner.datasets.get_mut(&origin_base) {
            former.origin = new_former_origin;
        }
        if let Some(promoted) = inner.datasets.get_mut(dataset) {
            promoted.origin = String::new();
        }
        Ok(())
    }

    fn destroy(&self, dataset: &str) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.datasets.contains_key(dataset) {
            bail!("dataset {} does not exist", dataset);
        }
        let doomed: Vec<String> = if dataset.contains('@') {
            // A snapshot destroy takes the same tag on children with it.
            let (base, tag) = split_snapshot_name(dataset).unwrap();
            let subtree = Self::subtree_names(&inner, base);
            subtree
                .iter()
                .map(|n| format!("{}@{}", n, tag))
                .filter(|n| inner.datasets.contains_key(n))
                .collect()
        } else {
            let subtree = Self::subtree_names(&inner, dataset);
            let mut all: Vec<String> = inner
                .datasets
                .values()
                .filter(|s| {
                    s.is_snapshot
                        && subtree
                            .iter()
                            .any(|n| split_snapshot_name(&s.name).map(|(b, _)| b) == Some(n.as_str()))
                })
                .map(|s| s.name.clone())
                .collect();
            all.extend(subtree);
            all
        };
        for survivor in inner.datasets.values() {
            if !survivor.origin.is_empty()
                && doomed.contains(&survivor.origin)
                && !doomed.contains(&survivor.name)
            {
                bail!(
                    "cannot destroy {}: clone {} depends on {}",
                    dataset,
                    survivor.name,
                    survivor.origin
                );
            }
        }
        for name in doomed {
            inner.datasets.remove(&name);
        }
        Ok(())
    }

    fn set_property(&self, property: &str, value: &str, dataset: &str, _force: bool) -> Result<()> {
        use crate::sys::zfs::{
            PROP_BOOTFS, PROP_BOOTFS_DATASETS, PROP_CANMOUNT, PROP_LAST_BOOTED_KERNEL, PROP_LAST_USED,
            PROP_MOUNTPOINT,
        };
        let mut inner = self.inner.borrow_mut();
        let d = inner
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| anyhow!("dataset {} does not exist", dataset))?;
        match property {
            PROP_CANMOUNT => {
                d.canmount =
                    CanMount::from_str(value).map_err(|_| anyhow!("invalid canmount value {}", value))?
            }
            PROP_MOUNTPOINT => d.mountpoint = value.to_string(),
            PROP_BOOTFS => d.bootfs = value == "yes" || value == "on",
            PROP_BOOTFS_DATASETS => d.bootfs_datasets = value.to_string(),
            PROP_LAST_USED => d.last_used = value.parse().map_err(|_| anyhow!("invalid last-used {}", value))?,
            PROP_LAST_BOOTED_KERNEL => d.last_booted_kernel = value.to_string(),
            other => bail!("unsupported property {}", other),
        }
        Ok(())
    }

    fn dependencies(&self, dataset: &str) -> Result<Vec<Dataset>> {
        let all: Vec<Dataset> = self.inner.borrow().datasets.values().cloned().collect();
        Ok(dependency_closure(&all, dataset))
    }

    fn pool_free_space(&self, pool: &str) -> Result<u8> {
        Ok(*self.inner.borrow().pool_free.get(pool).unwrap_or(&100))
    }

    fn generate_id(&self, length: usize) -> String {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let mut remainder = inner.next_id;
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut id = vec![b'a'; length];
        let mut pos = length;
        while remainder > 0 && pos > 0 {
            pos -= 1;
            id[pos] = ALPHABET[(remainder % 36) as usize];
            remainder /= 36;
        }
        String::from_utf8(id).unwrap()
    }
}

/// Ergonomic dataset construction for fixtures.
pub fn dataset(name: &str) -> DatasetBuilder {
    DatasetBuilder {
        dataset: Dataset {
            name: name.to_string(),
            is_snapshot: name.contains('@'),
            origin: String::new(),
            mountpoint: String::new(),
            canmount: CanMount::On,
            mounted: false,
            bootfs: false,
            bootfs_datasets: String::new(),
            last_used: 0,
            last_booted_kernel: String::new(),
        },
    }
}

pub struct DatasetBuilder {
    dataset: Dataset,
}

impl DatasetBuilder {
    pub fn mountpoint(mut self, value: &str) -> Self {
        self.dataset.mountpoint = value.to_string();
        self
    }

    pub fn canmount(mut self, value: CanMount) -> Self {
        self.dataset.canmount = value;
        self
    }

    pub fn mounted(mut self) -> Self {
        self.dataset.mounted = true;
        self
    }

    pub fn bootfs(mut self) -> Self {
        self.dataset.bootfs = true;
        self
    }

    pub fn origin(mut self, value: &str) -> Self {
        self.dataset.origin = value.to_string();
        self
    }

    pub fn bootfs_datasets(mut self, value: &str) -> Self {
        self.dataset.bootfs_datasets = value.to_string();
        self
    }

    pub fn last_used(mut self, value: i64) -> Self {
        self.dataset.last_used = value;
        self
    }

    pub fn last_booted_kernel(mut self, value: &str) -> Self {
        self.dataset.last_booted_kernel = value.to_string();
        self
    }

    pub fn build(self) -> Dataset {
        self.dataset
    }
}
