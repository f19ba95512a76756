use crate::parsing::{base_name, parse_key_value_pair_lines, split_snapshot_name, StringPair};
use crate::sys::CancelToken;
#[mockall_double::double]
use crate::sys::process::double as process_double;
use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use process_double::run_command_as_result;
use serde::Deserialize;
use std::collections::HashSet;
use std::process::Command;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Dataset user properties the engine reads and writes.
pub const PROP_BOOTFS: &str = "com.zsys:bootfs";
pub const PROP_BOOTFS_DATASETS: &str = "com.zsys:bootfs-datasets";
pub const PROP_LAST_USED: &str = "com.zsys:last-used";
pub const PROP_LAST_BOOTED_KERNEL: &str = "com.zsys:last-booted-kernel";
pub const PROP_MOUNTPOINT: &str = "mountpoint";
pub const PROP_CANMOUNT: &str = "canmount";

// Snapshots record the source mountpoint and canmount at creation time so
// history states keep the layout they were taken with.
const PROP_SNAPSHOT_MOUNTPOINT: &str = "com.zsys:mountpoint";
const PROP_SNAPSHOT_CANMOUNT: &str = "com.zsys:canmount";

#[derive(Display, EnumString, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanMount {
    #[strum(serialize = "on")]
    On,
    #[strum(serialize = "off")]
    Off,
    #[strum(serialize = "noauto")]
    NoAuto,
}

impl Default for CanMount {
    fn default() -> Self {
        CanMount::On
    }
}

/// One scanned dataset, filesystem or snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub is_snapshot: bool,
    /// Snapshot this dataset was cloned from, empty when not a clone.
    pub origin: String,
    pub mountpoint: String,
    pub canmount: CanMount,
    pub mounted: bool,
    /// Eligible as a boot root.
    pub bootfs: bool,
    /// Raw comma-separated list of associated state identifiers.
    pub bootfs_datasets: String,
    /// Seconds since epoch.
    pub last_used: i64,
    pub last_booted_kernel: String,
}

impl Dataset {
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }

    pub fn snapshot_tag(&self) -> Option<&str> {
        split_snapshot_name(&self.name).map(|(_, tag)| tag)
    }

    pub fn is_child_of(&self, ancestor: &str) -> bool {
        self.name.starts_with(ancestor) && self.name[ancestor.len()..].starts_with('/')
    }
}

/// Capability set of the copy-on-write filesystem this engine drives.
///
/// The production implementation shells out to the zfs tooling; tests run
/// against [`crate::sys::mock::MemoryZfs`].
pub trait Zfs {
    fn scan(&self) -> Result<Vec<Dataset>>;
    fn create(&self, path: &str, mountpoint: &str, canmount: CanMount) -> Result<()>;
    fn snapshot(&self, tag: &str, dataset: &str, recursive: bool) -> Result<()>;
    /// Clones `snapshot` (a `dataset@tag` name) into a sibling tree whose
    /// basename suffix after the last `_` is replaced by `suffix`.
    fn clone_from(&self, snapshot: &str, suffix: &str, skip_bootfs: bool, recursive: bool) -> Result<()>;
    fn promote(&self, dataset: &str) -> Result<()>;
    /// Recursive destroy of the dataset and its snapshots. Fails when a
    /// snapshot in the subtree still has a clone outside of it.
    fn destroy(&self, dataset: &str) -> Result<()>;
    fn set_property(&self, property: &str, value: &str, dataset: &str, force: bool) -> Result<()>;
    /// Transitive dependency closure of a dataset: snapshots of it and its
    /// children, clones of those snapshots, and everything depending on the
    /// clones in turn. The queried dataset itself is not part of the result.
    fn dependencies(&self, dataset: &str) -> Result<Vec<Dataset>>;
    /// Free space of a pool as an integer percentage.
    fn pool_free_space(&self, pool: &str) -> Result<u8>;
    /// Random lowercase alphanumeric identifier.
    fn generate_id(&self, length: usize) -> String;
}

/// Scoped write handle. Mutating calls check the cancellation token first;
/// dropping the handle without [`Transaction::done`] releases it and logs the
/// writes already flushed (they are not rolled back).
pub struct Transaction<'a> {
    zfs: &'a dyn Zfs,
    ctx: &'a CancelToken,
    writes: usize,
    completed: bool,
}

impl<'a> Transaction<'a> {
    pub fn new(zfs: &'a dyn Zfs, ctx: &'a CancelToken) -> Self {
        Self {
            zfs,
            ctx,
            writes: 0,
            completed: false,
        }
    }

    fn checkpoint(&self) -> Result<()> {
        self.ctx.ensure()
    }

    pub fn snapshot(&mut self, tag: &str, dataset: &str, recursive: bool) -> Result<()> {
        self.checkpoint()?;
        self.zfs.snapshot(tag, dataset, recursive)?;
        self.writes += 1;
        Ok(())
    }

    pub fn clone_from(&mut self, snapshot: &str, suffix: &str, skip_bootfs: bool, recursive: bool) -> Result<()> {
        self.checkpoint()?;
        self.zfs.clone_from(snapshot, suffix, skip_bootfs, recursive)?;
        self.writes += 1;
        Ok(())
    }

    pub fn promote(&mut self, dataset: &str) -> Result<()> {
        self.checkpoint()?;
        self.zfs.promote(dataset)?;
        self.writes += 1;
        Ok(())
    }

    pub fn set_property(&mut self, property: &str, value: &str, dataset: &str, force: bool) -> Result<()> {
        self.checkpoint()?;
        self.zfs.set_property(property, value, dataset, force)?;
        self.writes += 1;
        Ok(())
    }

    pub fn create(&mut self, path: &str, mountpoint: &str, canmount: CanMount) -> Result<()> {
        self.checkpoint()?;
        self.zfs.create(path, mountpoint, canmount)?;
        self.writes += 1;
        Ok(())
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn done(mut self) -> usize {
        self.completed = true;
        self.writes
    }
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        if !self.completed && self.writes > 0 {
            slog_scope::debug!("transaction released after {} flushed writes", self.writes);
        }
    }
}

/// Name a clone of `snapshot_base` takes when its suffix is swapped for
/// `suffix`: the basename part after the last `_` is replaced, or the suffix
/// is appended when the basename has none.
pub fn clone_dataset_name(snapshot_base: &str, suffix: &str) -> String {
    let base = base_name(snapshot_base);
    let parent_len = snapshot_base.len() - base.len();
    let renamed = match base.rfind('_') {
        Some(idx) => format!("{}_{}", &base[..idx], suffix),
        None => format!("{}_{}", base, suffix),
    };
    format!("{}{}", &snapshot_base[..parent_len], renamed)
}

/// Transitive dependency closure over a scanned dataset list. Children land
/// before their parents and clones before the snapshot they originate from,
/// which is the order destruction has to follow.
pub fn dependency_closure(all: &[Dataset], root: &str) -> Vec<Dataset> {
    let mut visited = HashSet::new();
    let mut out = Vec::new();
    visit_dependencies(all, root, &mut visited, &mut out);
    out.retain(|d| d.name != root);
    out
}

fn visit_dependencies(all: &[Dataset], name: &str, visited: &mut HashSet<String>, out: &mut Vec<Dataset>) {
    if !visited.insert(name.to_string()) {
        return;
    }
    if let Some((base, tag)) = split_snapshot_name(name) {
        // A snapshot takes the same tag on children with it; clones of any
        // of those hold it in place.
        let covered: Vec<&Dataset> = all
            .iter()
            .filter(|s| {
                s.is_snapshot
                    && match split_snapshot_name(&s.name) {
                        Some((b, t)) => t == tag && (b == base || (b.starts_with(base) && b[base.len()..].starts_with('/'))),
                        None => false,
                    }
            })
            .collect();
        for snap in covered {
            for clone in all.iter().filter(|c| !c.is_snapshot && c.origin == snap.name) {
                visit_dependencies(all, &clone.name, visited, out);
            }
            if !out.iter().any(|d| d.name == snap.name) {
                out.push(snap.clone());
            }
        }
        return;
    }
    let mut subtree: Vec<&Dataset> = all
        .iter()
        .filter(|d| !d.is_snapshot && (d.name == name || d.is_child_of(name)))
        .collect();
    subtree.sort_by(|a, b| a.name.cmp(&b.name));

    for member in &subtree {
        let snapshots = all
            .iter()
            .filter(|s| s.is_snapshot && split_snapshot_name(&s.name).map(|(b, _)| b) == Some(member.name.as_str()));
        for snap in snapshots {
            for clone in all.iter().filter(|c| !c.is_snapshot && c.origin == snap.name) {
                visit_dependencies(all, &clone.name, visited, out);
            }
            if !out.iter().any(|d| d.name == snap.name) {
                out.push(snap.clone());
            }
        }
    }
    for member in subtree.iter().rev() {
        if !out.iter().any(|d| d.name == member.name) {
            out.push((*member).clone());
        }
    }
}

fn zfs_command() -> Command {
    Command::new("zfs")
}

fn zpool_command() -> Command {
    Command::new("zpool")
}

const SCAN_COLUMNS: &str = "name,creation,origin,mountpoint,canmount,mounted,\
                            com.zsys:bootfs,com.zsys:bootfs-datasets,com.zsys:last-used,\
                            com.zsys:last-booted-kernel,com.zsys:mountpoint,com.zsys:canmount";

/// Production implementation backed by the zfs and zpool command line tools.
#[derive(Debug, Default)]
pub struct ZfsCli;

impl ZfsCli {
    fn list(&self, extra_args: &[&str]) -> Result<Vec<Dataset>> {
        let output_data = run_command_as_result({
            let mut command = zfs_command();
            command
                .args(&["list", "-Hp", "-t", "filesystem,snapshot", "-o", SCAN_COLUMNS])
                .args(extra_args);
            command
        })?;
        output_data
            .lines()
            .map(parse_scan_line)
            .collect::<Result<Vec<_>>>()
            .context("failed to parse zfs list output")
    }

    /// Properties of a single dataset, via `zfs get`.
    pub fn dataset(&self, name: &str) -> Result<Dataset> {
        let output_data = run_command_as_result({
            let mut command = zfs_command();
            command.args(&["get", "-Hp", "-o", "property,value", "all"]).arg(name);
            command
        })?;
        let kvps = parse_key_value_pair_lines::<_, Vec<StringPair>>(output_data.lines(), "\t")
            .context("failed to parse output of zfs get")?;
        let raw = envy::from_iter::<_, RawProps>(kvps.into_iter().filter_map(|x| {
            if x.1 != "-" {
                Some((x.0.to_uppercase(), x.1))
            } else {
                None
            }
        }))
        .context("failed loading dataset information from zfs get output")?;
        raw.into_dataset(name)
    }
}

impl Zfs for ZfsCli {
    fn scan(&self) -> Result<Vec<Dataset>> {
        self.list(&[])
    }

    fn create(&self, path: &str, mountpoint: &str, canmount: CanMount) -> Result<()> {
        run_command_as_result({
            let mut command = zfs_command();
            command
                .args(&["create", "-p"])
                .arg(format!("-o{}={}", PROP_MOUNTPOINT, mountpoint))
                .arg(format!("-o{}={}", PROP_CANMOUNT, canmount))
                .arg(path);
            command
        })
        .context(format!("failed to create dataset {}", path))
        .map(|_| ())
    }

    fn snapshot(&self, tag: &str, dataset: &str, recursive: bool) -> Result<()> {
        let source = self.dataset(dataset)?;
        run_command_as_result({
            let mut command = zfs_command();
            command.arg("snapshot");
            if recursive {
                command.arg("-r");
            }
            command.arg(format!("{}@{}", dataset, tag));
            command
        })
        .context(format!("failed to snapshot {}@{}", dataset, tag))?;
        // Record the source layout on the snapshot.
        let snapshot_name = format!("{}@{}", dataset, tag);
        self.set_property(PROP_SNAPSHOT_MOUNTPOINT, &source.mountpoint, &snapshot_name, false)?;
        self.set_property(PROP_SNAPSHOT_CANMOUNT, &source.canmount.to_string(), &snapshot_name, false)
    }

    fn clone_from(&self, snapshot: &str, suffix: &str, skip_bootfs: bool, recursive: bool) -> Result<()> {
        let (snap_base, tag) =
            split_snapshot_name(snapshot).ok_or_else(|| anyhow!("{} is not a snapshot name", snapshot))?;
        let root_target = clone_dataset_name(snap_base, suffix);
        let subtree = if recursive {
            self.list(&["-r", snap_base])?
        } else {
            vec![self.dataset(snap_base)?]
        };

        let mut cloned_any = false;
        for d in subtree.iter().filter(|d| !d.is_snapshot) {
            if skip_bootfs && d.bootfs {
                continue;
            }
            let has_tag = subtree
                .iter()
                .any(|s| s.is_snapshot && s.name == format!("{}@{}", d.name, tag));
            if !has_tag {
                continue;
            }
            let target = if d.name == snap_base {
                root_target.clone()
            } else {
                format!("{}{}", root_target, &d.name[snap_base.len()..])
            };
            run_command_as_result({
                let mut command = zfs_command();
                command
                    .arg("clone")
                    .arg(format!("-o{}={}", PROP_CANMOUNT, CanMount::NoAuto))
                    .arg(format!("{}@{}", d.name, tag))
                    .arg(&target);
                command
            })
            .context(format!("failed to clone {}@{} to {}", d.name, tag, target))?;
            cloned_any = true;
        }
        if !cloned_any {
            bail!("no dataset cloned from {}", snapshot);
        }
        Ok(())
    }

    fn promote(&self, dataset: &str) -> Result<()> {
        run_command_as_result({
            let mut command = zfs_command();
            command.arg("promote").arg(dataset);
            command
        })
        .context(format!("failed to promote {}", dataset))
        .map(|_| ())
    }

    fn destroy(&self, dataset: &str) -> Result<()> {
        run_command_as_result({
            let mut command = zfs_command();
            command.args(&["destroy", "-r"]).arg(dataset);
            command
        })
        .context(format!("failed to destroy {}", dataset))
        .map(|_| ())
    }

    fn set_property(&self, property: &str, value: &str, dataset: &str, _force: bool) -> Result<()> {
        run_command_as_result({
            let mut command = zfs_command();
            command.arg("set").arg(format!("{}={}", property, value)).arg(dataset);
            command
        })
        .context(format!("failed to set {}={} on {}", property, value, dataset))
        .map(|_| ())
    }

    fn dependencies(&self, dataset: &str) -> Result<Vec<Dataset>> {
        let all = self.scan()?;
        Ok(dependency_closure(&all, dataset))
    }

    fn pool_free_space(&self, pool: &str) -> Result<u8> {
        let output_data = run_command_as_result({
            let mut command = zpool_command();
            command.args(&["list", "-Hp", "-o", "capacity"]).arg(pool);
            command
        })?;
        let used: u8 = output_data
            .trim()
            .trim_end_matches('%')
            .parse()
            .context(format!("unparsable capacity for pool {}", pool))?;
        Ok(100u8.saturating_sub(used))
    }

    fn generate_id(&self, length: usize) -> String {
        let mut id = String::with_capacity(length);
        while id.len() < length {
            let chunk = uuid::Uuid::new_v4().to_simple().to_string();
            id.push_str(&chunk[..(length - id.len()).min(chunk.len())]);
        }
        id
    }
}

fn parse_scan_line(line: &str) -> Result<Dataset> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 12 {
        bail!("unexpected field count {} in zfs list line: {}", fields.len(), line);
    }
    let name = fields[0].to_string();
    let is_snapshot = name.contains('@');
    let creation: i64 = fields[1].parse().unwrap_or(0);
    let opt = |v: &str| if v == "-" { String::new() } else { v.to_string() };

    let mountpoint = if is_snapshot { opt(fields[10]) } else { opt(fields[3]) };
    let canmount_raw = if is_snapshot { opt(fields[11]) } else { opt(fields[4]) };
    let canmount = match canmount_raw.as_str() {
        "" => CanMount::default(),
        v => CanMount::from_str(v).map_err(|_| anyhow!("invalid canmount value {} on {}", v, name))?,
    };
    let last_used = match fields[8] {
        "-" => creation,
        v => v.parse().unwrap_or(creation),
    };

    Ok(Dataset {
        is_snapshot,
        origin: opt(fields[2]),
        mountpoint,
        canmount,
        mounted: fields[5] == "yes",
        bootfs: fields[6] == "yes" || fields[6] == "on",
        bootfs_datasets: opt(fields[7]),
        last_used,
        last_booted_kernel: opt(fields[9]),
        name,
    })
}

#[derive(Deserialize, Debug)]
struct RawProps {
    #[serde(default)]
    creation: Option<String>,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    canmount: Option<String>,
    #[serde(default)]
    mounted: Option<String>,
    #[serde(rename = "com.zsys:bootfs", default)]
    bootfs: Option<String>,
    #[serde(rename = "com.zsys:bootfs-datasets", default)]
    bootfs_datasets: Option<String>,
    #[serde(rename = "com.zsys:last-used", default)]
    last_used: Option<String>,
    #[serde(rename = "com.zsys:last-booted-kernel", default)]
    last_booted_kernel: Option<String>,
    #[serde(rename = "com.zsys:mountpoint", default)]
    snapshot_mountpoint: Option<String>,
    #[serde(rename = "com.zsys:canmount", default)]
    snapshot_canmount: Option<String>,
}

impl RawProps {
    fn into_dataset(self, name: &str) -> Result<Dataset> {
        let is_snapshot = name.contains('@');
        let creation: i64 = self.creation.as_deref().unwrap_or("0").parse().unwrap_or(0);
        let mountpoint = if is_snapshot {
            self.snapshot_mountpoint
        } else {
            self.mountpoint
        };
        let canmount_raw = if is_snapshot { self.snapshot_canmount } else { self.canmount };
        let canmount = match canmount_raw.as_deref() {
            None | Some("") => CanMount::default(),
            Some(v) => CanMount::from_str(v).map_err(|_| anyhow!("invalid canmount value {} on {}", v, name))?,
        };
        Ok(Dataset {
            name: name.to_string(),
            is_snapshot,
            origin: self.origin.unwrap_or_default(),
            mountpoint: mountpoint.unwrap_or_default(),
            canmount,
            mounted: self.mounted.as_deref() == Some("yes"),
            bootfs: matches!(self.bootfs.as_deref(), Some("yes") | Some("on")),
            bootfs_datasets: self.bootfs_datasets.unwrap_or_default(),
            last_used: self
                .last_used
                .and_then(|v| v.parse().ok())
                .unwrap_or(creation),
            last_booted_kernel: self.last_booted_kernel.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod scan_tests {
    use super::*;
    use crate::tests::prelude::*;

    const LIST_DATA: &str = indoc!(
        "rpool\t1577836800\t-\t/\toff\tno\t-\t-\t-\t-\t-\t-
         rpool/ROOT/ubuntu_1234\t1577836800\t-\t/\ton\tyes\tyes\t-\t1577900000\tvmlinuz-5.4.0-42-generic\t-\t-
         rpool/ROOT/ubuntu_1234@snap1\t1577840000\t-\t-\t-\t-\tyes\t-\t-\t-\t/\ton
         rpool/ROOT/ubuntu_5678\t1577850000\trpool/ROOT/ubuntu_1234@snap1\t/\tnoauto\tno\tyes\t-\t-\t-\t-\t-"
    );

    #[test]
    #[serial(fakecmd)]
    fn scan_parses_filesystems_and_snapshots() {
        let ctx = process_double::run_command_as_result_context();
        ctx.expect().returning(|_| Ok(LIST_DATA.to_string()));

        let datasets = ZfsCli::default().scan().unwrap();
        assert_eq!(datasets.len(), 4);

        assert_eq!(datasets[0].name, "rpool");
        assert_eq!(datasets[0].canmount, CanMount::Off);
        assert!(!datasets[0].mounted);

        let root = &datasets[1];
        assert!(root.bootfs);
        assert!(root.mounted);
        assert_eq!(root.last_used, 1577900000);
        assert_eq!(root.last_booted_kernel, "vmlinuz-5.4.0-42-generic");

        let snap = &datasets[2];
        assert!(snap.is_snapshot);
        assert_eq!(snap.mountpoint, "/");
        assert_eq!(snap.canmount, CanMount::On);
        assert_eq!(snap.last_used, 1577840000);

        let clone = &datasets[3];
        assert_eq!(clone.origin, "rpool/ROOT/ubuntu_1234@snap1");
        assert_eq!(clone.canmount, CanMount::NoAuto);
    }

    #[test]
    #[serial(fakecmd)]
    fn pool_free_space_inverts_capacity() {
        let ctx = process_double::run_command_as_result_context();
        ctx.expect().returning(|_| Ok("83\n".to_string()));

        assert_eq!(ZfsCli::default().pool_free_space("rpool").unwrap(), 17);
    }

    #[test]
    fn generated_ids_are_lowercase_alphanumeric() {
        let id = ZfsCli::default().generate_id(6);
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
