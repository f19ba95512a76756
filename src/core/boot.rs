//! Boot lifecycle: EnsureBoot finishes what the boot loader started
//! (cloning from snapshots on revert, consolidating canmount), Commit makes
//! the booted state durable (tagging, last-used, kernel record, promotion).

use super::{cmdline, Machines};
use crate::parsing::{add_tag, remove_tag, split_snapshot_name, state_suffix};
use crate::sys::clock::Clock;
use crate::sys::zfs::{
    clone_dataset_name, CanMount, Transaction, Zfs, PROP_BOOTFS_DATASETS, PROP_CANMOUNT, PROP_LAST_BOOTED_KERNEL,
    PROP_LAST_USED,
};
use crate::sys::CancelToken;
use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;

impl Machines {
    /// Aligns the filesystem with the state the session booted from.
    ///
    /// Returns true when any filesystem change was issued.
    pub fn ensure_boot(&mut self, ctx: &CancelToken, zfs: &dyn Zfs) -> Result<bool> {
        let root = match self.boot_guards() {
            Some(root) => root,
            None => return Ok(false),
        };
        let revert = cmdline::revert_user_data(&self.cmdline);
        let mut changed = false;

        let machine_id = self.current().map(|m| m.id.clone()).unwrap_or_default();
        let booted_id = self.current().unwrap().booted_state_id(&root)?;

        if cmdline::booted_on_snapshot(&self.cmdline) && machine_id != booted_id {
            // The boot loader synthesized a clone from the snapshot; finish
            // cloning whatever is missing under the same suffix.
            let suffix = state_suffix(&booted_id)?.to_string();
            let (system_roots, user_roots, booted_has_users) = {
                let machine = self.current().unwrap();
                let snapshot_state = machine
                    .history
                    .get(&root)
                    .ok_or_else(|| anyhow!("booted snapshot state {} is unknown", root))?;
                let system_roots = independent_roots(
                    snapshot_state.route_roots().map(|d| d.name.clone()).collect(),
                );
                let user_roots: Vec<String> = snapshot_state
                    .users
                    .values()
                    .flat_map(|us| us.route_roots().map(|d| d.name.clone()))
                    .collect();
                let booted_has_users = machine
                    .state_by_id(&booted_id)
                    .map(|s| !s.users.is_empty())
                    .unwrap_or(false);
                (system_roots, user_roots, booted_has_users)
            };

            let mut txn = Transaction::new(zfs, ctx);
            for name in &system_roots {
                match txn.clone_from(name, &suffix, true, true) {
                    Ok(()) => changed = true,
                    // Assume a prior EnsureBoot in this boot already cloned it.
                    Err(err) => slog_scope::info!("cannot clone {}, assuming it exists: {}", name, err),
                }
            }
            if revert && !booted_has_users {
                let user_suffix = zfs.generate_id(6);
                for name in &user_roots {
                    txn.clone_from(name, &user_suffix, false, true)
                        .context(format!("cannot clone user dataset {} for revert", name))?;
                    let (snap_base, _) = split_snapshot_name(name)
                        .ok_or_else(|| anyhow!("user state root {} is not a snapshot", name))?;
                    let new_name = clone_dataset_name(snap_base, &user_suffix);
                    txn.set_property(PROP_BOOTFS_DATASETS, &booted_id, &new_name, false)?;
                    changed = true;
                }
            }
            txn.done();
            if changed {
                self.rescan(ctx, zfs)?;
            }
        }

        // canmount consolidation: everything outside the booted state loses
        // automount, the booted state gains it back.
        let booted_id = self
            .current()
            .ok_or_else(|| anyhow!("current machine disappeared after rescan"))?
            .booted_state_id(&root)?;
        let (noauto_targets, on_targets) = {
            let machine = self.current().unwrap();
            let booted_state = machine
                .state_by_id(&booted_id)
                .ok_or_else(|| anyhow!("booted state {} is unknown", booted_id))?;
            // Without user-data revert the main state user data stays the
            // current one.
            let user_source = if revert { booted_state } else { &machine.state };

            let mut booted: HashSet<&str> = booted_state.system_datasets().map(|d| d.name.as_str()).collect();
            booted.extend(user_source.user_datasets().map(|d| d.name.as_str()));

            let noauto: Vec<String> = self
                .all_system_datasets
                .iter()
                .chain(self.all_user_datasets.iter())
                .filter(|d| !d.is_snapshot && !booted.contains(d.name.as_str()) && d.canmount == CanMount::On)
                .map(|d| d.name.clone())
                .collect();
            let on: Vec<String> = booted_state
                .system_datasets()
                .chain(user_source.user_datasets())
                .filter(|d| !d.is_snapshot && d.canmount == CanMount::NoAuto)
                .map(|d| d.name.clone())
                .collect();
            (noauto, on)
        };

        let mut txn = Transaction::new(zfs, ctx);
        for name in &noauto_targets {
            txn.set_property(PROP_CANMOUNT, "noauto", name, false)?;
        }
        for name in &on_targets {
            txn.set_property(PROP_CANMOUNT, "on", name, false)?;
        }
        if txn.done() > 0 {
            changed = true;
            self.rescan(ctx, zfs)?;
        }
        Ok(changed)
    }

    /// Records the booted state as the machine's durable reality: tags user
    /// datasets, stamps last-used, records the kernel and promotes clones.
    ///
    /// Returns true when the boot loader needs to rebuild its menus, that is
    /// when the kernel changed or a promotion inverted an origin relation.
    pub fn commit(&mut self, ctx: &CancelToken, zfs: &dyn Zfs, clock: &dyn Clock) -> Result<bool> {
        let root = match self.boot_guards() {
            Some(root) => root,
            None => return Ok(false),
        };
        let revert = cmdline::revert_user_data(&self.cmdline);
        let kernel = cmdline::kernel_from_cmdline(&self.cmdline);
        let mut changed = false;

        let booted_id = self.current().unwrap().booted_state_id(&root)?;
        let plan = {
            let machine = self.current().unwrap();
            let booted_state = machine
                .state_by_id(&booted_id)
                .ok_or_else(|| anyhow!("booted state {} is unknown", booted_id))?;
            let user_source = if revert { booted_state } else { &machine.state };

            let booted_users: Vec<(String, String, String)> = user_source
                .user_datasets()
                .filter(|d| !d.is_snapshot)
                .map(|d| (d.name.clone(), d.bootfs_datasets.clone(), d.origin.clone()))
                .collect();
            let booted_user_names: HashSet<&str> = booted_users.iter().map(|(n, _, _)| n.as_str()).collect();

            let untag: Vec<(String, String)> = self
                .all_user_datasets
                .iter()
                .filter(|d| !d.is_snapshot && !booted_user_names.contains(d.name.as_str()))
                .filter_map(|d| remove_tag(&d.bootfs_datasets, &booted_id).map(|tags| (d.name.clone(), tags)))
                .collect();
            let tag: Vec<(String, String)> = booted_users
                .iter()
                .filter_map(|(name, tags, _)| add_tag(tags, &booted_id).map(|t| (name.clone(), t)))
                .collect();

            let last_used: Vec<String> = booted_state
                .system_datasets()
                .filter(|d| !d.is_snapshot)
                .map(|d| d.name.clone())
                .chain(booted_users.iter().map(|(n, _, _)| n.clone()))
                .collect();

            let kernel_update = match (&kernel, booted_state.root_dataset()) {
                (Some(kernel), Some(d)) if d.last_booted_kernel != *kernel => Some(d.name.clone()),
                _ => None,
            };

            let promote_users: Vec<String> = booted_users
                .iter()
                .filter(|(_, _, origin)| !origin.is_empty())
                .map(|(n, _, _)| n.clone())
                .collect();
            let promote_system: Vec<String> = booted_state
                .system_datasets()
                .filter(|d| !d.is_snapshot && !d.origin.is_empty())
                .map(|d| d.name.clone())
                .collect();

            (untag, tag, last_used, kernel_update, promote_users, promote_system)
        };
        let (untag, tag, last_used, kernel_update, promote_users, promote_system) = plan;

        let mut txn = Transaction::new(zfs, ctx);
        for (name, tags) in untag.iter().chain(tag.iter()) {
            txn.set_property(PROP_BOOTFS_DATASETS, tags, name, false)?;
        }
        // last-used moves on every boot and is deliberately not a change
        // signal.
        let now = clock.now().timestamp().to_string();
        for name in &last_used {
            txn.set_property(PROP_LAST_USED, &now, name, false)?;
        }
        if let (Some(kernel), Some(dataset)) = (&kernel, &kernel_update) {
            txn.set_property(PROP_LAST_BOOTED_KERNEL, kernel, dataset, false)?;
            changed = true;
        }
        for name in promote_users.iter().chain(promote_system.iter()) {
            txn.promote(name)?;
            changed = true;
        }
        txn.done();

        self.rescan(ctx, zfs)?;
        Ok(changed)
    }

    /// Both boot entry points bail out silently without a managed current
    /// machine or a root identifier.
    fn boot_guards(&self) -> Option<String> {
        let machine = self.current()?;
        if !machine.is_zsys {
            slog_scope::debug!("machine {} is not managed, skipping boot handling", machine.id);
            return None;
        }
        cmdline::root_from_cmdline(&self.cmdline)
    }
}

/// Keeps only roots with no ancestor in the set, comparing the filesystem
/// part of snapshot names.
fn independent_roots(names: Vec<String>) -> Vec<String> {
    let bases: Vec<String> = names
        .iter()
        .map(|n| n.splitn(2, '@').next().unwrap_or(n).to_string())
        .collect();
    names
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            let base = &bases[*i];
            !bases
                .iter()
                .enumerate()
                .any(|(j, other)| j != *i && base.starts_with(other.as_str()) && base[other.len()..].starts_with('/'))
        })
        .map(|(_, n)| n.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Config;
    use crate::sys::clock::FakeClock;
    use crate::sys::mock::{dataset, MemoryZfs};
    use chrono::{TimeZone, Utc};

    const SNAPSHOT_BOOT: &str = "root=ZFS=rpool/ROOT/ubuntu_1234@snap1 zsys-revert=userdata \
                                 BOOT_IMAGE=/boot/vmlinuz-5.4.0-42-generic";

    fn revert_fixture() -> MemoryZfs {
        MemoryZfs::new(vec![
            dataset("rpool").mountpoint("/").canmount(CanMount::Off).build(),
            dataset("bpool").mountpoint("/boot").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT").mountpoint("none").canmount(CanMount::Off).build(),
            dataset("bpool/BOOT").mountpoint("none").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT/ubuntu_1234").mountpoint("/").bootfs().last_used(1000).build(),
            dataset("rpool/ROOT/ubuntu_1234@snap1").mountpoint("/").bootfs().last_used(900).build(),
            dataset("bpool/BOOT/ubuntu_1234").mountpoint("/boot").last_used(1000).build(),
            dataset("bpool/BOOT/ubuntu_1234@snap1").mountpoint("/boot").last_used(900).build(),
            dataset("rpool/USERDATA").mountpoint("/").canmount(CanMount::Off).build(),
            dataset("rpool/USERDATA/user1_abcdef")
                .mountpoint("/home/user1")
                .bootfs_datasets("rpool/ROOT/ubuntu_1234")
                .last_used(1000)
                .build(),
            dataset("rpool/USERDATA/user1_abcdef@snap1")
                .mountpoint("/home/user1")
                .last_used(900)
                .build(),
            // The initramfs already cloned the root pool part of the state.
            dataset("rpool/ROOT/ubuntu_4242")
                .mountpoint("/")
                .mounted()
                .bootfs()
                .canmount(CanMount::NoAuto)
                .origin("rpool/ROOT/ubuntu_1234@snap1")
                .last_used(1100)
                .build(),
        ])
    }

    fn machines_on(zfs: &MemoryZfs, boot_cmdline: &str) -> Machines {
        Machines::new(&CancelToken::new(), zfs, boot_cmdline, Config::default()).unwrap()
    }

    #[test]
    fn ensure_boot_completes_a_snapshot_revert() {
        let zfs = revert_fixture();
        let mut machines = machines_on(&zfs, SNAPSHOT_BOOT);
        let changed = machines.ensure_boot(&CancelToken::new(), &zfs).unwrap();
        assert!(changed);

        // The missing boot pool root was cloned under the booted suffix.
        assert!(zfs.dataset("bpool/BOOT/ubuntu_4242").is_some());
        // User data was cloned under a fresh suffix and tagged with the
        // booted state.
        let user_clone = zfs.dataset("rpool/USERDATA/user1_aaaaab").unwrap();
        assert_eq!(user_clone.bootfs_datasets, "rpool/ROOT/ubuntu_4242");
        assert_eq!(user_clone.mountpoint, "/home/user1");

        // canmount consolidation: booted state on, previous state noauto.
        assert_eq!(zfs.dataset("rpool/ROOT/ubuntu_4242").unwrap().canmount, CanMount::On);
        assert_eq!(zfs.dataset("bpool/BOOT/ubuntu_4242").unwrap().canmount, CanMount::On);
        assert_eq!(user_clone.canmount, CanMount::On);
        assert_eq!(
            zfs.dataset("rpool/ROOT/ubuntu_1234").unwrap().canmount,
            CanMount::NoAuto
        );
        assert_eq!(
            zfs.dataset("rpool/USERDATA/user1_abcdef").unwrap().canmount,
            CanMount::NoAuto
        );
    }

    #[test]
    fn ensure_boot_is_idempotent() {
        let zfs = revert_fixture();
        let mut machines = machines_on(&zfs, SNAPSHOT_BOOT);
        assert!(machines.ensure_boot(&CancelToken::new(), &zfs).unwrap());
        let snapshot = format!("{:?}", zfs.dataset_names());
        assert!(!machines.ensure_boot(&CancelToken::new(), &zfs).unwrap());
        assert_eq!(snapshot, format!("{:?}", zfs.dataset_names()));
    }

    #[test]
    fn ensure_boot_without_current_machine_is_a_noop() {
        let zfs = MemoryZfs::new(vec![dataset("rpool").mountpoint("/").bootfs().build()]);
        let mut machines = machines_on(&zfs, "root=ZFS=other");
        assert!(!machines.ensure_boot(&CancelToken::new(), &zfs).unwrap());
    }

    #[test]
    fn commit_records_kernel_and_promotes() {
        let zfs = revert_fixture();
        let clock = FakeClock::at(Utc.timestamp(2000, 0));
        let mut machines = machines_on(&zfs, SNAPSHOT_BOOT);
        machines.ensure_boot(&CancelToken::new(), &zfs).unwrap();

        let changed = machines.commit(&CancelToken::new(), &zfs, &clock).unwrap();
        assert!(changed);

        // Promotion re-keyed the machine onto the booted clone.
        let machine = machines.current().unwrap();
        assert_eq!(machine.id, "rpool/ROOT/ubuntu_4242");
        assert_eq!(zfs.dataset("rpool/ROOT/ubuntu_4242").unwrap().origin, "");
        assert_eq!(
            zfs.dataset("rpool/ROOT/ubuntu_1234").unwrap().origin,
            "rpool/ROOT/ubuntu_4242@snap1"
        );

        let booted_root = zfs.dataset("rpool/ROOT/ubuntu_4242").unwrap();
        assert_eq!(booted_root.last_booted_kernel, "vmlinuz-5.4.0-42-generic");
        assert_eq!(booted_root.last_used, 2000);

        // Second commit changes nothing anymore.
        assert!(!machines.commit(&CancelToken::new(), &zfs, &clock).unwrap());
    }

    #[test]
    fn commit_kernel_change_alone_signals_menu_rebuild() {
        let zfs = MemoryZfs::new(vec![
            dataset("rpool/ROOT/ubuntu_1234")
                .mountpoint("/")
                .mounted()
                .bootfs()
                .last_booted_kernel("vmlinuz-5.2.0-8-generic")
                .build(),
        ]);
        let clock = FakeClock::at(Utc.timestamp(2000, 0));
        let mut machines = machines_on(
            &zfs,
            "root=ZFS=rpool/ROOT/ubuntu_1234 BOOT_IMAGE=/boot/vmlinuz-5.4.0-42-generic",
        );
        assert!(machines.commit(&CancelToken::new(), &zfs, &clock).unwrap());
        assert_eq!(
            zfs.dataset("rpool/ROOT/ubuntu_1234").unwrap().last_booted_kernel,
            "vmlinuz-5.4.0-42-generic"
        );
        // last-used alone does not signal a change.
        let later = FakeClock::at(Utc.timestamp(3000, 0));
        assert!(!machines.commit(&CancelToken::new(), &zfs, &later).unwrap());
        assert_eq!(zfs.dataset("rpool/ROOT/ubuntu_1234").unwrap().last_used, 3000);
    }

    #[test]
    fn independent_roots_drop_descendants() {
        let roots = independent_roots(vec![
            "rpool/ROOT/ubuntu_1234@snap1".to_string(),
            "rpool/ROOT/ubuntu_1234/var@snap1".to_string(),
            "bpool/BOOT/ubuntu_1234@snap1".to_string(),
        ]);
        assert_eq!(
            roots,
            vec!["rpool/ROOT/ubuntu_1234@snap1", "bpool/BOOT/ubuntu_1234@snap1"]
        );
    }
}
