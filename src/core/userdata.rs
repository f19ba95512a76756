//! User-data management: creating or retargeting per-user datasets, moving
//! homes, and dissociating a user from the current state.

use super::Machines;
use crate::parsing::{pool_name, remove_tag};
use crate::sys::clock::Clock;
use crate::sys::zfs::{
    CanMount, Transaction, Zfs, PROP_BOOTFS_DATASETS, PROP_CANMOUNT, PROP_LAST_USED, PROP_MOUNTPOINT,
};
use crate::sys::CancelToken;
use anyhow::{anyhow, bail, Result};

const USERDATA_CONTAINER: &str = "userdata";

impl Machines {
    /// Creates (or retargets) the dataset backing a user's home.
    pub fn create_user_data(
        &mut self,
        ctx: &CancelToken,
        zfs: &dyn Zfs,
        clock: &dyn Clock,
        user: &str,
        homepath: &str,
    ) -> Result<()> {
        let machine = self
            .current()
            .ok_or_else(|| anyhow!("no current machine, cannot create user data"))?;
        if !machine.is_zsys {
            bail!("machine {} is not managed, cannot create user data", machine.id);
        }
        if user.is_empty() {
            bail!("user name is mandatory");
        }
        if homepath.is_empty() {
            bail!("home path is mandatory");
        }

        // An existing user or home only moves its mountpoint.
        let retarget = machine
            .state
            .users
            .get(user)
            .and_then(|us| us.route_roots().next())
            .map(|d| d.name.clone())
            .or_else(|| {
                machine
                    .state
                    .users
                    .values()
                    .flat_map(|us| us.all_datasets())
                    .find(|d| d.mountpoint == homepath)
                    .map(|d| d.name.clone())
            });
        if let Some(name) = retarget {
            let mut txn = Transaction::new(zfs, ctx);
            txn.set_property(PROP_MOUNTPOINT, homepath, &name, false)?;
            txn.done();
            return self.rescan(ctx, zfs);
        }

        let state_id = machine.state.id.clone();
        let container = match self.pick_userdata_container(user) {
            Some(container) => container,
            None => {
                let container = format!("{}/USERDATA", pool_name(&state_id));
                ctx.ensure()?;
                zfs.create(&container, "/", CanMount::Off)?;
                container
            }
        };

        let path = format!("{}/{}_{}", container, user, zfs.generate_id(6));
        ctx.ensure()?;
        zfs.create(&path, homepath, CanMount::On)?;
        let mut txn = Transaction::new(zfs, ctx);
        txn.set_property(PROP_BOOTFS_DATASETS, &state_id, &path, false)?;
        txn.set_property(PROP_LAST_USED, &clock.now().timestamp().to_string(), &path, false)?;
        txn.done();
        self.rescan(ctx, zfs)
    }

    /// Moves the dataset mounted at `old` to `new`.
    pub fn change_home_on_user_data(&mut self, ctx: &CancelToken, zfs: &dyn Zfs, old: &str, new: &str) -> Result<()> {
        let machine = self
            .current()
            .ok_or_else(|| anyhow!("no current machine, cannot change home"))?;
        if !machine.is_zsys {
            bail!("machine {} is not managed, cannot change home", machine.id);
        }
        if old.is_empty() || new.is_empty() {
            bail!("both the old and new home paths are mandatory");
        }
        let target = machine
            .state
            .users
            .values()
            .flat_map(|us| us.all_datasets())
            .find(|d| d.mountpoint == old)
            .map(|d| d.name.clone())
            .ok_or_else(|| anyhow!("no user dataset with mountpoint {}", old))?;
        let mut txn = Transaction::new(zfs, ctx);
        txn.set_property(PROP_MOUNTPOINT, new, &target, false)?;
        txn.done();
        self.rescan(ctx, zfs)
    }

    /// Detaches a user from the current state: the state id is stripped from
    /// every dataset of the user's state, and untagged datasets stop
    /// automounting.
    pub fn dissociate_user(&mut self, ctx: &CancelToken, zfs: &dyn Zfs, user: &str) -> Result<()> {
        let machine = self
            .current()
            .ok_or_else(|| anyhow!("no current machine, cannot dissociate user"))?;
        if !machine.is_zsys {
            bail!("machine {} is not managed, cannot dissociate user", machine.id);
        }
        let state_id = machine.state.id.clone();
        let user_state = machine
            .state
            .users
            .get(user)
            .ok_or_else(|| anyhow!("user {} is unknown on machine {}", user, machine.id))?;

        let updates: Vec<(String, String)> = user_state
            .all_datasets()
            .filter(|d| !d.is_snapshot)
            .filter_map(|d| remove_tag(&d.bootfs_datasets, &state_id).map(|tags| (d.name.clone(), tags)))
            .collect();

        let mut txn = Transaction::new(zfs, ctx);
        for (name, tags) in &updates {
            txn.set_property(PROP_BOOTFS_DATASETS, tags, name, false)?;
            txn.set_property(PROP_CANMOUNT, "noauto", name, false)?;
        }
        txn.done();
        self.rescan(ctx, zfs)
    }

    /// Container the new user dataset goes into: the pool already holding
    /// this user's data, else any known user data, else a dataset named like
    /// a user-data container.
    fn pick_userdata_container(&self, user: &str) -> Option<String> {
        let machine = self.current()?;
        if let Some(root) = machine
            .all_users_states
            .get(user)
            .and_then(|routes| routes.values().next())
            .and_then(|us| us.route_roots().next())
        {
            if let Some(container) = containing_userdata(&root.name) {
                return Some(container);
            }
        }
        if let Some(d) = self.all_user_datasets.first() {
            if let Some(container) = containing_userdata(&d.name) {
                return Some(container);
            }
        }
        self.unmanaged_datasets
            .iter()
            .chain(self.all_persistent_datasets.iter())
            .find(|d| !d.is_snapshot && crate::parsing::base_name(&d.name).eq_ignore_ascii_case(USERDATA_CONTAINER))
            .map(|d| d.name.clone())
    }
}

fn parent_name(name: &str) -> Option<String> {
    name.rsplitn(2, '/').nth(1).map(|p| p.to_string())
}

/// Walks up to the component whose basename is the user-data container.
fn containing_userdata(name: &str) -> Option<String> {
    let mut cur = name.to_string();
    while let Some(parent) = parent_name(&cur) {
        if crate::parsing::base_name(&parent).eq_ignore_ascii_case(USERDATA_CONTAINER) {
            return Some(parent);
        }
        cur = parent;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Config;
    use crate::sys::clock::FakeClock;
    use crate::sys::mock::{dataset, MemoryZfs};
    use chrono::{TimeZone, Utc};

    const CMDLINE: &str = "root=ZFS=rpool/ROOT/ubuntu_1234";

    fn fixture() -> MemoryZfs {
        MemoryZfs::new(vec![
            dataset("rpool").mountpoint("/").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT").mountpoint("none").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT/ubuntu_1234").mountpoint("/").mounted().bootfs().build(),
            dataset("rpool/USERDATA").mountpoint("/").canmount(CanMount::Off).build(),
            dataset("rpool/USERDATA/user1_abcdef")
                .mountpoint("/home/user1")
                .bootfs_datasets("rpool/ROOT/ubuntu_1234")
                .build(),
        ])
    }

    fn machines_on(zfs: &MemoryZfs) -> Machines {
        Machines::new(&CancelToken::new(), zfs, CMDLINE, Config::default()).unwrap()
    }

    #[test]
    fn creates_a_tagged_dataset_in_the_existing_container() {
        let zfs = fixture();
        let clock = FakeClock::at(Utc.timestamp(5000, 0));
        let mut machines = machines_on(&zfs);
        machines
            .create_user_data(&CancelToken::new(), &zfs, &clock, "user2", "/home/user2")
            .unwrap();

        let created = zfs.dataset("rpool/USERDATA/user2_aaaaab").unwrap();
        assert_eq!(created.mountpoint, "/home/user2");
        assert_eq!(created.canmount, CanMount::On);
        assert_eq!(created.bootfs_datasets, "rpool/ROOT/ubuntu_1234");
        assert_eq!(created.last_used, 5000);
        let machine = machines.current().unwrap();
        assert!(machine.state.users.contains_key("user2"));
    }

    #[test]
    fn creates_the_container_when_none_exists() {
        let zfs = MemoryZfs::new(vec![
            dataset("rpool").mountpoint("/").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT").mountpoint("none").canmount(CanMount::Off).build(),
            dataset("rpool/ROOT/ubuntu_1234").mountpoint("/").mounted().bootfs().build(),
        ]);
        let clock = FakeClock::at(Utc.timestamp(5000, 0));
        let mut machines = machines_on(&zfs);
        machines
            .create_user_data(&CancelToken::new(), &zfs, &clock, "user1", "/home/user1")
            .unwrap();

        let container = zfs.dataset("rpool/USERDATA").unwrap();
        assert_eq!(container.canmount, CanMount::Off);
        assert_eq!(container.mountpoint, "/");
        assert!(zfs.dataset("rpool/USERDATA/user1_aaaaab").is_some());
    }

    #[test]
    fn existing_user_is_retargeted_not_duplicated() {
        let zfs = fixture();
        let clock = FakeClock::at(Utc.timestamp(5000, 0));
        let mut machines = machines_on(&zfs);
        machines
            .create_user_data(&CancelToken::new(), &zfs, &clock, "user1", "/var/home/user1")
            .unwrap();

        assert_eq!(
            zfs.dataset("rpool/USERDATA/user1_abcdef").unwrap().mountpoint,
            "/var/home/user1"
        );
        // No second dataset for the user appeared.
        assert_eq!(
            zfs.dataset_names()
                .iter()
                .filter(|n| n.contains("user1"))
                .count(),
            1
        );
    }

    #[test]
    fn refuses_empty_arguments() {
        let zfs = fixture();
        let clock = FakeClock::at(Utc.timestamp(5000, 0));
        let mut machines = machines_on(&zfs);
        assert!(machines
            .create_user_data(&CancelToken::new(), &zfs, &clock, "", "/home/x")
            .is_err());
        assert!(machines
            .create_user_data(&CancelToken::new(), &zfs, &clock, "x", "")
            .is_err());
    }

    #[test]
    fn change_home_matches_by_mountpoint() {
        let zfs = fixture();
        let mut machines = machines_on(&zfs);
        machines
            .change_home_on_user_data(&CancelToken::new(), &zfs, "/home/user1", "/srv/user1")
            .unwrap();
        assert_eq!(
            zfs.dataset("rpool/USERDATA/user1_abcdef").unwrap().mountpoint,
            "/srv/user1"
        );
        assert!(machines
            .change_home_on_user_data(&CancelToken::new(), &zfs, "/home/nobody", "/srv/nobody")
            .is_err());
    }

    #[test]
    fn dissociate_strips_the_tag_and_automount() {
        let zfs = fixture();
        let mut machines = machines_on(&zfs);
        machines.dissociate_user(&CancelToken::new(), &zfs, "user1").unwrap();

        let d = zfs.dataset("rpool/USERDATA/user1_abcdef").unwrap();
        assert_eq!(d.bootfs_datasets, "");
        assert_eq!(d.canmount, CanMount::NoAuto);
        assert!(machines.current().unwrap().state.users.is_empty());

        assert!(machines
            .dissociate_user(&CancelToken::new(), &zfs, "user1")
            .is_err());
    }
}
