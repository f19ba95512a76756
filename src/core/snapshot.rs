//! Snapshot engine: system and per-user snapshots of the current state,
//! with name validation and a free-space gate per touched pool.

use super::Machines;
use crate::parsing::pool_name;
use crate::sys::zfs::{Transaction, Zfs};
use crate::sys::CancelToken;
use anyhow::{anyhow, bail, Result};
use std::collections::BTreeSet;

const AUTO_SNAPSHOT_PREFIX: &str = "autozsys_";

macro_rules! once_regex {
    ($re:literal $(,)?) => {{
        static RE: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
        RE.get_or_init(|| regex::Regex::new($re).unwrap())
    }};
}

impl Machines {
    /// Snapshots every dataset of the current state, user data included.
    /// An empty name autogenerates one. Returns the snapshot name.
    pub fn create_system_snapshot(&mut self, ctx: &CancelToken, zfs: &dyn Zfs, name: &str) -> Result<String> {
        self.create_snapshot(ctx, zfs, name, None)
    }

    /// Snapshots one user's datasets on the current state.
    pub fn create_user_snapshot(&mut self, ctx: &CancelToken, zfs: &dyn Zfs, user: &str, name: &str) -> Result<String> {
        if user.is_empty() {
            bail!("user name is mandatory");
        }
        self.create_snapshot(ctx, zfs, name, Some(user))
    }

    fn create_snapshot(&mut self, ctx: &CancelToken, zfs: &dyn Zfs, name: &str, user: Option<&str>) -> Result<String> {
        let machine = self
            .current()
            .ok_or_else(|| anyhow!("no current machine, cannot snapshot"))?;
        if !machine.is_zsys {
            bail!("machine {} is not managed, cannot snapshot", machine.id);
        }

        let snap_name = if name.is_empty() {
            format!("{}{}", AUTO_SNAPSHOT_PREFIX, zfs.generate_id(6))
        } else {
            validate_snapshot_name(name)?;
            name.to_string()
        };
        let tag_suffix = format!("@{}", snap_name);
        if machine.all_states().any(|s| s.id.ends_with(&tag_suffix)) {
            bail!("a state of machine {} already uses the name {}", machine.id, snap_name);
        }

        let targets: Vec<String> = match user {
            None => machine
                .state
                .system_datasets()
                .chain(machine.state.user_datasets())
                .filter(|d| !d.is_snapshot)
                .map(|d| d.name.clone())
                .collect(),
            Some(user) => machine
                .state
                .users
                .get(user)
                .ok_or_else(|| anyhow!("user {} is unknown on machine {}", user, machine.id))?
                .all_datasets()
                .filter(|d| !d.is_snapshot)
                .map(|d| d.name.clone())
                .collect(),
        };
        if targets.is_empty() {
            bail!("no dataset to snapshot");
        }

        let minimum = self.config.general.min_free_pool_space;
        let pools: BTreeSet<&str> = targets.iter().map(|t| pool_name(t)).collect();
        for pool in pools {
            ctx.ensure()?;
            let free = zfs.pool_free_space(pool)?;
            if free <= minimum {
                bail!(
                    "pool {} has only {}% free space, {}% minimum required for snapshots",
                    pool,
                    free,
                    minimum
                );
            }
        }

        let mut txn = Transaction::new(zfs, ctx);
        for target in &targets {
            txn.snapshot(&snap_name, target, false)?;
        }
        txn.done();
        self.rescan(ctx, zfs)?;
        Ok(snap_name)
    }
}

fn validate_snapshot_name(name: &str) -> Result<()> {
    if name.starts_with('-') {
        bail!("snapshot name {} cannot start with a dash", name);
    }
    if !once_regex!(r"^[A-Za-z0-9_.:-]+$").is_match(name) {
        bail!("snapshot name {} contains invalid characters", name);
    }
    Ok(())
}
