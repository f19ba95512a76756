//! Kernel command line surface: the booted root identifier, the user-data
//! revert flag and the kernel image basename are the only tokens the engine
//! reads. Token order is irrelevant.

macro_rules! once_regex {
    ($re:literal $(,)?) => {{
        static RE: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
        RE.get_or_init(|| regex::Regex::new($re).unwrap())
    }};
}

/// Dataset or snapshot the session booted from (`root=ZFS=<id>`).
pub fn root_from_cmdline(cmdline: &str) -> Option<String> {
    once_regex!(r"(?:^|\s)root=ZFS=(\S+)")
        .captures(cmdline)
        .map(|c| c[1].to_string())
}

/// True when the boot requested a user-data revert.
pub fn revert_user_data(cmdline: &str) -> bool {
    once_regex!(r"(?:^|\s)zsys-revert=userdata(?:\s|$)").is_match(cmdline)
}

/// Basename of the booted kernel image (`BOOT_IMAGE=<path>`).
pub fn kernel_from_cmdline(cmdline: &str) -> Option<String> {
    once_regex!(r"(?:^|\s)BOOT_IMAGE=(\S+)")
        .captures(cmdline)
        .map(|c| c[1].rsplitn(2, '/').next().unwrap_or(&c[1]).to_string())
}

/// True when the root identifier names a snapshot.
pub fn booted_on_snapshot(cmdline: &str) -> bool {
    root_from_cmdline(cmdline).map(|r| r.contains('@')).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CMDLINE: &str =
        "BOOT_IMAGE=/boot/vmlinuz-5.4.0-42-generic root=ZFS=rpool/ROOT/ubuntu_1234 ro quiet splash";

    #[test]
    fn extracts_root_identifier() {
        assert_eq!(root_from_cmdline(CMDLINE).unwrap(), "rpool/ROOT/ubuntu_1234");
        assert_eq!(root_from_cmdline("ro quiet"), None);
    }

    #[test]
    fn extracts_kernel_basename() {
        assert_eq!(kernel_from_cmdline(CMDLINE).unwrap(), "vmlinuz-5.4.0-42-generic");
        assert_eq!(
            kernel_from_cmdline("BOOT_IMAGE=vmlinuz-5.4.0-42-generic").unwrap(),
            "vmlinuz-5.4.0-42-generic"
        );
    }

    #[test]
    fn detects_revert_flag_and_snapshot_boot() {
        assert!(!revert_user_data(CMDLINE));
        assert!(revert_user_data(
            "root=ZFS=rpool/ROOT/ubuntu_1234@snap1 zsys-revert=userdata"
        ));
        assert!(booted_on_snapshot("root=ZFS=rpool/ROOT/ubuntu_1234@snap1"));
        assert!(!booted_on_snapshot(CMDLINE));
    }
}
