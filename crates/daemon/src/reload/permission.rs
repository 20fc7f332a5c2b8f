//! Signal permission diagnosis.

use tracing::trace;

use crate::collaborators::PermissionProbe;

/// Bit of CAP_KILL in a capability mask
pub const CAP_KILL_BIT: u32 = 5;

/// Why (or whether) this process may signal the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPermission {
    Root,
    SameUser,
    Capability,
    Denied,
}

impl SignalPermission {
    pub fn is_allowed(self) -> bool {
        !matches!(self, SignalPermission::Denied)
    }
}

/// Decide whether a signal to a process owned by `owner_uid` can succeed.
///
/// Root may always signal; otherwise the effective user must own the
/// process, or CAP_KILL must be in the effective set.
pub fn diagnose(probe: &dyn PermissionProbe, owner_uid: u32) -> SignalPermission {
    let euid = probe.effective_uid();
    let permission = if euid == 0 {
        SignalPermission::Root
    } else if euid == owner_uid {
        SignalPermission::SameUser
    } else if probe.has_kill_capability() {
        SignalPermission::Capability
    } else {
        SignalPermission::Denied
    };

    trace!(euid, owner_uid, ?permission, "Diagnosed signal permission");
    permission
}

/// Parse the `CapEff:` mask out of `/proc/<pid>/status` text
pub fn parse_cap_eff(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|mask| u64::from_str_radix(mask.trim(), 16).ok())
}

/// Probe backed by the real process credentials
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessPermissionProbe;

impl PermissionProbe for ProcessPermissionProbe {
    fn effective_uid(&self) -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    fn has_kill_capability(&self) -> bool {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .as_deref()
            .and_then(parse_cap_eff)
            .is_some_and(|mask| mask & (1 << CAP_KILL_BIT) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        euid: u32,
        cap_kill: bool,
    }

    impl PermissionProbe for Fixed {
        fn effective_uid(&self) -> u32 {
            self.euid
        }
        fn has_kill_capability(&self) -> bool {
            self.cap_kill
        }
    }

    #[test]
    fn test_diagnose_order() {
        let root = Fixed { euid: 0, cap_kill: false };
        assert_eq!(diagnose(&root, 1000), SignalPermission::Root);

        let owner = Fixed { euid: 1000, cap_kill: false };
        assert_eq!(diagnose(&owner, 1000), SignalPermission::SameUser);

        let capable = Fixed { euid: 1001, cap_kill: true };
        assert_eq!(diagnose(&capable, 1000), SignalPermission::Capability);

        let nobody = Fixed { euid: 1001, cap_kill: false };
        assert_eq!(diagnose(&nobody, 1000), SignalPermission::Denied);
        assert!(!SignalPermission::Denied.is_allowed());
    }

    #[test]
    fn test_parse_cap_eff() {
        let status = "Name:\tcertkeeper\nCapInh:\t0000000000000000\n\
                      CapPrm:\t0000000000000020\nCapEff:\t0000000000000020\n";
        let mask = parse_cap_eff(status).unwrap();
        assert_eq!(mask, 0x20);
        assert_ne!(mask & (1 << CAP_KILL_BIT), 0);

        assert_eq!(parse_cap_eff("Name:\tx\n"), None);
        assert_eq!(parse_cap_eff("CapEff:\tzz\n"), None);
    }
}
