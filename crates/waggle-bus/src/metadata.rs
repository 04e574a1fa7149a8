// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Process context snapshots and metadata attachment for deliveries.
// Author: Lukas Bower

use std::ops::BitOr;
use std::sync::Arc;

use waggle_wire::Record;

use crate::Clock;

/// Selection of metadata records a connection wants stamped on its inbound
/// messages, chosen at HELLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttachMask(u64);

impl AttachMask {
    /// Attach nothing.
    pub const NONE: Self = Self(0);
    /// Attach send timestamps.
    pub const TIMESTAMP: Self = Self(1 << 0);
    /// Attach sender credentials.
    pub const CREDS: Self = Self(1 << 1);
    /// Attach the sender's executable path.
    pub const EXE: Self = Self(1 << 2);
    /// Attach the sender's command line.
    pub const CMDLINE: Self = Self(1 << 3);
    /// Attach the sender's control-group path.
    pub const CGROUP: Self = Self(1 << 4);
    /// Attach the sender's capability bits.
    pub const CAPS: Self = Self(1 << 5);
    /// Attach the sender's security label.
    pub const SECLABEL: Self = Self(1 << 6);
    /// Attach the sender's audit ids.
    pub const AUDIT: Self = Self(1 << 7);
    /// Attach the sender's owned well-known names.
    pub const NAMES: Self = Self(1 << 8);
    /// Attach everything available.
    pub const ALL: Self = Self((1 << 9) - 1);

    /// Return whether every bit of `other` is selected.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Return the raw bit value.
    #[must_use]
    pub fn bits(self) -> u64 {
        self.0
    }
}

impl BitOr for AttachMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Credential and provenance snapshot of the process behind a connection,
/// captured when the endpoint is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessContext {
    uid: u32,
    gid: u32,
    pid: u64,
    exe: Option<String>,
    cmdline: Option<String>,
    cgroup: Option<String>,
    caps: Option<u64>,
    seclabel: Option<String>,
    audit: Option<(u64, u64)>,
}

impl ProcessContext {
    /// Construct a context from the credential triple.
    #[must_use]
    pub fn new(uid: u32, gid: u32, pid: u64) -> Self {
        Self {
            uid,
            gid,
            pid,
            exe: None,
            cmdline: None,
            cgroup: None,
            caps: None,
            seclabel: None,
            audit: None,
        }
    }

    /// A root context, convenient for owners and tests.
    #[must_use]
    pub fn root() -> Self {
        Self::new(0, 0, 1)
    }

    /// Attach an executable path to the snapshot.
    #[must_use]
    pub fn with_exe(mut self, exe: impl Into<String>) -> Self {
        self.exe = Some(exe.into());
        self
    }

    /// Attach a command line to the snapshot.
    #[must_use]
    pub fn with_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = Some(cmdline.into());
        self
    }

    /// Attach a control-group path to the snapshot.
    #[must_use]
    pub fn with_cgroup(mut self, cgroup: impl Into<String>) -> Self {
        self.cgroup = Some(cgroup.into());
        self
    }

    /// Attach capability bits to the snapshot.
    #[must_use]
    pub fn with_caps(mut self, caps: u64) -> Self {
        self.caps = Some(caps);
        self
    }

    /// Attach a security label to the snapshot.
    #[must_use]
    pub fn with_seclabel(mut self, seclabel: impl Into<String>) -> Self {
        self.seclabel = Some(seclabel.into());
        self
    }

    /// Attach audit ids to the snapshot.
    #[must_use]
    pub fn with_audit(mut self, loginuid: u64, sessionid: u64) -> Self {
        self.audit = Some((loginuid, sessionid));
        self
    }

    /// Return the uid.
    #[must_use]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Return the gid.
    #[must_use]
    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Return the pid.
    #[must_use]
    pub fn pid(&self) -> u64 {
        self.pid
    }
}

/// Build the metadata records a receiver asked for, from a sender context.
pub(crate) fn sender_metadata(
    ctx: &ProcessContext,
    owned_names: &[String],
    mask: AttachMask,
    clock: &Arc<dyn Clock>,
) -> Vec<Record> {
    let mut records = Vec::new();
    if mask.contains(AttachMask::TIMESTAMP) {
        records.push(timestamp_record(clock));
    }
    if mask.contains(AttachMask::CREDS) {
        records.push(Record::Creds {
            uid: u64::from(ctx.uid),
            gid: u64::from(ctx.gid),
            pid: ctx.pid,
        });
    }
    if mask.contains(AttachMask::EXE) {
        if let Some(exe) = &ctx.exe {
            records.push(Record::Exe(exe.clone()));
        }
    }
    if mask.contains(AttachMask::CMDLINE) {
        if let Some(cmdline) = &ctx.cmdline {
            records.push(Record::Cmdline(cmdline.clone()));
        }
    }
    if mask.contains(AttachMask::CGROUP) {
        if let Some(cgroup) = &ctx.cgroup {
            records.push(Record::Cgroup(cgroup.clone()));
        }
    }
    if mask.contains(AttachMask::CAPS) {
        if let Some(caps) = ctx.caps {
            records.push(Record::Caps(caps));
        }
    }
    if mask.contains(AttachMask::SECLABEL) {
        if let Some(seclabel) = &ctx.seclabel {
            records.push(Record::Seclabel(seclabel.clone()));
        }
    }
    if mask.contains(AttachMask::AUDIT) {
        if let Some((loginuid, sessionid)) = ctx.audit {
            records.push(Record::Audit {
                loginuid,
                sessionid,
            });
        }
    }
    if mask.contains(AttachMask::NAMES) && !owned_names.is_empty() {
        records.push(Record::OwnedNames(owned_names.to_vec()));
    }
    records
}

/// Build metadata for a core-synthesized message. The kernel context has no
/// owning process, so only a timestamp can ever be attached.
pub(crate) fn kernel_metadata(mask: AttachMask, clock: &Arc<dyn Clock>) -> Vec<Record> {
    if mask.contains(AttachMask::TIMESTAMP) {
        vec![timestamp_record(clock)]
    } else {
        Vec::new()
    }
}

fn timestamp_record(clock: &Arc<dyn Clock>) -> Record {
    Record::Timestamp {
        monotonic_ns: clock.monotonic_ns(),
        realtime_ns: clock.realtime_ns(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemClock;

    #[test]
    fn mask_selects_records() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
        let ctx = ProcessContext::new(1000, 100, 77)
            .with_exe("/usr/bin/svc")
            .with_caps(0b1010);
        let names = vec!["org.example.svc".to_owned()];
        let records = sender_metadata(
            &ctx,
            &names,
            AttachMask::CREDS | AttachMask::NAMES,
            &clock,
        );
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], Record::Creds { uid: 1000, .. }));
        assert!(matches!(&records[1], Record::OwnedNames(list) if list == &names));
    }

    #[test]
    fn kernel_metadata_is_timestamp_only() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
        let records = kernel_metadata(AttachMask::ALL, &clock);
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], Record::Timestamp { .. }));
        assert!(kernel_metadata(AttachMask::CREDS, &clock).is_empty());
    }
}
