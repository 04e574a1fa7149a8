// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Ordered allow/deny policy rules gating name ownership and traffic.
// Author: Lukas Bower

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::names::wildcard_matches;
use crate::ProcessContext;

/// Who a policy rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicySubject {
    /// A specific uid.
    Uid(u32),
    /// A specific gid.
    Gid(u32),
    /// Every caller.
    World,
}

/// What a policy rule permits or forbids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyVerb {
    /// Acquire ownership of a well-known name.
    Own,
    /// Send to a connection owning the name.
    TalkTo,
    /// Observe the name in listings and broadcasts.
    See,
}

impl fmt::Display for PolicyVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PolicyVerb::Own => "OWN",
            PolicyVerb::TalkTo => "TALK_TO",
            PolicyVerb::See => "SEE",
        })
    }
}

/// Rule outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    /// Permit the operation.
    Allow,
    /// Forbid the operation.
    Deny,
}

/// One ordered policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Who the rule applies to.
    pub subject: PolicySubject,
    /// The gated verb.
    pub verb: PolicyVerb,
    /// Object name; `a.b.*` gates one level below the prefix, `*` gates
    /// everything.
    pub object: String,
    /// Allow or deny.
    pub decision: PolicyDecision,
}

impl PolicyRule {
    /// Shorthand for an allow rule.
    #[must_use]
    pub fn allow(subject: PolicySubject, verb: PolicyVerb, object: impl Into<String>) -> Self {
        Self {
            subject,
            verb,
            object: object.into(),
            decision: PolicyDecision::Allow,
        }
    }

    /// Shorthand for a deny rule.
    #[must_use]
    pub fn deny(subject: PolicySubject, verb: PolicyVerb, object: impl Into<String>) -> Self {
        Self {
            subject,
            verb,
            object: object.into(),
            decision: PolicyDecision::Deny,
        }
    }

    fn applies(&self, creds: &ProcessContext, verb: PolicyVerb, name: &str) -> bool {
        if self.verb != verb {
            return false;
        }
        let subject_ok = match self.subject {
            PolicySubject::Uid(uid) => creds.uid() == uid,
            PolicySubject::Gid(gid) => creds.gid() == gid,
            PolicySubject::World => true,
        };
        subject_ok && object_matches(&self.object, name)
    }
}

/// An ordered list of rules; the first applicable rule wins and the default
/// within an installed set is deny.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    rules: Vec<PolicyRule>,
}

impl PolicySet {
    /// Construct a policy set from ordered rules.
    #[must_use]
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// Borrow the ordered rules.
    #[must_use]
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// First-match evaluation. Returns the winning decision, or deny when no
    /// rule applies: an installed set gates everything it is asked about.
    #[must_use]
    pub fn check(&self, creds: &ProcessContext, verb: PolicyVerb, name: &str) -> PolicyDecision {
        self.rules
            .iter()
            .find(|rule| rule.applies(creds, verb, name))
            .map_or(PolicyDecision::Deny, |rule| rule.decision)
    }
}

fn object_matches(pattern: &str, name: &str) -> bool {
    pattern == "*" || pattern == name || wildcard_matches(pattern, name)
}

/// Evaluate the effective policy: the bus layer overlaid with the endpoint
/// layer. Absent layers impose nothing; an endpoint overlay can only narrow
/// because every installed layer must allow.
pub(crate) fn effective_allows(
    bus: Option<&PolicySet>,
    endpoint: Option<&PolicySet>,
    creds: &ProcessContext,
    verb: PolicyVerb,
    name: &str,
) -> bool {
    for layer in [bus, endpoint].into_iter().flatten() {
        if layer.check(creds, verb, name) == PolicyDecision::Deny {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(uid: u32, gid: u32) -> ProcessContext {
        ProcessContext::new(uid, gid, 99)
    }

    #[test]
    fn first_match_wins() {
        let set = PolicySet::new(vec![
            PolicyRule::deny(PolicySubject::Uid(7), PolicyVerb::Own, "com.acme.svc"),
            PolicyRule::allow(PolicySubject::World, PolicyVerb::Own, "com.acme.svc"),
        ]);
        assert_eq!(
            set.check(&creds(7, 7), PolicyVerb::Own, "com.acme.svc"),
            PolicyDecision::Deny
        );
        assert_eq!(
            set.check(&creds(8, 8), PolicyVerb::Own, "com.acme.svc"),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn unmatched_defaults_to_deny() {
        let set = PolicySet::new(vec![PolicyRule::allow(
            PolicySubject::World,
            PolicyVerb::TalkTo,
            "com.acme.svc",
        )]);
        assert_eq!(
            set.check(&creds(1, 1), PolicyVerb::TalkTo, "com.other.svc"),
            PolicyDecision::Deny
        );
        assert_eq!(
            set.check(&creds(1, 1), PolicyVerb::Own, "com.acme.svc"),
            PolicyDecision::Deny
        );
    }

    #[test]
    fn wildcard_objects_gate_one_level() {
        let set = PolicySet::new(vec![PolicyRule::allow(
            PolicySubject::World,
            PolicyVerb::Own,
            "com.acme.*",
        )]);
        assert_eq!(
            set.check(&creds(1, 1), PolicyVerb::Own, "com.acme.svc"),
            PolicyDecision::Allow
        );
        assert_eq!(
            set.check(&creds(1, 1), PolicyVerb::Own, "com.acme.deep.svc"),
            PolicyDecision::Deny
        );
    }

    #[test]
    fn endpoint_overlay_only_narrows() {
        let bus = PolicySet::new(vec![PolicyRule::allow(
            PolicySubject::World,
            PolicyVerb::TalkTo,
            "*",
        )]);
        let endpoint = PolicySet::new(vec![PolicyRule::allow(
            PolicySubject::Uid(5),
            PolicyVerb::TalkTo,
            "*",
        )]);
        assert!(effective_allows(
            Some(&bus),
            None,
            &creds(9, 9),
            PolicyVerb::TalkTo,
            "com.acme.svc"
        ));
        assert!(!effective_allows(
            Some(&bus),
            Some(&endpoint),
            &creds(9, 9),
            PolicyVerb::TalkTo,
            "com.acme.svc"
        ));
        assert!(effective_allows(
            Some(&bus),
            Some(&endpoint),
            &creds(5, 5),
            PolicyVerb::TalkTo,
            "com.acme.svc"
        ));
        assert!(effective_allows(
            None,
            None,
            &creds(9, 9),
            PolicyVerb::TalkTo,
            "com.acme.svc"
        ));
    }

    #[test]
    fn gid_subjects_match_group() {
        let set = PolicySet::new(vec![PolicyRule::allow(
            PolicySubject::Gid(42),
            PolicyVerb::See,
            "*",
        )]);
        assert_eq!(
            set.check(&creds(1, 42), PolicyVerb::See, "com.acme.svc"),
            PolicyDecision::Allow
        );
        assert_eq!(
            set.check(&creds(1, 41), PolicyVerb::See, "com.acme.svc"),
            PolicyDecision::Deny
        );
    }
}
