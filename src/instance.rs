//! Instance data model: one provisioned container backing one challenge
//! attempt, plus the routable projection of a running instance.

use crate::error::{InstancerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle state of a challenge instance.
///
/// Allowed edges: `pending -> running -> stopping -> stopped`, plus
/// `pending -> stopping` (TTL hit before start), `running -> stopped` and
/// `pending -> stopped` (die observed without a preceding stop), and any
/// state `-> error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            "error" => Some(InstanceState::Error),
            _ => None,
        }
    }

    /// Whether `self -> to` is an allowed edge in the state graph.
    pub fn can_transition(&self, to: InstanceState) -> bool {
        use InstanceState::*;
        // Every state may fall into Error, Error included: repeated
        // failures on an already-errored instance are not a new violation.
        if to == Error {
            return true;
        }
        matches!(
            (*self, to),
            (Pending, Running)
                | (Pending, Stopping)
                | (Pending, Stopped)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }

    /// States that hold the one-active-instance-per-owner slot and reserve
    /// the hostname.
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceState::Pending | InstanceState::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provisioned container backing one challenge attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub challenge_id: String,
    pub owner_id: String,
    /// Runtime-assigned container id.
    pub container_id: String,
    /// Slug used in the hostname and proxy config.
    pub challenge_slug: String,
    /// Globally unique while the instance is active.
    pub hostname: String,
    /// `ip:port` inside the runtime's network; set once resolved.
    pub internal_address: Option<String>,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen_event_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Validated transition, returning the typed error on a bad edge.
    pub fn transition_to(&mut self, to: InstanceState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(InstancerError::InvalidTransition {
                instance_id: self.instance_id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// The routable projection of a `running` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub hostname: String,
    pub instance_id: String,
    /// `ip:port` the proxy forwards to.
    pub target_address: String,
    pub config_path: PathBuf,
    /// Whether the enabling symlink exists.
    pub enabled: bool,
}

/// Lowercase a name into a DNS-safe slug: `[a-z0-9]` kept, every other run
/// of characters collapsed to a single `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// `<challenge-slug>-<owner-slug>.<wildcard domain>`; owner part omitted for
/// manually published routes with no owner.
pub fn derive_hostname(challenge_slug: &str, owner_slug: Option<&str>, domain: &str) -> String {
    match owner_slug {
        Some(owner) if !owner.is_empty() => format!("{}-{}.{}", challenge_slug, owner, domain),
        _ => format!("{}.{}", challenge_slug, domain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use InstanceState::*;
        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Stopping));
        assert!(Stopping.can_transition(Stopped));
        assert!(Running.can_transition(Stopped));
        assert!(Pending.can_transition(Error));
        assert!(Stopped.can_transition(Error));
        // Error is absorbing: re-entering it is fine.
        assert!(Error.can_transition(Error));
    }

    #[test]
    fn test_rejected_transitions() {
        use InstanceState::*;
        assert!(!Stopped.can_transition(Running));
        assert!(!Stopped.can_transition(Pending));
        assert!(!Running.can_transition(Pending));
        assert!(!Stopping.can_transition(Running));
        assert!(!Error.can_transition(Running));
    }

    #[test]
    fn test_transition_to_rejects_bad_edge() {
        let mut inst = Instance {
            instance_id: "i-1".to_string(),
            challenge_id: "42".to_string(),
            owner_id: "team-7".to_string(),
            container_id: "abc".to_string(),
            challenge_slug: "pwn-101".to_string(),
            hostname: "pwn-101-team-7.challenges.local".to_string(),
            internal_address: None,
            state: InstanceState::Stopped,
            created_at: Utc::now(),
            expires_at: Utc::now(),
            last_seen_event_at: None,
        };
        let err = inst.transition_to(InstanceState::Running).unwrap_err();
        assert!(matches!(
            err,
            crate::error::InstancerError::InvalidTransition { .. }
        ));
        assert_eq!(inst.state, InstanceState::Stopped);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Pwn 101"), "pwn-101");
        assert_eq!(slugify("pwn-101"), "pwn-101");
        assert_eq!(slugify("  Web // Baby's First SQLi  "), "web-baby-s-first-sqli");
        assert_eq!(slugify("___"), "");
    }

    #[test]
    fn test_derive_hostname() {
        assert_eq!(
            derive_hostname("pwn-101", Some("team-7"), "challenges.ctf.example"),
            "pwn-101-team-7.challenges.ctf.example"
        );
        assert_eq!(
            derive_hostname("pwn-101", None, "challenges.ctf.example"),
            "pwn-101.challenges.ctf.example"
        );
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        let mut inst = Instance {
            instance_id: "i-1".to_string(),
            challenge_id: "42".to_string(),
            owner_id: "team-7".to_string(),
            container_id: "abc".to_string(),
            challenge_slug: "pwn".to_string(),
            hostname: "pwn-team-7.challenges.local".to_string(),
            internal_address: None,
            state: InstanceState::Running,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            last_seen_event_at: None,
        };
        assert!(!inst.is_expired(now));
        inst.expires_at = now - chrono::Duration::seconds(1);
        assert!(inst.is_expired(now));
    }
}
