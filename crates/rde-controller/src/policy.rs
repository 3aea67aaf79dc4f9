//! Idle scaling policy

use chrono::{DateTime, Utc};
use rde_core::{IdleTtl, Idleness};

/// What to do with an agent's replica count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Scale(i32),
    Unchanged,
}

/// Desired replica count for one agent
///
/// `woken` means a user tried to reach the agent after it was scaled down.
/// An agent with no activity record is never scaled down.
pub fn decide(ttl: IdleTtl, idleness: Idleness, current_replicas: i32, woken: bool) -> Decision {
    let ttl = match ttl {
        IdleTtl::Disabled => {
            return if current_replicas == 1 {
                Decision::Unchanged
            } else {
                Decision::Scale(1)
            };
        }
        IdleTtl::After(ttl) => ttl,
    };

    if let Idleness::Idle(idle) = idleness {
        if idle >= ttl && current_replicas > 0 {
            return Decision::Scale(0);
        }
    }

    if woken && current_replicas == 0 {
        return Decision::Scale(1);
    }

    Decision::Unchanged
}

/// Whether an access arrived after the last scale-down
///
/// A workload at zero with no recorded scale-down wakes on any access.
pub fn is_woken(last_access: Option<DateTime<Utc>>, scaled_down_at: Option<DateTime<Utc>>) -> bool {
    match (last_access, scaled_down_at) {
        (Some(access), Some(down)) => access > down,
        (Some(_), None) => true,
        (None, _) => false,
    }
}
