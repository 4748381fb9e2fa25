//! Pure sandbox lifecycle transitions
//!
//! Administrative status changes live here as a pure, synchronous function:
//! `step(status, signal) -> (status, actions)`. No IO, no async, no locking —
//! fully unit-testable. The controller and health monitor execute the
//! returned actions.
//!
//! `starting` is sticky: until a terminal signal (provisioned/failed)
//! arrives, neither a repeated create request nor a failed liveness probe
//! may restart a sandbox that is already mid-provision.

use driftbox_protocol::SandboxStatus;

/// Inputs observed by the controller and health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    CreateRequested,
    Provisioned,
    ProvisionFailed,
    StopRequested,
    /// Liveness probe could not reach the instance (expiry detected).
    ProbeDead,
}

/// IO the caller must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Provision,
    Kill,
    ClearReference,
}

pub fn step(status: SandboxStatus, signal: Signal) -> (SandboxStatus, Vec<Action>) {
    use Action::*;
    use SandboxStatus::*;
    use Signal::*;

    match (status, signal) {
        (Idle, CreateRequested) => (Starting, vec![Provision]),
        // Retry after a failed create.
        (Error, CreateRequested) => (Starting, vec![Provision]),

        // Sticky: a create already in flight absorbs repeated requests.
        (Starting, CreateRequested) => (Starting, vec![]),
        // Already up — reuse.
        (Ready, CreateRequested) => (Ready, vec![]),

        (Starting, Provisioned) => (Ready, vec![]),
        // The row keeps its error status so a retry stays observable; there
        // is no instance reference yet to clear.
        (Starting, ProvisionFailed) => (Error, vec![]),

        (_, StopRequested) => (Idle, vec![Kill, ClearReference]),

        (Ready, ProbeDead) => (Idle, vec![ClearReference]),
        (Error, ProbeDead) => (Idle, vec![ClearReference]),
        // Mid-boot probes fail routinely; do not race-restart.
        (Starting, ProbeDead) => (Starting, vec![]),

        (status, _) => (status, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SandboxStatus::*;

    #[test]
    fn create_from_idle_provisions() {
        let (status, actions) = step(Idle, Signal::CreateRequested);
        assert_eq!(status, Starting);
        assert_eq!(actions, vec![Action::Provision]);
    }

    #[test]
    fn starting_is_sticky_for_repeated_creates() {
        let (status, actions) = step(Starting, Signal::CreateRequested);
        assert_eq!(status, Starting);
        assert!(actions.is_empty());
    }

    #[test]
    fn probe_failure_during_boot_does_not_restart() {
        let (status, actions) = step(Starting, Signal::ProbeDead);
        assert_eq!(status, Starting);
        assert!(actions.is_empty());
    }

    #[test]
    fn probe_failure_when_ready_clears_reference() {
        let (status, actions) = step(Ready, Signal::ProbeDead);
        assert_eq!(status, Idle);
        assert_eq!(actions, vec![Action::ClearReference]);
    }

    #[test]
    fn stop_works_from_every_state() {
        for start in [Idle, Starting, Ready, Error] {
            let (status, actions) = step(start, Signal::StopRequested);
            assert_eq!(status, Idle);
            assert_eq!(actions, vec![Action::Kill, Action::ClearReference]);
        }
    }

    #[test]
    fn create_after_error_reprovisions() {
        let (status, actions) = step(Error, Signal::CreateRequested);
        assert_eq!(status, Starting);
        assert_eq!(actions, vec![Action::Provision]);
    }

    #[test]
    fn provision_outcomes_are_terminal_for_starting() {
        assert_eq!(step(Starting, Signal::Provisioned).0, Ready);
        let (status, actions) = step(Starting, Signal::ProvisionFailed);
        assert_eq!(status, Error);
        assert!(actions.is_empty());
    }
}
