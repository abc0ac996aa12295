//! Recovery-Policy für fehlgeschlagene Peer Connections
//!
//! Reiner Zustand ohne Timer: die Policy entscheidet nur, *was* als
//! Nächstes passiert und nach welcher Wartezeit. Der Manager plant es ein.
//!
//! Stufen bei `failed`:
//! 1. Erste Störung ohne Relay: Verbindung komplett neu, nur über TURN
//! 2. Danach bis zum Budget: ICE-Restart auf derselben Verbindung
//! 3. Budget aufgebraucht: Anruf ist verloren

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Normal,
    RelayForced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Verbindung schließen und mit Relay-only neu aufbauen
    RecreateWithRelay { delay: Duration },
    /// ICE-Restart auf der bestehenden Verbindung
    IceRestart { attempt: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    mode: RecoveryMode,
    restart_attempts: u32,
    max_restarts: u32,
    retry_delay: Duration,
    disconnected_grace: Duration,
}

impl RecoveryPolicy {
    pub fn new(
        max_restarts: u32,
        retry_delay: Duration,
        disconnected_grace: Duration,
        relay_forced: bool,
    ) -> Self {
        Self {
            mode: if relay_forced {
                RecoveryMode::RelayForced
            } else {
                RecoveryMode::Normal
            },
            restart_attempts: 0,
            max_restarts,
            retry_delay,
            disconnected_grace,
        }
    }

    /// Nächster Schritt nach einem `failed`
    pub fn on_failed(&mut self) -> RecoveryAction {
        if self.mode == RecoveryMode::Normal {
            self.mode = RecoveryMode::RelayForced;
            return RecoveryAction::RecreateWithRelay {
                delay: self.retry_delay,
            };
        }

        if self.restart_attempts < self.max_restarts {
            self.restart_attempts += 1;
            return RecoveryAction::IceRestart {
                attempt: self.restart_attempts,
                delay: self.retry_delay,
            };
        }

        RecoveryAction::GiveUp
    }

    /// Manueller Retry: Relay erzwingen, Budget zurücksetzen
    pub fn reset_for_manual_retry(&mut self) {
        self.mode = RecoveryMode::RelayForced;
        self.restart_attempts = 0;
    }

    pub fn force_relay(&mut self) {
        self.mode = RecoveryMode::RelayForced;
    }

    pub fn relay_forced(&self) -> bool {
        self.mode == RecoveryMode::RelayForced
    }

    pub fn mode(&self) -> RecoveryMode {
        self.mode
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    pub fn disconnected_grace(&self) -> Duration {
        self.disconnected_grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_secs(3);
    const GRACE: Duration = Duration::from_secs(12);

    #[test]
    fn test_relay_first_then_restarts_then_give_up() {
        let mut policy = RecoveryPolicy::new(3, DELAY, GRACE, false);

        assert_eq!(
            policy.on_failed(),
            RecoveryAction::RecreateWithRelay { delay: DELAY }
        );
        assert!(policy.relay_forced());

        for attempt in 1..=3 {
            assert_eq!(
                policy.on_failed(),
                RecoveryAction::IceRestart {
                    attempt,
                    delay: DELAY
                }
            );
        }
        assert_eq!(policy.on_failed(), RecoveryAction::GiveUp);
        assert_eq!(policy.on_failed(), RecoveryAction::GiveUp);
        assert_eq!(policy.restart_attempts(), 3);
    }

    #[test]
    fn test_forced_relay_skips_recreate() {
        let mut policy = RecoveryPolicy::new(1, DELAY, GRACE, true);
        assert!(matches!(
            policy.on_failed(),
            RecoveryAction::IceRestart { attempt: 1, .. }
        ));
        assert_eq!(policy.on_failed(), RecoveryAction::GiveUp);
    }

    #[test]
    fn test_manual_retry_resets_budget() {
        let mut policy = RecoveryPolicy::new(1, DELAY, GRACE, false);
        policy.on_failed();
        policy.on_failed();
        assert_eq!(policy.on_failed(), RecoveryAction::GiveUp);

        policy.reset_for_manual_retry();
        assert_eq!(policy.restart_attempts(), 0);
        assert_eq!(policy.mode(), RecoveryMode::RelayForced);
        assert!(matches!(
            policy.on_failed(),
            RecoveryAction::IceRestart { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_zero_budget() {
        let mut policy = RecoveryPolicy::new(0, DELAY, GRACE, false);
        assert!(matches!(
            policy.on_failed(),
            RecoveryAction::RecreateWithRelay { .. }
        ));
        assert_eq!(policy.on_failed(), RecoveryAction::GiveUp);
    }
}
