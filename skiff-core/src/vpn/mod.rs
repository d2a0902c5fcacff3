//! VPN connection module
//!
//! Session state, usage limits, reconnection, heartbeat reconciliation and
//! the state machine that drives them.

pub mod heartbeat;
pub mod machine;
pub mod reconnect;
pub mod state;
pub mod usage;

// Public re-exports
pub use heartbeat::{reconcile, ActionClock, Decision, Heartbeat, PollWindow};
pub use machine::{ConnectionStateMachine, MachineSnapshot};
pub use reconnect::{ReconnectScheduler, ReconnectionPolicy};
pub use state::{ConnectionSession, ConnectionStatus, FinishedSession, SessionStats};
pub use usage::{
    ConnectDecision, DailyLimitStatus, DailyUsage, LimitCheck, Limits, Remaining,
    UsageLimitGuard, UserLimitTier,
};
