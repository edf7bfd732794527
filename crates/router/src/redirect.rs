//! Redirect handling state machine.
//!
//! ```text
//! Routed --redirect--> Redirecting --redirect--> Failed
//!    ^                      |
//!    +---- success ---------+
//! ```
//!
//! Entering `Redirecting` allows one retry: at the owner the redirect named,
//! or after a routing-table refresh when it named none.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    /// Operating on the current routing table.
    Routed,
    /// A redirect was seen and the one retry is in flight.
    Redirecting,
    /// A second redirect: give up.
    Failed,
}

impl RouteState {
    /// Transition on a redirect response.
    pub fn on_redirect(self) -> Self {
        match self {
            RouteState::Routed => RouteState::Redirecting,
            RouteState::Redirecting | RouteState::Failed => RouteState::Failed,
        }
    }

    pub fn is_failed(self) -> bool {
        self == RouteState::Failed
    }
}
