use crate::model::{Role, Status};

/// Whether `role` may move a booking from `from` to `to`.
///
/// Exhaustive over every `(from, to)` pair so that a new status forces this
/// table to be revisited.
pub fn is_allowed(from: Status, to: Status, role: Role) -> bool {
    use Status::*;
    match (from, to) {
        (Pending, Confirmed) => matches!(role, Role::Provider),
        (Pending, Cancelled) | (Confirmed, Cancelled) => {
            matches!(role, Role::Provider | Role::Requester)
        }
        (Confirmed, Completed) => match role {
            Role::Provider | Role::Requester | Role::System => true,
        },
        // Terminal states have no outgoing edges.
        (Completed | Cancelled, _) => false,
        // Nothing regresses to pending, and re-applying a status is not a move.
        (_, Pending) | (Confirmed, Confirmed) => false,
        // Completion requires a confirmed booking.
        (Pending, Completed) => false,
    }
}

/// Every status reachable from `from` by `role` in one step.
pub fn next_statuses(from: Status, role: Role) -> Vec<Status> {
    Status::ALL
        .into_iter()
        .filter(|to| is_allowed(from, *to, role))
        .collect()
}
