use folio_core::{PermissionDecision, TaskId, UserId};

/// Answers "can this user edit this task". Owned by the surrounding system.
pub trait PermissionGate: Send + Sync {
    fn check_edit_permission(&self, task_id: TaskId, user_id: UserId) -> PermissionDecision;
}

impl<F> PermissionGate for F
where
    F: Fn(TaskId, UserId) -> PermissionDecision + Send + Sync,
{
    fn check_edit_permission(&self, task_id: TaskId, user_id: UserId) -> PermissionDecision {
        self(task_id, user_id)
    }
}
