use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use folio_core::{AccessReason, PermissionDecision, TaskId, UserId};
use folio_engine::PermissionGate;

/// Permission gate whose answers tests can change on the fly. Everyone may
/// edit unless denied; task owners are reported as `owner`.
#[derive(Debug, Default)]
pub struct ScriptedGate {
    owners: Mutex<HashMap<TaskId, UserId>>,
    denied: Mutex<HashSet<(TaskId, UserId)>>,
    checks: Mutex<u64>,
}

impl ScriptedGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_owner(&self, task_id: TaskId, user_id: UserId) {
        if let Ok(mut owners) = self.owners.lock() {
            owners.insert(task_id, user_id);
        }
    }

    pub fn deny(&self, task_id: TaskId, user_id: UserId) {
        if let Ok(mut denied) = self.denied.lock() {
            denied.insert((task_id, user_id));
        }
    }

    pub fn allow(&self, task_id: TaskId, user_id: UserId) {
        if let Ok(mut denied) = self.denied.lock() {
            denied.remove(&(task_id, user_id));
        }
    }

    /// How many decisions the engine asked for.
    pub fn checks(&self) -> u64 {
        self.checks.lock().map(|n| *n).unwrap_or(0)
    }
}

impl PermissionGate for ScriptedGate {
    fn check_edit_permission(&self, task_id: TaskId, user_id: UserId) -> PermissionDecision {
        if let Ok(mut n) = self.checks.lock() {
            *n += 1;
        }
        let denied = self
            .denied
            .lock()
            .map(|d| d.contains(&(task_id, user_id)))
            .unwrap_or(true);
        if denied {
            return PermissionDecision::deny(AccessReason::NoPermission);
        }
        let is_owner = self
            .owners
            .lock()
            .map(|o| o.get(&task_id) == Some(&user_id))
            .unwrap_or(false);
        if is_owner {
            PermissionDecision::allow(AccessReason::Owner)
        } else {
            PermissionDecision::allow(AccessReason::GrantedPermission)
        }
    }
}
