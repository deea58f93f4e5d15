//! Conditions over VM snapshots.

use vmh_converge::Condition;

use crate::model::{VmSnapshot, VmState};

/// The VM reports `state`.
///
/// A `failed` VM can never get there. Neither can a `destroyed` one, unless
/// destroyed is the target, in which case a VM the backend has already
/// purged counts as arrived.
pub fn state_is(state: VmState) -> Condition<VmSnapshot> {
    let wanted = state.clone();
    let condition = Condition::new(format!("state {state}"), move |vm: &VmSnapshot| {
        vm.state == wanted
    });

    if state == VmState::Destroyed {
        return condition
            .fail_when(|vm| (vm.state == VmState::Failed).then(|| "VM failed".to_string()))
            .accept_gone();
    }

    condition.fail_when(|vm| vm.state.is_terminal().then(|| format!("VM is {}", vm.state)))
}

/// The VM carries `alias`.
pub fn alias_is(alias: impl Into<String>) -> Condition<VmSnapshot> {
    let alias = alias.into();
    Condition::new(format!("alias {alias}"), {
        let alias = alias.clone();
        move |vm: &VmSnapshot| vm.alias.as_deref() == Some(alias.as_str())
    })
    .fail_when(|vm| vm.state.is_terminal().then(|| format!("VM is {}", vm.state)))
}
