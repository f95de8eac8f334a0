use super::types::TaskState;

pub fn valid_state_transition(src: &TaskState, dst: &TaskState) -> bool {
    let valid_states: &[TaskState] = match src {
        TaskState::Pending => &[TaskState::Running, TaskState::Terminating],
        TaskState::Running => &[
            TaskState::Running,
            TaskState::Exposed,
            TaskState::Terminating,
        ],
        TaskState::Exposed => &[TaskState::Exposed, TaskState::Terminating],
        TaskState::Terminating => &[],
    };

    valid_states.contains(dst)
}
