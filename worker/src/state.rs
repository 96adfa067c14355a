/// Where a worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, the control loop has not started.
    Uninitialized,
    /// Executing operations.
    Ready,
    /// Left the loop, the group is released.
    Terminated,
}

impl WorkerState {
    #[inline]
    pub fn is_running(self) -> bool {
        self == WorkerState::Ready
    }
}
