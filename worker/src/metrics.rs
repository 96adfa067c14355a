use std::time::Duration;

/// What a worker did until it left the control loop.
#[derive(Debug, Default, Clone)]
pub struct WorkerMetrics {
    pub recv_time: Duration,
    pub compute_time: Duration,

    /// Operations executed, `Exit` included.
    pub iterations: u64,
    pub train_steps: u64,
    pub optimize_steps: u64,
    pub forwards: u64,
    pub extracts: u64,
    pub sparse_results: u64,

    /// The group-averaged loss of every train step.
    pub losses: Vec<f32>,
}

impl WorkerMetrics {
    #[inline]
    pub fn bump_iteration(&mut self) {
        self.iterations += 1;
    }

    #[inline]
    pub fn add_sparse_results(&mut self, n: usize) {
        self.sparse_results += n as u64;
    }

    #[inline]
    pub fn push_loss(&mut self, loss: f32) {
        self.train_steps += 1;
        self.losses.push(loss);
    }

    pub fn last_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }
}
