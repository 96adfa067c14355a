use std::{path::Path, sync::Arc};

use comms::{Collective, Tensor};
use log::{info, warn};
use model::{CheckpointErr, ParameterRegistry, checkpoint};
use tokio::{
    runtime::Handle,
    sync::oneshot,
    task::JoinHandle,
};

use crate::{
    error::{ReceiverErr, Result},
    receiver::{ReceiverConfig, ReceiverStats, WeightReceiver},
};

/// Called once with the registry of a freshly loaded model.
pub type LoadedHook = Box<dyn FnOnce(Arc<ParameterRegistry>) + Send>;

/// An inference engine whose parameters can be updated while it serves.
pub trait InferenceRuntime {
    /// Registers `hook` to run once the parameters are loaded.
    ///
    /// Runs it right away if they already are.
    fn on_loaded(&mut self, hook: LoadedHook);
}

/// A runtime holding its parameters in process.
#[derive(Default)]
pub struct LocalRuntime {
    registry: Option<Arc<ParameterRegistry>>,
    hooks: Vec<LoadedHook>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> Option<Arc<ParameterRegistry>> {
        self.registry.clone()
    }

    /// Installs `params` as the model and fires every pending hook.
    pub fn load<I>(&mut self, params: I) -> Arc<ParameterRegistry>
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        let registry = Arc::new(ParameterRegistry::new(params));
        info!(params = registry.len(), hooks = self.hooks.len(); "model loaded");

        self.registry = Some(Arc::clone(&registry));
        for hook in self.hooks.drain(..) {
            hook(Arc::clone(&registry));
        }

        registry
    }

    /// Loads the model from safetensors files.
    pub fn load_safetensors<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
    ) -> std::result::Result<Arc<ParameterRegistry>, CheckpointErr> {
        let params = checkpoint::load_all(paths)?;
        Ok(self.load(params))
    }
}

impl InferenceRuntime for LocalRuntime {
    fn on_loaded(&mut self, hook: LoadedHook) {
        match &self.registry {
            Some(registry) => hook(Arc::clone(registry)),
            None => self.hooks.push(hook),
        }
    }
}

/// The weight receiver started by `attach_receiver`.
pub struct ReceiverHandle {
    started: oneshot::Receiver<JoinHandle<Result<ReceiverStats>>>,
}

impl ReceiverHandle {
    /// Waits for the model to load and then for the receiver to finish.
    pub async fn join(self) -> Result<ReceiverStats> {
        let task = self
            .started
            .await
            .map_err(|_| ReceiverErr::Aborted("runtime dropped before loading".into()))?;

        task.await.map_err(|e| ReceiverErr::Aborted(e.to_string()))?
    }
}

/// Starts a `WeightReceiver` on `collective` as soon as `runtime` has loaded its model.
///
/// Dropping the returned handle does not stop the receiver, it keeps applying
/// updates until the sender shuts it down.
///
/// # Returns
/// A handle to await the receiver, or an error when called outside a tokio runtime.
pub fn attach_receiver<R, C>(runtime: &mut R, collective: C, config: ReceiverConfig) -> Result<ReceiverHandle>
where
    R: InferenceRuntime + ?Sized,
    C: Collective + 'static,
{
    let handle = Handle::try_current().map_err(|e| ReceiverErr::Aborted(e.to_string()))?;
    let (tx, rx) = oneshot::channel();

    runtime.on_loaded(Box::new(move |registry| {
        let receiver = WeightReceiver::new(collective, registry, config);
        if tx.send(handle.spawn(receiver.run())).is_err() {
            warn!("receiver handle dropped before the model loaded, receiver runs detached");
        }
    }));

    Ok(ReceiverHandle { started: rx })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use comms::Dtype;

    use super::*;

    #[test]
    fn hooks_fire_once_on_load_and_immediately_after() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut runtime = LocalRuntime::new();

        let counter = Arc::clone(&calls);
        runtime.on_loaded(Box::new(move |registry| {
            assert_eq!(registry.len(), 1);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        runtime.load([("w".to_string(), Tensor::zeros(Dtype::F32, &[2]))]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&calls);
        runtime.on_loaded(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
