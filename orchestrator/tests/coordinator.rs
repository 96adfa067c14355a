use std::{sync::Arc, time::Duration};

use comms::{
    Dtype, LocalGroup, MemoryStore, Tensor,
    sparse::SparseResult,
    specs::{
        handshake::{Handshake, ModelSource},
        operation::{BatchDescriptor, Hyperparameters, OptimizeStep, TrainStep},
    },
};
use futures::future::join_all;
use inference::{ReceiverConfig, WeightReceiver};
use model::ParameterRegistry;
use orchestrator::{Coordinator, CoordinatorConfig, OrchestratorError, Session, WeightBroadcaster};
use serde_json::json;
use tokio::sync::mpsc;
use worker::{Batch, DummyBackend, Snapshot, Worker, WorkerConfig, bootstrap};

fn params() -> Vec<(String, Tensor)> {
    vec![
        (
            "model.layers.0.mlp.down_proj.weight".to_string(),
            Tensor::from_vec(vec![2, 2], vec![1.0f32, 2.0, 3.0, 4.0]).unwrap(),
        ),
        (
            "model.norm.weight".to_string(),
            Tensor::from_vec(vec![3], vec![1.0f32; 3]).unwrap(),
        ),
    ]
}

fn backend() -> DummyBackend {
    DummyBackend::new(Arc::new(ParameterRegistry::new(params())))
}

fn hyperparameters() -> Hyperparameters {
    Hyperparameters {
        lr_scheduler_spec: json!({"constant": {}}),
        optimizer_spec: json!({"lr": 1.0}),
        micro_batch_size: 1,
        grad_accum_in_fp32: false,
    }
}

fn train_step(step: u32) -> TrainStep {
    TrainStep {
        step,
        zero_optimizer: false,
        batch_id: (step as u64, 0),
        batch: BatchDescriptor {
            batch_shape: Vec::new(),
            has_labels: false,
            has_position_ids: false,
            sequence_lengths: None,
        },
        warmup_lr_range: None,
        sparse_results_len: 0,
        sparse_results_metadata: None,
    }
}

fn result(down_idx: i64, norm_idx: i64) -> Vec<SparseResult> {
    vec![
        SparseResult {
            sparse_idx: Tensor::from_vec(vec![1], vec![down_idx]).unwrap(),
            sparse_val: Tensor::from_vec(vec![1], vec![1.0f32]).unwrap(),
            xshape: vec![2, 2],
            totalk: 4,
        },
        SparseResult {
            sparse_idx: Tensor::from_vec(vec![1], vec![norm_idx]).unwrap(),
            sparse_val: Tensor::from_vec(vec![1], vec![1.0f32]).unwrap(),
            xshape: vec![3],
            totalk: 3,
        },
    ]
}

#[tokio::test(flavor = "multi_thread")]
async fn workers_follow_the_coordinator() {
    const WORLD_SIZE: usize = 3;

    let store = MemoryStore::new();
    let mut members = LocalGroup::create(WORLD_SIZE);
    let sender = members.remove(0);

    let mut snapshots = Vec::new();
    let handles: Vec<_> = members
        .into_iter()
        .map(|member| {
            let (tx, rx) = mpsc::channel::<Snapshot>(4);
            snapshots.push(rx);
            let mut worker = Worker::new(member, store.clone(), backend()).with_snapshots(tx);
            tokio::spawn(async move { worker.run().await })
        })
        .collect();

    let mut coordinator = Coordinator::new(sender, store, backend()).unwrap();
    coordinator.configure(hyperparameters()).await.unwrap();

    let ids = Tensor::from_vec(vec![1, 4], vec![1i64, 2, 3, 4]).unwrap();
    let mut batch = Batch::new(ids.clone()).unwrap().with_labels(ids).unwrap();

    let loss = coordinator.train(train_step(0), &mut batch, &[]).await.unwrap();
    assert!((loss - 3.5f32.ln()).abs() < 1e-6);

    let results = vec![result(0, 2), result(3, 2)];
    let loss = coordinator.train(train_step(1), &mut batch, &results).await.unwrap();
    assert!((loss - 3.5f32.ln()).abs() < 1e-6);

    let optimize = OptimizeStep {
        step: 2,
        warmup_lr_range: None,
        sparse_results_len: 0,
        sparse_results_metadata: None,
    };
    coordinator.optimize(optimize, &[result(1, 0)]).await.unwrap();

    let forward = coordinator.forward(&mut batch, None, Some(2.0)).await.unwrap();
    assert!((forward.unwrap() - 2.0 * 3.5f32.ln()).abs() < 1e-5);

    let local = coordinator.extract().await.unwrap();
    assert_eq!(
        local["model.layers.0.mlp.down_proj.weight"].to_vec::<f32>().unwrap(),
        vec![0.5, 1.0, 3.0, 3.5]
    );
    assert_eq!(local["model.norm.weight"].to_vec::<f32>().unwrap(), vec![0.0, 1.0, 0.0]);

    coordinator.finish().await.unwrap();
    assert_eq!(coordinator.iteration(), 6);

    for metrics in join_all(handles).await {
        let metrics = metrics.unwrap().unwrap();
        assert_eq!(metrics.iterations, 6);
        assert_eq!(metrics.train_steps, 2);
        assert_eq!(metrics.optimize_steps, 1);
        assert_eq!(metrics.forwards, 1);
        assert_eq!(metrics.sparse_results, 3);
    }

    for mut rx in snapshots {
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.iteration, 5);
        assert_eq!(snapshot.params, local);
    }
}

#[tokio::test]
async fn operations_need_a_configured_trainer() {
    let mut members = LocalGroup::create(1);
    let mut coordinator = Coordinator::new(members.remove(0), MemoryStore::new(), backend()).unwrap();

    let err = coordinator.extract().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotConfigured { operation: "extract" }));
    assert_eq!(coordinator.iteration(), 0);
}

#[tokio::test]
async fn only_the_sender_rank_coordinates() {
    let mut members = LocalGroup::create(2);
    let peer = members.remove(1);

    let err = Coordinator::new(peer, MemoryStore::new(), backend()).err().unwrap();
    assert!(matches!(err, OrchestratorError::InvalidConfig(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrapped_worker_reads_the_handshake() {
    let store = MemoryStore::new();
    let mut members = LocalGroup::create(2);
    let peer = members.remove(1);

    let cfg = WorkerConfig::new(comms::specs::group::GroupSpec::new("local", 2, 1), "local");
    let worker_store = store.clone();
    let handle = tokio::spawn(async move {
        bootstrap::run_bootstrapped(peer, worker_store, &cfg, |handshake| {
            assert_eq!(handshake.architecture, "llama");
            assert_eq!(handshake.dp, 2);
            Ok(backend())
        })
        .await
    });

    let mut coordinator = Coordinator::new(members.remove(0), store, backend()).unwrap();
    coordinator
        .publish_handshake(&Handshake {
            architecture: "llama".into(),
            source: ModelSource::Files(vec!["model.safetensors".into()]),
            dp: 2,
            tp: 1,
        })
        .await
        .unwrap();
    coordinator.configure(hyperparameters()).await.unwrap();
    coordinator.exit().await.unwrap();

    assert_eq!(handle.await.unwrap().unwrap().iterations, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn extracted_weights_reach_the_inference_registry() {
    let mut weights = LocalGroup::with_timeout(2, Duration::from_secs(10));
    let receiver_member = weights.remove(1);

    let inference_registry = Arc::new(ParameterRegistry::new(
        params()
            .into_iter()
            .map(|(name, tensor)| (name, Tensor::zeros(Dtype::BF16, tensor.shape()))),
    ));
    let receiver = WeightReceiver::new(receiver_member, Arc::clone(&inference_registry), ReceiverConfig::default());
    let receiving = tokio::spawn(receiver.run());

    let mut broadcaster = WeightBroadcaster::new(weights.remove(0)).unwrap();
    let sent = broadcaster
        .broadcast_state_dict(params().into_iter().collect())
        .await
        .unwrap();
    broadcaster.broadcast_shutdown().await.unwrap();

    assert_eq!(sent, 2);
    let stats = receiving.await.unwrap().unwrap();
    assert_eq!(stats.applied, 2);

    let down = inference_registry.get("model.layers.0.mlp.down_proj.weight").unwrap();
    assert_eq!(down.dtype(), Dtype::BF16);
    assert_eq!(down.cast(Dtype::F32).to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn session_trains_and_pushes_weights() {
    const WORLD_SIZE: usize = 2;

    let store = MemoryStore::new();
    let mut members = LocalGroup::create(WORLD_SIZE);
    let sender = members.remove(0);
    let workers: Vec<_> = members
        .into_iter()
        .map(|member| {
            let mut worker = Worker::new(member, store.clone(), backend());
            tokio::spawn(async move { worker.run().await })
        })
        .collect();

    let mut weights = LocalGroup::create(2);
    let inference_registry = Arc::new(ParameterRegistry::new(params()));
    let receiver = WeightReceiver::new(weights.remove(1), Arc::clone(&inference_registry), ReceiverConfig::default());
    let receiving = tokio::spawn(receiver.run());

    let mut cfg = CoordinatorConfig::new(
        comms::specs::group::GroupSpec::new("local", WORLD_SIZE, 0),
        "local",
        vec!["model.safetensors".into()],
    );
    cfg.steps = 4;
    cfg.extract_every = 2;
    cfg.batch_shape = vec![2, 8];
    cfg.topk = 2;
    cfg.seed = Some(7);

    let coordinator = Coordinator::new(sender, store, backend()).unwrap();
    let broadcaster = WeightBroadcaster::new(weights.remove(0)).unwrap();
    let shapes = vec![vec![2, 2], vec![3]];
    let report = Session::new(coordinator, Some(broadcaster), shapes, cfg.seed)
        .run(&cfg)
        .await
        .unwrap();

    assert_eq!(report.losses.len(), 4);
    assert_eq!(report.broadcasts, 3);

    for metrics in join_all(workers).await {
        let metrics = metrics.unwrap().unwrap();
        assert_eq!(metrics.losses, report.losses);
        assert_eq!(metrics.extracts, 3);
    }

    let stats = receiving.await.unwrap().unwrap();
    assert_eq!(stats.applied, 6);
}
