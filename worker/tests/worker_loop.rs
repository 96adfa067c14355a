use std::sync::Arc;

use comms::{
    Collective, LocalGroup, LocalMember, MemoryStore, RendezvousStore, Tensor,
    specs::operation::{self, BatchDescriptor, Hyperparameters, Operation, TrainStep},
};
use model::ParameterRegistry;
use rand::Rng;
use serde_json::json;
use tokio::{sync::mpsc, task::JoinHandle};
use worker::{Batch, DummyBackend, Snapshot, Worker, WorkerMetrics, WorkerState, batch, error::Result};

fn hyperparameters() -> Operation {
    Operation::Configure(Hyperparameters {
        lr_scheduler_spec: json!({"constant": {}}),
        optimizer_spec: json!({"lr": 1.0}),
        micro_batch_size: 2,
        grad_accum_in_fp32: false,
    })
}

fn registry() -> Arc<ParameterRegistry> {
    Arc::new(ParameterRegistry::new([(
        "layers.0.w".to_string(),
        Tensor::from_vec(vec![2, 2], vec![1.0f32, 2.0, 3.0, 4.0]).unwrap(),
    )]))
}

async fn publish(store: &MemoryStore, iteration: u64, op: &Operation) {
    let key = operation::operation_key(iteration);
    store.set(&key, &op.to_json().unwrap()).await.unwrap();
}

/// Splits a local group into the sender and the remaining members.
fn group(world_size: usize) -> (LocalMember, Vec<LocalMember>) {
    let mut members = LocalGroup::create(world_size);
    let coordinator = members.remove(0);
    (coordinator, members)
}

fn spawn(member: LocalMember, store: &MemoryStore) -> JoinHandle<Result<WorkerMetrics>> {
    let mut worker = Worker::new(member, store.clone(), DummyBackend::new(registry()));
    tokio::spawn(async move { worker.run().await })
}

#[tokio::test]
async fn operations_run_in_iteration_order() {
    let store = MemoryStore::new();
    publish(&store, 2, &Operation::Exit).await;
    publish(&store, 0, &hyperparameters()).await;
    publish(&store, 1, &Operation::Extract).await;

    let (mut coordinator, mut members) = group(2);
    let (tx, mut rx) = mpsc::channel::<Snapshot>(1);

    let mut worker = Worker::new(members.remove(0), store.clone(), DummyBackend::new(registry())).with_snapshots(tx);
    assert_eq!(worker.state(), WorkerState::Uninitialized);

    let handle = tokio::spawn(async move {
        let metrics = worker.run().await;
        (metrics, worker.state())
    });

    for _ in 0..3 {
        coordinator.barrier().await.unwrap();
    }

    let (metrics, state) = handle.await.unwrap();
    let metrics = metrics.unwrap();
    assert_eq!(state, WorkerState::Terminated);
    assert_eq!(metrics.iterations, 3);
    assert_eq!(metrics.extracts, 1);

    let snapshot = rx.recv().await.unwrap();
    assert_eq!(snapshot.iteration, 1);
    assert_eq!(
        snapshot.params["layers.0.w"].to_vec::<f32>().unwrap(),
        vec![1.0, 2.0, 3.0, 4.0]
    );
}

#[tokio::test]
async fn missing_operation_exits_the_loop() {
    let store = MemoryStore::new();
    let (mut coordinator, mut members) = group(2);
    let handle = spawn(members.remove(0), &store);

    coordinator.barrier().await.unwrap();

    let metrics = handle.await.unwrap().unwrap();
    assert_eq!(metrics.iterations, 0);
    assert!(metrics.losses.is_empty());
}

#[tokio::test]
async fn exit_before_configure_is_allowed() {
    let store = MemoryStore::new();
    publish(&store, 0, &Operation::Exit).await;

    let (mut coordinator, mut members) = group(2);
    let handle = spawn(members.remove(0), &store);

    coordinator.barrier().await.unwrap();
    assert_eq!(handle.await.unwrap().unwrap().iterations, 1);
}

#[tokio::test]
async fn every_rank_reports_the_same_averaged_loss() {
    const WORLD_SIZE: usize = 3;
    const BATCH_SHAPE: [usize; 2] = [2, 128];

    let mut rng = rand::rng();
    let ids: Vec<i64> = (0..BATCH_SHAPE[0] * BATCH_SHAPE[1])
        .map(|_| rng.random_range(0..32_000))
        .collect();
    let input_ids = Tensor::from_vec(BATCH_SHAPE.to_vec(), ids.clone()).unwrap();
    let mut batch = Batch::new(input_ids.clone())
        .unwrap()
        .with_labels(input_ids)
        .unwrap();

    let train = Operation::Train(TrainStep {
        step: 0,
        zero_optimizer: true,
        batch_id: (0, 1),
        batch: BatchDescriptor {
            batch_shape: BATCH_SHAPE.to_vec(),
            has_labels: true,
            has_position_ids: false,
            sequence_lengths: None,
        },
        warmup_lr_range: None,
        sparse_results_len: 0,
        sparse_results_metadata: None,
    });

    let store = MemoryStore::new();
    publish(&store, 0, &hyperparameters()).await;
    publish(&store, 1, &train).await;
    publish(&store, 2, &Operation::Exit).await;

    let (mut coordinator, members) = group(WORLD_SIZE);
    let handles: Vec<_> = members.into_iter().map(|m| spawn(m, &store)).collect();

    coordinator.barrier().await.unwrap();
    coordinator.barrier().await.unwrap();
    batch::send_batch(&mut coordinator, &mut batch).await.unwrap();
    let mut loss = [0.0f32];
    coordinator.all_reduce_sum(&mut loss).await.unwrap();
    coordinator.barrier().await.unwrap();

    let mean = ids.iter().sum::<i64>() as f64 / ids.len() as f64;
    let expected = 2.0 * mean.ln_1p() as f32 / WORLD_SIZE as f32;
    assert!((loss[0] / WORLD_SIZE as f32 - expected).abs() < 1e-5);

    let mut losses = Vec::new();
    for handle in handles {
        let metrics = handle.await.unwrap().unwrap();
        assert_eq!(metrics.train_steps, 1);
        losses.push(metrics.last_loss().unwrap());
    }

    assert!(losses.iter().all(|l| l.to_bits() == losses[0].to_bits()));
    assert!((losses[0] - expected).abs() < 1e-5);
}
