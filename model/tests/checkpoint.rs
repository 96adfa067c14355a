use std::{collections::BTreeMap, sync::Arc, thread};

use comms::{Dtype, Tensor};
use model::{ParameterRegistry, checkpoint, transforms};

fn checkpoint_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("model-{}-{name}.safetensors", std::process::id()))
}

#[test]
fn registry_survives_a_checkpoint_round_trip() {
    let mut params = BTreeMap::new();
    params.insert(
        "model.layers.0.self_attn.q_proj.weight".to_string(),
        Tensor::from_vec(vec![4, 2], (0..8).map(|i| i as f32).collect()).unwrap(),
    );
    params.insert(
        "model.embed_tokens.weight".to_string(),
        Tensor::zeros(Dtype::BF16, &[3, 2]),
    );

    let first = checkpoint_path("first");
    checkpoint::save(&first, &params).unwrap();

    let registry = Arc::new(ParameterRegistry::new(checkpoint::load(&first).unwrap()));
    assert_eq!(registry.len(), 2);
    assert_eq!(
        registry.meta("model.embed_tokens.weight"),
        Some((vec![3, 2], Dtype::BF16))
    );

    let writers: Vec<_> = (0..4)
        .map(|i| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                registry
                    .update_with("model.layers.0.self_attn.q_proj.weight", |w| {
                        transforms::scatter_add(w, &[i as i64], &[10.0])
                    })
                    .unwrap()
                    .unwrap();
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let second = checkpoint_path("second");
    checkpoint::save(&second, &registry.snapshot()).unwrap();
    let reloaded = checkpoint::load_all(&[&second]).unwrap();

    assert_eq!(
        reloaded["model.layers.0.self_attn.q_proj.weight"].to_vec::<f32>().unwrap(),
        vec![10.0, 11.0, 12.0, 13.0, 4.0, 5.0, 6.0, 7.0]
    );
    assert_eq!(reloaded["model.embed_tokens.weight"], params["model.embed_tokens.weight"]);

    let _ = std::fs::remove_file(first);
    let _ = std::fs::remove_file(second);
}

#[test]
fn rotary_permutation_roundtrips_a_loaded_projection() {
    let q = Tensor::from_vec(vec![12, 3], (0..36).map(|i| i as f32).collect())
        .unwrap()
        .cast(Dtype::F16);

    let permuted = transforms::permute_for_rotary(&q, 2).unwrap();
    assert_ne!(permuted, q);
    assert_eq!(transforms::unpermute_for_rotary(&permuted, 2).unwrap(), q);
}
