// tests/checkpoint_roundtrip.rs - Model, optimizer and schedule state survive a checkpoint
use burn::{
    backend::Autodiff,
    module::AutodiffModule,
    tensor::{backend::Backend, Tensor},
};
use burn_ndarray::NdArray;
use card_est_rs::cardest::architectures::{DensityModel, Made, Ordering};
use card_est_rs::cardest::data::TableDataset;
use card_est_rs::cardest::settings::OptimizerKind;
use card_est_rs::cardest::training::{
    find_checkpoint, CheckpointMeta, LrPolicy, LrPolicyChoice, ModelOptimizer, Split, TrainConfig, Trainer,
};
use card_est_rs::test_utils::{codes_tensor, correlated_table, tiny_made};

type TestBackend = Autodiff<NdArray<f32>>;
type TestTrainer = Trainer<TestBackend, Made<TestBackend>, ModelOptimizer<Made<TestBackend>, TestBackend>>;

const TOTAL_STEPS: usize = 40;

type MakePolicy = Box<dyn Fn() -> LrPolicy>;

fn selector(s: &'static str) -> MakePolicy {
    Box::new(move || {
        LrPolicyChoice::default()
            .with_scheduler(Some(s), TOTAL_STEPS)
            .unwrap()
            .resolve(TOTAL_STEPS)
            .unwrap()
    })
}

fn policies() -> Vec<(&'static str, MakePolicy)> {
    let constant: MakePolicy = Box::new(|| LrPolicy::Constant(5e-3));
    let warmup: MakePolicy = Box::new(|| LrPolicy::Warmup {
        d_model: 8,
        warmup_steps: 6,
    });
    vec![
        ("constant", constant),
        ("custom", selector("wd_0.01_0.2")),
        ("warmup", warmup),
        ("cosine", selector("CosineAnnealingLR")),
        ("one_cycle", selector("OneCycleLR-0.25")),
    ]
}

fn trainer(policy: LrPolicy, kind: OptimizerKind) -> TestTrainer {
    let device = <TestBackend as Backend>::Device::default();
    let orderings = vec![Ordering::natural(3), Ordering::from_order(vec![2, 0, 1]).unwrap()];
    let model = tiny_made::<TestBackend>(vec![4, 5, 3], orderings, &device);
    let config = TrainConfig {
        batch_size: 8,
        accum_iter: 2,
        ..TrainConfig::default()
    };
    Trainer::new(model, ModelOptimizer::new(kind, &device), policy, config, device).unwrap()
}

fn logits(model: &Made<TestBackend>) -> Vec<f32> {
    let device = <TestBackend as Backend>::Device::default();
    let mut inner = model.valid();
    // The installed ordering is not part of a checkpoint; compare under the first one.
    if let Some(e) = inner.ensemble_mut() {
        e.set_ordering_index(0);
    }
    let codes = codes_tensor(&[0, 1, 2, 3, 4, 0], 2, 3, &device);
    let out: Tensor<NdArray<f32>, 2> = inner.forward_logits(codes);
    out.into_data().to_vec::<f32>().unwrap()
}

#[test]
fn test_roundtrip_restores_epoch_and_next_rate() {
    let table = correlated_table(64);
    for (name, make_policy) in policies() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = dir.path().join("ckpt-epoch5");

        let mut original = trainer(make_policy(), OptimizerKind::Adam);
        let mut stream = TableDataset::new(&table, 3);
        let mut loss = 0.0;
        for epoch in 0..2 {
            loss = original.run_epoch(Split::Train, &mut stream, epoch).unwrap().mean_loss;
        }
        let meta = original.save_checkpoint(&ckpt, 5, loss).unwrap();
        assert_eq!(meta.epoch, 5);

        let found = find_checkpoint(&format!("{}/ckpt-*", dir.path().display())).unwrap();
        assert_eq!(found, ckpt);

        let mut restored = trainer(make_policy(), OptimizerKind::Adam);
        let meta = restored.load_checkpoint(&found).unwrap();
        assert_eq!(meta.epoch, 5, "{name}");
        assert_eq!(meta.loss, loss, "{name}");
        assert_eq!(restored.global_step(), original.global_step(), "{name}");
        assert_eq!(restored.optimizer_steps(), original.optimizer_steps(), "{name}");
        assert_eq!(restored.scheduler_steps(), original.scheduler_steps(), "{name}");
        assert_eq!(meta.scheduler_steps, original.scheduler_steps(), "{name}");
        assert_eq!(restored.next_lr(), original.next_lr(), "{name}");
        assert_eq!(logits(&restored.model), logits(&original.model), "{name}");
    }
}

#[test]
fn test_restored_optimizer_continues_identically() {
    let table = correlated_table(64);
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("ckpt");

    let mut original = trainer(LrPolicy::Constant(1e-2), OptimizerKind::Adagrad);
    let mut stream = TableDataset::new(&table, 3);
    original.run_epoch(Split::Train, &mut stream, 0).unwrap();
    original.save_checkpoint(&ckpt, 1, 0.0).unwrap();

    let mut restored = trainer(LrPolicy::Constant(1e-2), OptimizerKind::Adagrad);
    restored.load_checkpoint(&ckpt).unwrap();
    for t in [&mut original, &mut restored] {
        if let Some(e) = t.model.ensemble_mut() {
            e.set_ordering_index(0);
        }
    }

    // Same data, same order: both continue to the same parameters.
    let mut a = TableDataset::new(&table, 11);
    let mut b = TableDataset::new(&table, 11);
    original.run_epoch(Split::Train, &mut a, 1).unwrap();
    restored.run_epoch(Split::Train, &mut b, 1).unwrap();

    let (x, y) = (logits(&original.model), logits(&restored.model));
    for (u, v) in x.iter().zip(&y) {
        assert!((u - v).abs() < 1e-5, "{u} vs {v}");
    }
}

#[test]
fn test_meta_file_is_readable_json() {
    let dir = tempfile::tempdir().unwrap();
    let mut original = trainer(LrPolicy::Constant(1e-3), OptimizerKind::Adam);
    let mut stream = TableDataset::new(&correlated_table(16), 0);
    original.run_epoch(Split::Train, &mut stream, 0).unwrap();
    original.save_checkpoint(dir.path(), 3, 1.25).unwrap();

    let meta = CheckpointMeta::read(dir.path()).unwrap();
    assert_eq!(meta.epoch, 3);
    assert_eq!(meta.loss, 1.25);
    assert!(meta.scheduler.is_none());
}
