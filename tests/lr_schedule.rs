// tests/lr_schedule.rs - Learning-rate policy precedence
use card_est_rs::cardest::error::CardEstError;
use card_est_rs::cardest::training::{LrPolicy, LrPolicyChoice};

fn everything() -> LrPolicyChoice {
    LrPolicyChoice {
        constant: Some(1e-3),
        warmup: Some((32, 100.0)),
        ..LrPolicyChoice::default()
    }
    .with_scheduler(Some("wd_0.05_0.1"), 1000)
    .unwrap()
}

#[test]
fn test_constant_wins_over_custom() {
    let policy = everything().resolve(1000).unwrap();
    assert!(matches!(policy, LrPolicy::Constant(lr) if lr == 1e-3));
    assert_eq!(policy.lr_at(1), 1e-3);
    assert_eq!(policy.lr_at(999), 1e-3);
}

#[test]
fn test_custom_wins_over_warmup() {
    let mut choice = everything();
    choice.constant = None;
    let policy = choice.resolve(1000).unwrap();
    assert!(matches!(policy, LrPolicy::Custom(_)));
    // Linear warmup over the first 100 steps towards 0.05.
    assert!((policy.lr_at(50) - 0.025).abs() < 1e-12);
}

#[test]
fn test_warmup_wins_over_stepped() {
    let choice = LrPolicyChoice {
        warmup: Some((32, 100.0)),
        ..LrPolicyChoice::default()
    }
    .with_scheduler(Some("CosineAnnealingLR"), 1000)
    .unwrap();
    let policy = choice.resolve(1000).unwrap();
    assert!(matches!(policy, LrPolicy::Warmup { d_model: 32, warmup_steps: 100 }));
    assert!(policy.stepped().is_none());
}

#[test]
fn test_stepped_scheduler_alone() {
    let policy = LrPolicyChoice::default()
        .with_scheduler(Some("OneCycleLR"), 1000)
        .unwrap()
        .resolve(1000)
        .unwrap();
    assert!(policy.stepped().is_some());
}

#[test]
fn test_no_policy_fails_fast() {
    assert!(matches!(
        LrPolicyChoice::default().resolve(10),
        Err(CardEstError::NoLearningRatePolicy)
    ));
}
