//! End-to-end integration tests for the training pipeline

use anyhow::Result;
use tokio::sync::mpsc;

use crate::discriminator::LatentRegularizer;
use crate::training::checkpoints::CheckpointManager;
use crate::training::{TrainingEvent, TrainingStatus};

use super::fixtures::TrainingTestFixture;

#[tokio::test]
async fn test_full_training_loop() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = fixture.create_trainer()?.with_event_monitoring(tx);

    let result = trainer.train().await?;
    assert!(result.success, "{:?}", result.error_message);
    // 2 epochs of 2 batches
    assert_eq!(result.total_steps, 4);
    assert_eq!(result.final_state.status, TrainingStatus::Completed);
    assert!(result.final_eval.is_some());
    let recorded_evaluations = trainer.metrics().evaluations().len();
    drop(trainer);

    let mut steps = 0;
    let mut evaluations = Vec::new();
    let mut checkpoints = 0;
    let mut completed = false;
    while let Some(event) = rx.recv().await {
        match event {
            TrainingEvent::StepCompleted { .. } => steps += 1,
            TrainingEvent::EvaluationCompleted { step, .. } => evaluations.push(step),
            TrainingEvent::CheckpointSaved { .. } => checkpoints += 1,
            TrainingEvent::TrainingCompleted { total_steps } => {
                assert_eq!(total_steps, 4);
                completed = true;
            }
            TrainingEvent::Error { error } => panic!("training error: {}", error),
            _ => {}
        }
    }
    assert_eq!(steps, 4);
    // epochs end on eval_interval (2) steps, so each step is evaluated once
    assert_eq!(evaluations, vec![2, 4]);
    assert_eq!(recorded_evaluations, 2);
    assert!(checkpoints >= 1);
    assert!(completed);

    let manager = CheckpointManager::new(&fixture.config.training.checkpoint.output_dir, 3)?;
    assert!(manager.latest()?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_max_steps_stops_training() -> Result<()> {
    let mut fixture = TrainingTestFixture::new()?.with_regularizer(LatentRegularizer::Gan);
    fixture.config.training.max_steps = Some(3);
    fixture.config.training.epochs = 10;
    let mut trainer = fixture.create_trainer()?;

    let result = trainer.train().await?;
    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.total_steps, 3);
    assert_eq!(result.final_state.status, TrainingStatus::StepLimitReached);
    assert_eq!(trainer.metrics().history().count(), 3);
    Ok(())
}

#[tokio::test]
async fn test_resume_continues_from_checkpoint_step() -> Result<()> {
    let mut fixture = TrainingTestFixture::new()?;
    fixture.config.training.max_steps = Some(2);
    let mut first = fixture.create_trainer()?;
    first.train().await?;
    let path = first.save_checkpoint(None)?;
    assert_eq!(first.state().global_step, 2);

    fixture.config.training.max_steps = Some(3);
    fixture.config.training.resume_from = Some(path);
    let mut resumed = fixture.create_trainer()?;
    let result = resumed.train().await?;
    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.total_steps, 3);
    assert_eq!(resumed.metrics().history().count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_resume_mid_epoch_trains_only_the_remaining_batches() -> Result<()> {
    let mut fixture = TrainingTestFixture::new()?;
    fixture.config.training.max_steps = Some(1);
    let mut first = fixture.create_trainer()?;
    first.train().await?;
    let path = first.save_checkpoint(None)?;
    assert_eq!(first.state().batch_in_epoch, 1);

    // 2 epochs x 2 batches, one of which is already done
    fixture.config.training.max_steps = None;
    fixture.config.training.resume_from = Some(path);
    let mut resumed = fixture.create_trainer()?;
    let result = resumed.train().await?;
    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.total_steps, 4);
    assert_eq!(resumed.metrics().history().count(), 3);
    assert_eq!(result.final_state.status, TrainingStatus::Completed);
    Ok(())
}
