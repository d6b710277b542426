//! Test suite for the training pipeline: trainer steps, checkpoints and
//! end-to-end async training on tiny synthetic problems.

pub mod integration_tests;


pub use fixtures::TrainingTestFixture;
pub use test_utils::{
    assert_tensor_close, create_test_config, create_test_device, create_test_loader, tiny_architecture,
};
