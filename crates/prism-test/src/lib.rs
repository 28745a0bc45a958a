//! Test harness for the Prism ray tracing core.
//!
//! Provides a software implementation of the device collaborator traits that
//! executes recorded builds on the CPU, plus scene fixtures.

pub mod fixtures;
pub mod mock;

pub use fixtures::{hit_record_arguments, quad_mesh, simple_shader_set, triangle_mesh, SceneFixture};
pub use mock::{Command, Hit, MockCommandList, MockDevice, MockProperties};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    /// A command read a structure before a barrier made its build visible.
    #[error("Barrier hazard: {0}")]
    Hazard(String),
    /// A command violated a size or usage requirement.
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Core(#[from] prism_core::Error),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Install a test-writer subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
