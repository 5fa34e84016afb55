use std::path::PathBuf;
use thiserror::Error;

use crate::models::{ImageName, PackageName, StepKind};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to pull base image {image}: {reason}")]
    ImagePull { image: ImageName, reason: String },

    #[error("could not resolve package(s) {}: {reason}", join(packages))]
    PackageResolution {
        packages: Vec<PackageName>,
        reason: String,
    },

    #[error("network failure during {step}: {reason}")]
    Network { step: StepKind, reason: String },

    #[error("{step} failed with exit code {}: {reason}", code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()))]
    StepFailed {
        step: StepKind,
        code: Option<i32>,
        reason: String,
    },

    #[error("invalid recipe {}{}: {reason}", path.display(), line.map(|l| format!(":{}", l)).unwrap_or_default())]
    Recipe {
        path: PathBuf,
        line: Option<usize>,
        reason: String,
    },
}

impl ProvisionError {
    /// Process exit code reported for this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::ImagePull { .. } => 2,
            ProvisionError::PackageResolution { .. } => 3,
            ProvisionError::Network { .. } => 4,
            ProvisionError::StepFailed { .. } => 5,
            ProvisionError::Recipe { .. } => 6,
        }
    }
}

fn join(packages: &[PackageName]) -> String {
    packages
        .iter()
        .map(|package| package.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
