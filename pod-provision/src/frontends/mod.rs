use std::path::Path;

use crate::{
    error::ProvisionError,
    models::{BuildSpec, PackageName},
    services::RecipeFrontend,
};

pub use dockerfile::DockerfileFrontend;
pub use provision_file::ProvisionFileFrontend;

mod dockerfile;
mod provision_file;

/// Picks the frontend from the recipe's file name, `.yml`/`.yaml` recipes are
/// provision files and everything else is read as a Dockerfile.
pub fn frontend_for(recipe_path: &Path) -> Box<dyn RecipeFrontend> {
    let extension = recipe_path.extension().and_then(|ext| ext.to_str());
    match extension {
        Some("yml") | Some("yaml") => Box::new(ProvisionFileFrontend::new()),
        _ => Box::new(DockerfileFrontend::new()),
    }
}

/// Checks the parts of a spec the engine and the package manager would
/// otherwise misread.
fn validate(spec: BuildSpec, recipe_path: &Path) -> Result<BuildSpec, ProvisionError> {
    let invalid = |reason: String| ProvisionError::Recipe {
        path: recipe_path.to_path_buf(),
        line: None,
        reason,
    };

    let base_image = &spec.base_image.0;
    if base_image.is_empty() {
        return Err(invalid("the base image is empty".into()));
    }
    if base_image.chars().any(char::is_whitespace) {
        return Err(invalid(format!(
            "the base image {:?} contains whitespace",
            base_image
        )));
    }

    for PackageName(package) in spec.packages.iter() {
        if package.is_empty() || package.chars().any(char::is_whitespace) {
            return Err(invalid(format!("invalid package name {:?}", package)));
        }
        if package.starts_with('-') {
            return Err(invalid(format!(
                "package name {:?} would be read as a flag",
                package
            )));
        }
    }

    Ok(spec)
}
