use anyhow::Result;
use std::{collections::BTreeMap as Map, path::Path};

use crate::{
    models::{BuildSpec, ContainerId, Image, ImageConfig, ImageId, ImageName},
    package_manager::{CommandFailure, PackageCommand},
};

pub trait RecipeFrontend {
    fn build_spec(&mut self, recipe_path: &Path) -> Result<BuildSpec>;
}

pub trait ImageBackend {
    fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>>;

    /// Pulls `name`, failing with `ProvisionError::ImagePull` or
    /// `ProvisionError::Network`.
    fn pull_image(&mut self, name: &ImageName) -> Result<ImageId>;

    /// Creates and starts an idle container that commands can be executed in.
    fn create_working_container(&mut self, image: &ImageName) -> Result<ContainerId>;

    /// Runs `command` in the container. A command that runs but exits
    /// unsuccessfully is reported as `Ok(Err(_))` so the caller can classify it.
    fn exec(
        &mut self,
        container: &ContainerId,
        command: &PackageCommand,
    ) -> Result<std::result::Result<(), CommandFailure>>;

    fn commit_container(
        &mut self,
        container: &ContainerId,
        target: &ImageName,
        config: &ImageConfig,
        labels: &Map<String, String>,
    ) -> Result<ImageId>;

    fn remove_container(&mut self, container: &ContainerId) -> Result<ContainerId>;
}
