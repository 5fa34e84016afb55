use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::BTreeMap as Map, fs, path::Path};

use crate::{
    error::ProvisionError,
    models::{BuildSpec, ImageName, PackageManager, PackageName},
    services::RecipeFrontend,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProvisionFile {
    pub base_image: String,

    #[serde(default = "upgrade_by_default")]
    pub upgrade: bool,

    pub package_manager: Option<String>,

    #[serde(default)]
    pub packages: Vec<String>,

    #[serde(default)]
    pub labels: Map<String, String>,
}

fn upgrade_by_default() -> bool {
    true
}

pub struct ProvisionFileFrontend;

impl ProvisionFileFrontend {
    pub fn new() -> ProvisionFileFrontend {
        ProvisionFileFrontend
    }

    fn to_spec(&self, recipe_path: &Path, file: ProvisionFile) -> Result<BuildSpec, ProvisionError> {
        let base_image = ImageName(file.base_image);

        let package_manager = match file.package_manager {
            Some(name) => PackageManager::from_name(&name).ok_or_else(|| ProvisionError::Recipe {
                path: recipe_path.to_path_buf(),
                line: None,
                reason: format!("unknown package manager {:?}", name),
            })?,
            None => PackageManager::infer(&base_image).ok_or_else(|| ProvisionError::Recipe {
                path: recipe_path.to_path_buf(),
                line: None,
                reason: format!(
                    "cannot tell which package manager {} uses, set package_manager",
                    base_image
                ),
            })?,
        };

        Ok(BuildSpec {
            base_image,
            packages: file.packages.into_iter().map(PackageName).collect(),
            upgrade: file.upgrade,
            package_manager,
            labels: file.labels,
        })
    }

    pub fn parse(&self, recipe_path: &Path, source: &str) -> Result<BuildSpec> {
        let file: ProvisionFile = serde_yaml::from_str(source).map_err(|err| ProvisionError::Recipe {
            path: recipe_path.to_path_buf(),
            line: err.location().map(|location| location.line()),
            reason: err.to_string(),
        })?;

        let spec = self.to_spec(recipe_path, file)?;
        Ok(super::validate(spec, recipe_path)?)
    }
}

impl RecipeFrontend for ProvisionFileFrontend {
    fn build_spec(&mut self, recipe_path: &Path) -> Result<BuildSpec> {
        let source = fs::read_to_string(recipe_path)
            .with_context(|| format!("failed to read recipe {:?}", recipe_path))?;

        self.parse(recipe_path, &source)
    }
}
