use anyhow::{anyhow, bail, Result};
use log::{info, warn};

use crate::{
    hasher::spec_digest,
    models::{
        BuildSpec, ContainerId, Image, ImageId, ImageName, PackageName, PullPolicy, Step, StepKind,
    },
    package_manager::PackageCommand,
    services::ImageBackend,
};

pub const LABEL_HASH: &str = "io.podman.provision.hash";
pub const LABEL_BASE: &str = "io.podman.provision.base";

/// The ordered steps a build of `spec` goes through.
pub fn plan(spec: &BuildSpec, target: &ImageName) -> Vec<Step> {
    let mut steps = vec![Step::Pull(spec.base_image.clone())];

    if spec.upgrade {
        steps.push(Step::Upgrade);
    }

    if !spec.packages.is_empty() {
        steps.push(Step::Install(spec.packages.clone()));
        steps.push(Step::Verify(spec.packages.clone()));
    }

    steps.push(Step::Commit(target.clone()));
    steps
}

/// Steps paired with the commands they run inside the working container.
pub fn planned_commands(spec: &BuildSpec, target: &ImageName) -> Vec<(Step, Vec<PackageCommand>)> {
    let mut refreshed = false;
    plan(spec, target)
        .into_iter()
        .map(|step| {
            let commands = commands(spec, &step, refreshed);
            refreshed |= matches!(step, Step::Upgrade | Step::Install(_));
            (step, commands)
        })
        .collect()
}

/// Commands `step` runs. The package index is refreshed by the first step
/// that upgrades or installs.
fn commands(spec: &BuildSpec, step: &Step, refreshed: bool) -> Vec<PackageCommand> {
    let manager = spec.package_manager;
    let refresh = if refreshed {
        None
    } else {
        manager.refresh_command()
    };

    match step {
        Step::Upgrade => refresh
            .into_iter()
            .chain(Some(manager.upgrade_command()))
            .collect(),
        Step::Install(packages) => refresh
            .into_iter()
            .chain(Some(manager.install_command(packages)))
            .collect(),
        Step::Verify(packages) => vec![manager.verify_command(packages)],
        Step::Pull(_) | Step::Commit(_) => Vec::new(),
    }
}

pub struct Controller {
    backend: Box<dyn ImageBackend>,
    spec: BuildSpec,
    target: ImageName,
    digest: String,
    base: Option<Image>,
    container: Option<ContainerId>,
    refreshed: bool,
    upgraded: bool,
    installed: bool,
}

impl Controller {
    pub fn init<B>(target: ImageName, backend: B, spec: BuildSpec) -> Controller
    where
        B: 'static + ImageBackend,
    {
        let digest = spec_digest(&spec);

        Controller {
            backend: Box::new(backend),
            spec,
            target,
            digest,
            base: None,
            container: None,
            refreshed: false,
            upgraded: false,
            installed: false,
        }
    }

    pub fn plan(&self) -> Vec<Step> {
        plan(&self.spec, &self.target)
    }

    /// Whether the target image was already built from an identical spec.
    pub fn is_up_to_date(&mut self) -> Result<bool> {
        let image = self.backend.get_image(&self.target)?;

        let up_to_date = image
            .and_then(|image| image.labels.get(LABEL_HASH).cloned())
            .map(|hash| hash == self.digest)
            .unwrap_or(false);

        info!("image {} up to date: {}", self.target, up_to_date);
        Ok(up_to_date)
    }

    /// Runs every step in order, calling `on_done` after each one. On failure
    /// the working container is removed and no image is committed.
    pub fn build<F>(&mut self, pull_policy: PullPolicy, mut on_done: F) -> Result<ImageId>
    where
        F: FnMut(usize, &Step) -> Result<()>,
    {
        let mut image_id = None;

        let steps = self.plan();
        for (index, step) in steps.iter().enumerate() {
            let applied = self.apply(step, pull_policy).and_then(|committed| {
                on_done(index, step)?;
                Ok(committed)
            });

            match applied {
                Ok(committed) => image_id = committed.or(image_id),
                Err(err) => {
                    if let Err(cleanup) = self.abort() {
                        warn!("failed to remove the working container: {:#}", cleanup);
                    }
                    return Err(err);
                }
            }
        }

        image_id.ok_or_else(|| anyhow!("the build finished without committing an image"))
    }

    /// Applies a single step. Only `Commit` produces an image id.
    pub fn apply(&mut self, step: &Step, pull_policy: PullPolicy) -> Result<Option<ImageId>> {
        match step {
            Step::Pull(name) => {
                self.pull(name, pull_policy)?;
                Ok(None)
            }
            Step::Upgrade => {
                self.exec(step, &[])?;
                self.upgraded = true;
                Ok(None)
            }
            Step::Install(packages) => {
                if self.spec.upgrade && !self.upgraded {
                    bail!("packages cannot be installed before the upgrade completes");
                }
                self.exec(step, packages)?;
                self.installed = true;
                Ok(None)
            }
            Step::Verify(packages) => {
                if !self.installed {
                    bail!("packages cannot be verified before they are installed");
                }
                self.exec(step, packages)?;
                Ok(None)
            }
            Step::Commit(target) => self.commit(target).map(Some),
        }
    }

    fn pull(&mut self, name: &ImageName, pull_policy: PullPolicy) -> Result<()> {
        let existing = match pull_policy {
            PullPolicy::IfNotPresent => self.backend.get_image(name)?,
            PullPolicy::Always => None,
        };

        let image = match existing {
            Some(image) => {
                info!("base image {} is present as {}", name, image.id.0);
                image
            }
            None => {
                let image_id = self.backend.pull_image(name)?;
                info!("pulled base image {} as {}", name, image_id.0);
                self.backend
                    .get_image(name)?
                    .ok_or_else(|| anyhow!("pulled image {} is not in local storage", name))?
            }
        };

        self.base = Some(image);
        Ok(())
    }

    fn working_container(&mut self) -> Result<ContainerId> {
        if let Some(container) = &self.container {
            return Ok(container.clone());
        }

        if self.base.is_none() {
            bail!("the base image {} has not been pulled", self.spec.base_image);
        }

        let container = self.backend.create_working_container(&self.spec.base_image)?;
        info!("created working container {}", container.0);
        self.container = Some(container.clone());

        Ok(container)
    }

    fn exec(&mut self, step: &Step, packages: &[PackageName]) -> Result<()> {
        let container = self.working_container()?;
        let manager = self.spec.package_manager;

        for command in commands(&self.spec, step, self.refreshed) {
            info!("running {}", command);
            if let Err(failure) = self.backend.exec(&container, &command)? {
                return Err(manager.classify_failure(step.kind(), packages, &failure).into());
            }
        }

        if step.kind() != StepKind::Verify {
            self.refreshed = true;
        }

        Ok(())
    }

    fn commit(&mut self, target: &ImageName) -> Result<ImageId> {
        let container = self.working_container()?;
        let config = self
            .base
            .as_ref()
            .map(|base| base.config.clone())
            .unwrap_or_default();

        let mut labels = self.spec.labels.clone();
        labels.insert(LABEL_HASH.into(), self.digest.clone());
        labels.insert(LABEL_BASE.into(), self.spec.base_image.0.clone());

        let image_id = self
            .backend
            .commit_container(&container, target, &config, &labels)?;
        info!("committed {} as {}", target, image_id.0);

        // The image exists from here on, a leftover container does not fail the build.
        if let Err(err) = self.abort() {
            warn!("failed to remove the working container: {:#}", err);
        }
        Ok(image_id)
    }

    /// Removes the working container if there is one.
    pub fn abort(&mut self) -> Result<()> {
        if let Some(container) = self.container.take() {
            self.backend.remove_container(&container)?;
            info!("removed working container {}", container.0);
        }

        Ok(())
    }

    /// The committed image's size, if the engine reports it.
    pub fn image_size(&mut self, target: &ImageName) -> Result<Option<u64>> {
        Ok(self.backend.get_image(target)?.map(|image| image.size))
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Err(err) = self.abort() {
            warn!("failed to remove the working container: {:#}", err);
        }
    }
}
