use anyhow::{anyhow, bail, Result};
use log::{debug, info};
use serde::Deserialize;
use std::collections::BTreeMap as Map;

use crate::{
    backends::runner::{CommandOutput, CommandRunner, ProcessRunner},
    error::ProvisionError,
    models::{ContainerId, Image, ImageConfig, ImageId, ImageName, StepKind},
    package_manager::{is_network_failure, summarize, CommandFailure, PackageCommand},
    services::ImageBackend,
};

const LABEL_WORKING: &str = "io.podman.provision.working";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedImage {
    id: String,

    #[serde(default)]
    labels: Option<Map<String, String>>,

    #[serde(default)]
    size: u64,

    #[serde(default)]
    config: Option<InspectedConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
    #[serde(default)]
    cmd: Option<Vec<String>>,

    #[serde(default)]
    entrypoint: Option<Vec<String>>,
}

pub struct PodmanBackend {
    podman: String,
    runner: Box<dyn CommandRunner>,
}

impl PodmanBackend {
    /// Checks that `podman` can be run and returns a backend driving it.
    pub fn connect(podman: &str) -> Result<PodmanBackend> {
        let mut backend = PodmanBackend::with_runner(podman, ProcessRunner);

        let output = backend.podman(vec!["version", "--format", "{{.Client.Version}}"])?;
        if !output.success() {
            bail!(
                "{} is not usable: {}",
                podman,
                summarize(&output.stderr, &output.stdout)
            );
        }
        info!("podman version {}", output.stdout.trim());

        Ok(backend)
    }

    pub fn with_runner<R>(podman: &str, runner: R) -> PodmanBackend
    where
        R: 'static + CommandRunner,
    {
        PodmanBackend {
            podman: podman.into(),
            runner: Box::new(runner),
        }
    }

    fn podman<I, S>(&mut self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = args.into_iter().map(Into::into).collect::<Vec<String>>();
        self.runner.run(&self.podman, &args)
    }

    /// Runs a podman command that is expected to succeed.
    fn podman_checked<I, S>(&mut self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = args.into_iter().map(Into::into).collect::<Vec<String>>();
        let output = self.runner.run(&self.podman, &args)?;

        if !output.success() {
            return Err(anyhow!(
                "podman {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                summarize(&output.stderr, &output.stdout)
            ));
        }

        Ok(output)
    }
}

fn is_missing_image(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("image not known")
        || stderr.contains("no such image")
        || stderr.contains("failed to find image")
        || stderr.contains("unable to find")
}

fn last_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(String::from)
}

impl ImageBackend for PodmanBackend {
    fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>> {
        let output = self.podman(vec!["image", "inspect", name.0.as_str()])?;

        if !output.success() {
            if is_missing_image(&output.stderr) {
                return Ok(None);
            }
            bail!(
                "podman image inspect {} failed: {}",
                name,
                summarize(&output.stderr, &output.stdout)
            );
        }

        let mut inspected: Vec<InspectedImage> = serde_json::from_str(&output.stdout)?;
        let inspected = match inspected.pop() {
            Some(inspected) => inspected,
            None => return Ok(None),
        };

        let config = inspected.config.unwrap_or_default();

        Ok(Some(Image {
            id: ImageId(inspected.id),
            labels: inspected.labels.unwrap_or_else(Default::default),
            size: inspected.size,
            config: ImageConfig {
                cmd: config.cmd,
                entrypoint: config.entrypoint,
            },
        }))
    }

    fn pull_image(&mut self, name: &ImageName) -> Result<ImageId> {
        let output = self.podman(vec!["pull", "--quiet", name.0.as_str()])?;

        if !output.success() {
            let reason = summarize(&output.stderr, &output.stdout);
            if is_network_failure(&output.stderr) {
                return Err(ProvisionError::Network {
                    step: StepKind::Pull,
                    reason,
                }
                .into());
            }
            return Err(ProvisionError::ImagePull {
                image: name.clone(),
                reason,
            }
            .into());
        }

        let image_id = last_line(&output.stdout)
            .ok_or_else(|| anyhow!("podman pull {} printed no image id", name))?;
        Ok(ImageId(image_id))
    }

    fn create_working_container(&mut self, image: &ImageName) -> Result<ContainerId> {
        let label = format!("{}=true", LABEL_WORKING);
        let output = self.podman_checked(vec![
            "create",
            "--entrypoint",
            "sleep",
            "--label",
            label.as_str(),
            image.0.as_str(),
            "infinity",
        ])?;

        let container_id = last_line(&output.stdout)
            .ok_or_else(|| anyhow!("podman create printed no container id"))?;
        let container = ContainerId(container_id);

        self.podman_checked(vec!["start", container.0.as_str()])?;
        debug!("started working container {}", container.0);

        Ok(container)
    }

    fn exec(
        &mut self,
        container: &ContainerId,
        command: &PackageCommand,
    ) -> Result<std::result::Result<(), CommandFailure>> {
        let mut args = vec!["exec".to_string()];
        for (key, value) in command.env.iter() {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(container.0.clone());
        args.extend(command.argv.iter().cloned());

        let output = self.podman(args)?;
        if output.success() {
            return Ok(Ok(()));
        }

        Ok(Err(CommandFailure {
            code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        }))
    }

    fn commit_container(
        &mut self,
        container: &ContainerId,
        target: &ImageName,
        config: &ImageConfig,
        labels: &Map<String, String>,
    ) -> Result<ImageId> {
        let empty = Vec::new();
        let entrypoint = serde_json::to_string(config.entrypoint.as_ref().unwrap_or(&empty))?;
        let cmd = serde_json::to_string(config.cmd.as_ref().unwrap_or(&empty))?;

        let mut args = vec![
            "commit".to_string(),
            "--quiet".into(),
            "--change".into(),
            format!("ENTRYPOINT {}", entrypoint),
            "--change".into(),
            format!("CMD {}", cmd),
        ];
        for (key, value) in labels.iter() {
            args.push("--change".into());
            args.push(format!("LABEL {}={}", key, serde_json::to_string(value)?));
        }
        args.push(container.0.clone());
        args.push(target.0.clone());

        let output = self.podman_checked(args)?;
        let image_id = last_line(&output.stdout)
            .ok_or_else(|| anyhow!("podman commit printed no image id"))?;

        Ok(ImageId(image_id))
    }

    fn remove_container(&mut self, container: &ContainerId) -> Result<ContainerId> {
        self.podman_checked(vec!["rm", "--force", container.0.as_str()])?;
        Ok(container.clone())
    }
}
