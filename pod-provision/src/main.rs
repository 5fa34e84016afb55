use anyhow::{anyhow, Context, Result};
use crossterm::{
    cursor,
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use log::info;
use number_prefix::NumberPrefix;
use std::{
    env,
    io::{stdout, Write},
    path::{Path, PathBuf},
    process,
};
use structopt::StructOpt;

use backends::PodmanBackend;
use controller::Controller;
use error::ProvisionError;
use frontends::frontend_for;
use models::{BuildPolicy, ImageName, PullPolicy, Step};
use services::RecipeFrontend;

mod backends;
mod controller;
mod error;
mod frontends;
mod hasher;
mod models;
mod package_manager;
mod services;

/// Recipe file names looked up in the current directory and its parents.
const RECIPE_FILE_NAMES: &[&str] = &[
    "provision.yml",
    "provision.yaml",
    "Containerfile",
    "Dockerfile",
];

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pod-provision",
    about = "Builds container images from a base image, a system upgrade and a package list, using podman."
)]
struct Opt {
    #[structopt(short, long, parse(from_os_str))]
    /// Recipe to read. Defaults to the first recipe found in the current directory or its parents.
    file: Option<PathBuf>,

    #[structopt(long, env = "PODMAN", default_value = "podman")]
    /// Podman executable to drive.
    podman: String,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Pulls the base image, upgrades it, installs the packages and commits the result.
    Build {
        #[structopt(short, long)]
        /// Name of the resulting image.
        tag: Option<String>,

        #[structopt(long)]
        /// Pull the base image even if it is present.
        pull: bool,

        #[structopt(long)]
        /// Build even if the image was already built from the same recipe.
        force: bool,
    },
    /// Prints the steps and commands a build would run.
    Plan {
        #[structopt(short, long)]
        tag: Option<String>,
    },
    /// Prints the parsed recipe as JSON.
    Inspect,
}

fn find_recipe<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    for path in path.as_ref().ancestors() {
        for file_name in RECIPE_FILE_NAMES {
            let recipe_path = path.join(file_name);
            if recipe_path.exists() {
                return Some(recipe_path);
            }
        }
    }

    None
}

/// Image names are lowercase, so the project name is folded into the
/// characters a repository name allows.
fn default_tag(project_name: &str) -> ImageName {
    let repository = project_name
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '-',
        })
        .collect::<String>();
    let repository = repository.trim_matches(|c| c == '.' || c == '_' || c == '-');
    let repository = if repository.is_empty() {
        "provisioned"
    } else {
        repository
    };

    ImageName(format!("localhost/{}:latest", repository))
}

fn describe(step: &Step) -> String {
    let join = |packages: &[models::PackageName]| {
        packages
            .iter()
            .map(|package| package.0.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    };

    match step {
        Step::Pull(name) => format!("Pulling {}", name),
        Step::Upgrade => "Upgrading system packages".into(),
        Step::Install(packages) => format!("Installing {}", join(packages)),
        Step::Verify(packages) => format!("Verifying {}", join(packages)),
        Step::Commit(name) => format!("Committing {}", name),
    }
}

fn main() {
    pretty_env_logger::init_custom_env("LOG");

    let opt = Opt::from_args();

    if let Err(err) = run(opt) {
        eprintln!("{} {:#}", "ERROR:".red().bold(), err);

        let code = err
            .downcast_ref::<ProvisionError>()
            .map(ProvisionError::exit_code)
            .unwrap_or(1);
        process::exit(code);
    }
}

fn run(opt: Opt) -> Result<()> {
    let mut stdout = stdout();

    let recipe_path = match opt.file {
        Some(path) => path,
        None => {
            let current_dir = env::current_dir()?;
            find_recipe(current_dir).ok_or_else(|| {
                anyhow!(
                    "Couldn't find a recipe ({}) in the current working directory or any of its parents.",
                    RECIPE_FILE_NAMES.join(", ")
                )
            })?
        }
    };
    let recipe_path = recipe_path
        .canonicalize()
        .with_context(|| format!("failed to find recipe {:?}", recipe_path))?;
    info!("found recipe {:?}", recipe_path);

    let project_name = recipe_path
        .parent()
        .and_then(|path| path.file_name())
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("Couldn't determine the project name."))?;
    info!("project name {:?}", project_name);

    let spec = frontend_for(&recipe_path).build_spec(&recipe_path)?;
    info!("parsed recipe");

    let target = |tag: Option<String>| tag.map(ImageName).unwrap_or_else(|| default_tag(project_name));

    match opt.command {
        Command::Inspect => {
            serde_json::to_writer_pretty(&mut stdout, &spec)?;
            writeln!(stdout)?;
        }
        Command::Plan { tag } => {
            let target = target(tag);
            for (step, commands) in controller::planned_commands(&spec, &target) {
                writeln!(stdout, "{}", describe(&step))?;
                for command in commands {
                    writeln!(stdout, "    {}", command)?;
                }
            }
        }
        Command::Build { tag, pull, force } => {
            let target = target(tag);

            let pull_policy = if pull {
                PullPolicy::Always
            } else {
                PullPolicy::IfNotPresent
            };
            let build_policy = if force {
                BuildPolicy::Always
            } else {
                BuildPolicy::IfChanged
            };

            let backend = PodmanBackend::connect(&opt.podman)?;
            info!("connected to podman");

            let mut controller = Controller::init(target.clone(), backend, spec);
            info!("created controller");

            if build_policy == BuildPolicy::IfChanged && controller.is_up_to_date()? {
                stdout
                    .queue(style::PrintStyledContent("INFO: ".cyan().bold()))?
                    .queue(style::Print(format!(
                        "{} is up to date, rerun with --force to rebuild.\n",
                        target
                    )))?
                    .flush()?;
                return Ok(());
            }

            build(&mut controller, &mut stdout, &target, pull_policy)?;
        }
    }

    Ok(())
}

fn build(
    controller: &mut Controller,
    stdout: &mut impl Write,
    target: &ImageName,
    pull_policy: PullPolicy,
) -> Result<()> {
    let steps = controller.plan();
    let lines = steps.iter().map(describe).collect::<Vec<_>>();

    let longest_line = lines.iter().map(|line| line.len()).max().unwrap_or(0);

    for line in lines.iter() {
        stdout.queue(style::Print(line))?;

        let padding = longest_line - line.len() + 1;
        stdout
            .queue(cursor::MoveRight(padding as u16))?
            .queue(style::Print("...\n"))?;
    }

    stdout.flush()?;

    let mut mark = |line: usize, status: style::StyledContent<&'static str>| -> Result<()> {
        stdout
            .queue(cursor::SavePosition)?
            .queue(cursor::MoveToPreviousLine((lines.len() - line) as u16))?
            .queue(cursor::MoveRight(longest_line as u16 + 5))?
            .queue(style::PrintStyledContent(status))?
            .queue(cursor::RestorePosition)?
            .flush()?;
        Ok(())
    };

    let mut completed = 0;
    let result = controller.build(pull_policy, |line, _step| {
        completed = line + 1;
        mark(line, "done".green().bold())
    });

    let image_id = match result {
        Ok(image_id) => image_id,
        Err(err) => {
            if completed < lines.len() {
                mark(completed, "failed".red().bold())?;
            }
            return Err(err);
        }
    };

    let short_id = image_id.0.chars().take(12).collect::<String>();
    match controller.image_size(target)? {
        Some(size) => match NumberPrefix::binary(size as f64) {
            NumberPrefix::Standalone(bytes) => {
                writeln!(stdout, "Built {} ({}, {} bytes)", target, short_id, bytes)?
            }
            NumberPrefix::Prefixed(prefix, n) => {
                writeln!(stdout, "Built {} ({}, {:.1} {}B)", target, short_id, n, prefix)?
            }
        },
        None => writeln!(stdout, "Built {} ({})", target, short_id)?,
    }

    Ok(())
}
