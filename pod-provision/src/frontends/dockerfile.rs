use anyhow::{Context, Result};
use log::{debug, warn};
use std::{
    collections::BTreeMap as Map,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    error::ProvisionError,
    models::{BuildSpec, ImageName, PackageManager, PackageName},
    services::RecipeFrontend,
};

/// Reads the subset of the Dockerfile format that describes a base image,
/// a system upgrade and a package install.
pub struct DockerfileFrontend;

impl DockerfileFrontend {
    pub fn new() -> DockerfileFrontend {
        DockerfileFrontend
    }

    pub fn parse(&self, recipe_path: &Path, source: &str) -> Result<BuildSpec, ProvisionError> {
        let mut parser = Parser {
            path: recipe_path.to_path_buf(),
            base_image: None,
            package_manager: None,
            upgrade: false,
            packages: Vec::new(),
            labels: Map::new(),
        };

        for line in logical_lines(source) {
            parser.instruction(&line)?;
        }

        parser.finish()
    }
}

impl RecipeFrontend for DockerfileFrontend {
    fn build_spec(&mut self, recipe_path: &Path) -> Result<BuildSpec> {
        let source = fs::read_to_string(recipe_path)
            .with_context(|| format!("failed to read recipe {:?}", recipe_path))?;

        let spec = self.parse(recipe_path, &source)?;
        Ok(super::validate(spec, recipe_path)?)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct LogicalLine {
    number: usize,
    text: String,
}

/// Joins backslash continuations and drops comments and blank lines, also
/// inside continuations. Each logical line keeps the number of its first
/// physical line.
fn logical_lines(source: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut current: Option<LogicalLine> = None;

    for (index, raw) in source.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (text, continues) = match trimmed.strip_suffix('\\') {
            Some(text) => (text.trim_end(), true),
            None => (trimmed, false),
        };

        let line = current.get_or_insert_with(|| LogicalLine {
            number: index + 1,
            text: String::new(),
        });
        if !text.is_empty() {
            if !line.text.is_empty() {
                line.text.push(' ');
            }
            line.text.push_str(text);
        }

        if !continues {
            lines.extend(current.take());
        }
    }

    lines.extend(current.take());
    lines
}

enum Action {
    Refresh,
    Upgrade,
    Install,
    Ignore,
}

fn action(manager: PackageManager, subcommand: &str) -> Option<Action> {
    match (manager, subcommand) {
        (PackageManager::Dnf, "upgrade")
        | (PackageManager::Dnf, "update")
        | (PackageManager::Dnf, "distro-sync")
        | (PackageManager::Yum, "upgrade")
        | (PackageManager::Yum, "update")
        | (PackageManager::AptGet, "upgrade")
        | (PackageManager::AptGet, "dist-upgrade")
        | (PackageManager::AptGet, "full-upgrade")
        | (PackageManager::Apk, "upgrade") => Some(Action::Upgrade),
        (PackageManager::Dnf, "install")
        | (PackageManager::Yum, "install")
        | (PackageManager::AptGet, "install")
        | (PackageManager::Apk, "add") => Some(Action::Install),
        (PackageManager::AptGet, "update") | (PackageManager::Apk, "update") => {
            Some(Action::Refresh)
        }
        (PackageManager::Dnf, "makecache")
        | (PackageManager::Dnf, "clean")
        | (PackageManager::Yum, "makecache")
        | (PackageManager::Yum, "clean")
        | (PackageManager::AptGet, "clean") => Some(Action::Ignore),
        _ => None,
    }
}

struct Parser {
    path: PathBuf,
    base_image: Option<ImageName>,
    package_manager: Option<PackageManager>,
    upgrade: bool,
    packages: Vec<PackageName>,
    labels: Map<String, String>,
}

impl Parser {
    fn error(&self, line: Option<usize>, reason: String) -> ProvisionError {
        ProvisionError::Recipe {
            path: self.path.clone(),
            line,
            reason,
        }
    }

    fn instruction(&mut self, line: &LogicalLine) -> Result<(), ProvisionError> {
        let mut parts = line.text.splitn(2, char::is_whitespace);
        let keyword = parts.next().unwrap_or_default().to_uppercase();
        let arguments = parts.next().unwrap_or_default().trim();

        match keyword.as_str() {
            "FROM" => self.from(line.number, arguments),
            "RUN" => self.run(line.number, arguments),
            "LABEL" => self.label(line.number, arguments),
            other => Err(self.error(
                Some(line.number),
                format!("unsupported instruction {}", other),
            )),
        }
    }

    fn from(&mut self, number: usize, arguments: &str) -> Result<(), ProvisionError> {
        if self.base_image.is_some() {
            return Err(self.error(
                Some(number),
                "multi-stage builds are not supported".into(),
            ));
        }

        let words = arguments
            .split_whitespace()
            .filter(|word| !word.starts_with("--"))
            .collect::<Vec<_>>();

        match words.as_slice() {
            [image] => self.set_base_image(image),
            [image, keyword, _] if keyword.eq_ignore_ascii_case("as") => {
                self.set_base_image(image)
            }
            _ => Err(self.error(
                Some(number),
                format!("expected `FROM image [AS name]`, found {:?}", arguments),
            )),
        }
    }

    fn set_base_image(&mut self, image: &str) -> Result<(), ProvisionError> {
        debug!("base image {}", image);
        self.base_image = Some(ImageName(image.into()));
        Ok(())
    }

    fn run(&mut self, number: usize, arguments: &str) -> Result<(), ProvisionError> {
        if self.base_image.is_none() {
            return Err(self.error(Some(number), "RUN before FROM".into()));
        }
        if arguments.starts_with('[') {
            return Err(self.error(
                Some(number),
                "exec form RUN instructions are not supported".into(),
            ));
        }

        if let Some(operator) = [";", "||"].iter().find(|op| arguments.contains(*op)) {
            return Err(self.error(
                Some(number),
                format!("shell operator `{}` is not supported, chain commands with &&", operator),
            ));
        }

        for command in arguments.split("&&").map(str::trim) {
            if command.is_empty() {
                continue;
            }
            self.command(number, command)?;
        }

        Ok(())
    }

    fn command(&mut self, number: usize, command: &str) -> Result<(), ProvisionError> {
        if let Some(word) = command.split_whitespace().find(|word| word.contains(SHELL_SYNTAX)) {
            return Err(self.error(
                Some(number),
                format!("shell syntax in `{}` is not supported", word),
            ));
        }

        let mut words = command.split_whitespace();
        let program = words.next().unwrap_or_default();

        let manager = PackageManager::from_name(program).ok_or_else(|| {
            self.error(
                Some(number),
                format!("unsupported command `{}`, only package managers can be run", program),
            )
        })?;

        match self.package_manager {
            Some(existing) if existing != manager => {
                return Err(self.error(
                    Some(number),
                    format!(
                        "recipe mixes package managers {} and {}",
                        existing.name(),
                        manager.name()
                    ),
                ));
            }
            _ => self.package_manager = Some(manager),
        }

        let mut arguments = words.filter(|word| !word.starts_with('-'));
        let subcommand = arguments.next().ok_or_else(|| {
            self.error(Some(number), format!("`{}` without a subcommand", command))
        })?;

        match action(manager, subcommand) {
            Some(Action::Upgrade) => {
                if !self.packages.is_empty() {
                    warn!(
                        "line {}: the upgrade will run before the packages installed earlier",
                        number
                    );
                }
                self.upgrade = true;
            }
            Some(Action::Install) => {
                let before = self.packages.len();
                self.packages
                    .extend(arguments.map(|package| PackageName(unquote(package).into())));
                if self.packages.len() == before {
                    return Err(self.error(
                        Some(number),
                        format!("`{}` names no packages", command),
                    ));
                }
            }
            Some(Action::Refresh) | Some(Action::Ignore) => {
                debug!("line {}: skipping `{}`", number, command);
            }
            None => {
                return Err(self.error(
                    Some(number),
                    format!("unsupported {} subcommand `{}`", manager.name(), subcommand),
                ));
            }
        }

        Ok(())
    }

    fn label(&mut self, number: usize, arguments: &str) -> Result<(), ProvisionError> {
        for word in split_quoted(arguments) {
            let mut pair = word.splitn(2, '=');
            match (pair.next(), pair.next()) {
                (Some(key), Some(value)) if !key.is_empty() => {
                    self.labels.insert(key.into(), value.into());
                }
                _ => {
                    return Err(self.error(
                        Some(number),
                        format!("expected `key=value` in LABEL, found {:?}", word),
                    ));
                }
            }
        }

        Ok(())
    }

    fn finish(self) -> Result<BuildSpec, ProvisionError> {
        let base_image = match self.base_image.clone() {
            Some(base_image) => base_image,
            None => return Err(self.error(None, "no FROM instruction".into())),
        };

        let package_manager = match self.package_manager.or_else(|| PackageManager::infer(&base_image)) {
            Some(package_manager) => package_manager,
            None => {
                return Err(self.error(
                    None,
                    format!("cannot tell which package manager {} uses", base_image),
                ))
            }
        };

        Ok(BuildSpec {
            base_image,
            packages: self.packages,
            upgrade: self.upgrade,
            package_manager,
            labels: self.labels,
        })
    }
}

/// Characters a package-manager argument never contains outside a shell
/// pipeline, redirection, expansion or background job.
const SHELL_SYNTAX: &[char] = &[';', '|', '&', '<', '>', '$', '`'];

fn unquote(word: &str) -> &str {
    for quote in &['\'', '"'] {
        if word.len() >= 2 && word.starts_with(*quote) && word.ends_with(*quote) {
            return &word[1..word.len() - 1];
        }
    }
    word
}

/// Splits on whitespace outside double quotes and removes the quotes.
fn split_quoted(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut quoted = false;

    for c in text.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !word.is_empty() {
                    words.push(std::mem::take(&mut word));
                }
            }
            c => word.push(c),
        }
    }

    if !word.is_empty() {
        words.push(word);
    }
    words
}
