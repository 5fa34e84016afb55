use serde::Serialize;
use std::{collections::BTreeMap as Map, fmt};

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize)]
pub struct ImageName(pub String);

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ImageName {
    /// The repository part of the reference, without registry, namespace or tag.
    /// `registry.fedoraproject.org/fedora:29` becomes `fedora`.
    pub fn repository(&self) -> &str {
        let without_digest = self.0.split('@').next().unwrap_or(&self.0);
        let last = without_digest.rsplit('/').next().unwrap_or(without_digest);
        last.split(':').next().unwrap_or(last)
    }
}

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize)]
pub struct PackageName(pub String);

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageManager {
    Dnf,
    Yum,
    AptGet,
    Apk,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct Image {
    pub id: ImageId,
    pub labels: Map<String, String>,
    pub size: u64,
    pub config: ImageConfig,
}

/// Everything a recipe declares. Packages keep the order and the
/// duplicates they were written with.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize)]
pub struct BuildSpec {
    pub base_image: ImageName,
    pub packages: Vec<PackageName>,
    pub upgrade: bool,
    pub package_manager: PackageManager,
    pub labels: Map<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Pull(ImageName),
    Upgrade,
    Install(Vec<PackageName>),
    Verify(Vec<PackageName>),
    Commit(ImageName),
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Pull(_) => StepKind::Pull,
            Step::Upgrade => StepKind::Upgrade,
            Step::Install(_) => StepKind::Install,
            Step::Verify(_) => StepKind::Verify,
            Step::Commit(_) => StepKind::Commit,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepKind {
    Pull,
    Upgrade,
    Install,
    Verify,
    Commit,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepKind::Pull => "pull",
            StepKind::Upgrade => "upgrade",
            StepKind::Install => "install",
            StepKind::Verify => "verify",
            StepKind::Commit => "commit",
        };
        f.write_str(name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildPolicy {
    Always,
    IfChanged,
}
