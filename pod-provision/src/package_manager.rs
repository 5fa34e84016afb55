//! Command lines and failure diagnostics for the package managers a recipe
//! can drive.

use std::fmt;

use crate::{
    error::ProvisionError,
    models::{ImageName, PackageManager, PackageName, StepKind},
};

/// A command to run inside the working container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageCommand {
    pub env: Vec<(String, String)>,
    pub argv: Vec<String>,
}

impl PackageCommand {
    fn new<I, S>(manager: PackageManager, argv: I) -> PackageCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let env = match manager {
            PackageManager::AptGet => vec![("DEBIAN_FRONTEND".into(), "noninteractive".into())],
            _ => Vec::new(),
        };

        PackageCommand {
            env,
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for PackageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.env.iter() {
            write!(f, "{}={} ", key, value)?;
        }
        f.write_str(&self.argv.join(" "))
    }
}

/// Captured result of a command that exited unsuccessfully.
#[derive(Clone, Debug, Default)]
pub struct CommandFailure {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

const NETWORK_MARKERS: &[&str] = &[
    "could not resolve host",
    "temporary failure in name resolution",
    "temporary failure resolving",
    "failed to download metadata",
    "cannot download repomd.xml",
    "curl error",
    "failed to fetch",
    "connection timed out",
    "connection refused",
    "connection reset",
    "network is unreachable",
    "no route to host",
    "i/o timeout",
    "tls handshake timeout",
    "temporary error",
];

const RESOLUTION_MARKERS: &[&str] = &[
    "no match for argument",
    "unable to find a match",
    "unable to locate package",
    "has no installation candidate",
    "unable to select packages",
    "is not installed",
    "nothing provides",
    "no package",
];

/// dpkg only knows real packages, so names it does not find are looked up
/// in the Provides of everything installed.
const APT_VERIFY_SCRIPT: &str = r#"for p; do dpkg -s "$p" >/dev/null 2>&1 || dpkg-query -W -f '${Provides}\n' | tr ',' '\n' | awk '{print $1}' | grep -Fqx "$p" || { echo "package $p is not installed" >&2; exit 1; }; done"#;

/// Whether the output of a failed command points at a connectivity problem.
pub fn is_network_failure(output: &str) -> bool {
    let output = output.to_lowercase();
    NETWORK_MARKERS.iter().any(|marker| output.contains(marker))
}

impl PackageManager {
    pub fn from_name(name: &str) -> Option<PackageManager> {
        match name {
            "dnf" | "microdnf" => Some(PackageManager::Dnf),
            "yum" => Some(PackageManager::Yum),
            "apt-get" | "apt" => Some(PackageManager::AptGet),
            "apk" => Some(PackageManager::Apk),
            _ => None,
        }
    }

    /// Guesses the package manager from the base image's repository name.
    pub fn infer(image: &ImageName) -> Option<PackageManager> {
        match image.repository() {
            "fedora" | "rockylinux" | "almalinux" | "ubi8" | "ubi9" | "rhel" | "centos-stream" => {
                Some(PackageManager::Dnf)
            }
            "centos" | "amazonlinux" => Some(PackageManager::Yum),
            "debian" | "ubuntu" => Some(PackageManager::AptGet),
            "alpine" => Some(PackageManager::Apk),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::AptGet => "apt-get",
            PackageManager::Apk => "apk",
        }
    }

    /// Index refresh, needed once before the first upgrade or install.
    pub fn refresh_command(self) -> Option<PackageCommand> {
        match self {
            PackageManager::Dnf | PackageManager::Yum => None,
            PackageManager::AptGet => Some(PackageCommand::new(self, vec!["apt-get", "update"])),
            PackageManager::Apk => Some(PackageCommand::new(self, vec!["apk", "update"])),
        }
    }

    pub fn upgrade_command(self) -> PackageCommand {
        let argv = match self {
            PackageManager::Dnf => vec!["dnf", "-y", "upgrade"],
            PackageManager::Yum => vec!["yum", "-y", "upgrade"],
            PackageManager::AptGet => vec!["apt-get", "-y", "upgrade"],
            PackageManager::Apk => vec!["apk", "upgrade"],
        };
        PackageCommand::new(self, argv)
    }

    pub fn install_command(self, packages: &[PackageName]) -> PackageCommand {
        let prefix = match self {
            PackageManager::Dnf => vec!["dnf", "-y", "install"],
            PackageManager::Yum => vec!["yum", "-y", "install"],
            PackageManager::AptGet => vec!["apt-get", "-y", "install"],
            PackageManager::Apk => vec!["apk", "add"],
        };
        let argv = prefix
            .into_iter()
            .map(String::from)
            .chain(packages.iter().map(|package| package.0.clone()));
        PackageCommand::new(self, argv)
    }

    /// Checks that every package is installed. Arguments that name a
    /// capability, a file or a virtual package count as installed when an
    /// installed package provides them.
    pub fn verify_command(self, packages: &[PackageName]) -> PackageCommand {
        let prefix = match self {
            PackageManager::Dnf | PackageManager::Yum => vec!["rpm", "-q", "--whatprovides"],
            PackageManager::AptGet => vec!["sh", "-c", APT_VERIFY_SCRIPT, "verify"],
            PackageManager::Apk => vec!["apk", "info", "-e"],
        };
        let argv = prefix
            .into_iter()
            .map(String::from)
            .chain(packages.iter().map(|package| self.installed_name(package)));
        PackageCommand::new(self, argv)
    }

    /// The name a package is installed under, without the version, release
    /// or architecture qualifiers the install command accepts.
    fn installed_name(self, package: &PackageName) -> String {
        let name = package.0.as_str();
        let name = match self {
            PackageManager::Dnf | PackageManager::Yum => name,
            PackageManager::AptGet => name
                .split(|c: char| c == '=' || c == '/')
                .next()
                .unwrap_or(name)
                .split(':')
                .next()
                .unwrap_or(name),
            PackageManager::Apk => name
                .split(|c: char| c == '=' || c == '<' || c == '>' || c == '~')
                .next()
                .unwrap_or(name),
        };
        name.into()
    }

    /// Turns a failed upgrade, install or verify command into an error of
    /// the right kind.
    pub fn classify_failure(
        self,
        step: StepKind,
        requested: &[PackageName],
        failure: &CommandFailure,
    ) -> ProvisionError {
        let output = format!("{}\n{}", failure.stderr, failure.stdout);
        let reason = summarize(&failure.stderr, &failure.stdout);

        if is_network_failure(&output) {
            return ProvisionError::Network { step, reason };
        }

        let resolves_packages = step == StepKind::Install || step == StepKind::Verify;
        let lowered = output.to_lowercase();
        if resolves_packages && RESOLUTION_MARKERS.iter().any(|m| lowered.contains(m)) {
            let mut packages = missing_packages(&output, requested);
            if packages.is_empty() {
                packages = requested.to_vec();
            }
            return ProvisionError::PackageResolution { packages, reason };
        }

        ProvisionError::StepFailed {
            step,
            code: failure.code,
            reason,
        }
    }
}

/// Requested packages the output names as missing, in request order.
fn missing_packages(output: &str, requested: &[PackageName]) -> Vec<PackageName> {
    let mut missing: Vec<PackageName> = Vec::new();

    for line in output.lines() {
        let lowered = line.to_lowercase();
        if !RESOLUTION_MARKERS.iter().any(|m| lowered.contains(m)) {
            continue;
        }

        let words = line
            .split(|c: char| c.is_whitespace() || c == ':' || c == '\'' || c == '"' || c == ',')
            .filter(|word| !word.is_empty())
            .collect::<Vec<_>>();

        for package in requested {
            if words.contains(&package.0.as_str()) && !missing.contains(package) {
                missing.push(package.clone());
            }
        }
    }

    missing.sort_by_key(|package| requested.iter().position(|r| r == package));
    missing
}

/// The last meaningful line of a failed command's output.
pub fn summarize(stderr: &str, stdout: &str) -> String {
    let last = |text: &str| {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(String::from)
    };

    let resolution_line = |text: &str| {
        text.lines()
            .map(str::trim)
            .find(|line| {
                let lowered = line.to_lowercase();
                RESOLUTION_MARKERS.iter().any(|m| lowered.contains(m))
            })
            .map(String::from)
    };

    resolution_line(stderr)
        .or_else(|| resolution_line(stdout))
        .or_else(|| last(stderr))
        .or_else(|| last(stdout))
        .unwrap_or_else(|| "no output".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packages(names: &[&str]) -> Vec<PackageName> {
        names.iter().map(|name| PackageName((*name).into())).collect()
    }

    fn failure(code: i32, stderr: &str) -> CommandFailure {
        CommandFailure {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn install_keeps_listing_order_and_duplicates() {
        let command =
            PackageManager::Dnf.install_command(&packages(&["iproute", "nodejs", "git", "git"]));
        assert_eq!(
            command.argv,
            vec!["dnf", "-y", "install", "iproute", "nodejs", "git", "git"]
        );
        assert!(command.env.is_empty());
    }

    #[test]
    fn apt_runs_noninteractive() {
        let command = PackageManager::AptGet.upgrade_command();
        assert_eq!(command.to_string(), "DEBIAN_FRONTEND=noninteractive apt-get -y upgrade");
        assert!(PackageManager::AptGet.refresh_command().is_some());
        assert!(PackageManager::Dnf.refresh_command().is_none());
    }

    #[test]
    fn rpm_verification_accepts_capabilities_and_files() {
        let command = PackageManager::Dnf
            .verify_command(&packages(&["git", "dnf-command(config-manager)", "/usr/bin/ip"]));
        assert_eq!(
            command.argv,
            vec![
                "rpm",
                "-q",
                "--whatprovides",
                "git",
                "dnf-command(config-manager)",
                "/usr/bin/ip"
            ]
        );
    }

    #[test]
    fn apt_verification_strips_qualifiers_and_checks_provides() {
        let command = PackageManager::AptGet.verify_command(&packages(&[
            "curl=7.68.0-1ubuntu2",
            "git/bullseye-backports",
            "libc6:amd64",
            "mail-transport-agent",
        ]));

        assert_eq!(&command.argv[..2], &["sh", "-c"]);
        assert!(command.argv[2].contains("${Provides}"));
        assert_eq!(
            &command.argv[3..],
            &["verify", "curl", "git", "libc6", "mail-transport-agent"]
        );
    }

    #[test]
    fn apk_verification_drops_version_constraints() {
        let command =
            PackageManager::Apk.verify_command(&packages(&["bash=5.2.15-r5", "git>2.40", "curl"]));
        assert_eq!(command.argv, vec!["apk", "info", "-e", "bash", "git", "curl"]);
    }

    #[test]
    fn missing_providers_are_resolution_errors() {
        let requested = packages(&["dnf-command(config-manager)"]);
        let err = PackageManager::Dnf.classify_failure(
            StepKind::Verify,
            &requested,
            &failure(1, "no package provides dnf-command(config-manager)\n"),
        );
        match err {
            ProvisionError::PackageResolution { packages, .. } => assert_eq!(packages, requested),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn infers_from_base_image() {
        let infer = |name: &str| PackageManager::infer(&ImageName(name.into()));
        assert_eq!(infer("fedora:29"), Some(PackageManager::Dnf));
        assert_eq!(infer("docker.io/library/ubuntu:22.04"), Some(PackageManager::AptGet));
        assert_eq!(infer("alpine:3.18"), Some(PackageManager::Apk));
        assert_eq!(infer("centos:7"), Some(PackageManager::Yum));
        assert_eq!(infer("centos-stream:9"), Some(PackageManager::Dnf));
        assert_eq!(infer("scratch"), None);
    }

    #[test]
    fn dnf_missing_package_is_a_resolution_error() {
        let requested = packages(&["iproute", "not-a-real-package", "git"]);
        let err = PackageManager::Dnf.classify_failure(
            StepKind::Install,
            &requested,
            &failure(
                1,
                "No match for argument: not-a-real-package\nError: Unable to find a match: not-a-real-package\n",
            ),
        );

        match err {
            ProvisionError::PackageResolution { packages, reason } => {
                assert_eq!(packages, self::packages(&["not-a-real-package"]));
                assert_eq!(reason, "No match for argument: not-a-real-package");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn apt_missing_package_is_a_resolution_error() {
        let requested = packages(&["curl", "nope"]);
        let err = PackageManager::AptGet.classify_failure(
            StepKind::Install,
            &requested,
            &failure(100, "E: Unable to locate package nope\n"),
        );

        match err {
            ProvisionError::PackageResolution { packages, .. } => {
                assert_eq!(packages, self::packages(&["nope"]));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn unnamed_resolution_failure_blames_every_package() {
        let requested = packages(&["a", "b"]);
        let err = PackageManager::Dnf.classify_failure(
            StepKind::Install,
            &requested,
            &failure(1, "Problem: conflicting requests\n - nothing provides libfoo.so"),
        );

        match err {
            ProvisionError::PackageResolution { packages, .. } => assert_eq!(packages, requested),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn network_markers_win_over_everything_else() {
        let err = PackageManager::Dnf.classify_failure(
            StepKind::Upgrade,
            &[],
            &failure(
                1,
                "Curl error (6): Couldn't resolve host name\nError: Failed to download metadata for repo 'fedora'",
            ),
        );
        assert!(matches!(err, ProvisionError::Network { step: StepKind::Upgrade, .. }));
    }

    #[test]
    fn other_upgrade_failures_keep_the_exit_code() {
        let err = PackageManager::Dnf.classify_failure(
            StepKind::Upgrade,
            &[],
            &failure(1, "Error: Transaction test error:\n  disk full"),
        );

        match err {
            ProvisionError::StepFailed { step, code, reason } => {
                assert_eq!(step, StepKind::Upgrade);
                assert_eq!(code, Some(1));
                assert_eq!(reason, "disk full");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
