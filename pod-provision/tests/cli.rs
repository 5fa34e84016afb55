use assert_cmd::Command;
use predicates::prelude::*;
use std::{fs, path::Path};
use tempfile::TempDir;

const FEDORA_RECIPE: &str = "FROM fedora:29

RUN dnf -y upgrade \\
    && \\
    dnf -y install \\
        iproute \\
        nodejs \\
        git
";

fn recipe(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn pod_provision() -> Command {
    let mut command = Command::cargo_bin("pod-provision").unwrap();
    command.env_remove("PODMAN").env_remove("LOG");
    command
}

#[test]
fn plan_lists_steps_and_commands_in_order() {
    let dir = TempDir::new().unwrap();
    let path = recipe(&dir, "Dockerfile", FEDORA_RECIPE);

    let output = pod_provision()
        .arg("--file")
        .arg(&path)
        .args(&["plan", "--tag", "localhost/slides:latest"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(
        stdout,
        "Pulling fedora:29
Upgrading system packages
    dnf -y upgrade
Installing iproute nodejs git
    dnf -y install iproute nodejs git
Verifying iproute nodejs git
    rpm -q --whatprovides iproute nodejs git
Committing localhost/slides:latest
"
    );
}

#[test]
fn plan_finds_the_recipe_from_a_subdirectory() {
    let dir = TempDir::new().unwrap();
    recipe(&dir, "Containerfile", "FROM alpine:3.18\nRUN apk add git\n");
    let nested = dir.path().join("src");
    fs::create_dir(&nested).unwrap();

    pod_provision()
        .current_dir(&nested)
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("    apk update\n    apk add git\n"))
        .stdout(predicate::str::contains("Committing localhost/"));
}

#[test]
fn inspect_prints_the_build_spec() {
    let dir = TempDir::new().unwrap();
    let path = recipe(
        &dir,
        "provision.yml",
        "base_image: ubuntu:22.04\npackages: [curl, git]\n",
    );

    let output = pod_provision()
        .arg("-f")
        .arg(&path)
        .arg("inspect")
        .output()
        .unwrap();
    assert!(output.status.success());

    let spec: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(spec["base_image"], "ubuntu:22.04");
    assert_eq!(spec["package_manager"], "apt-get");
    assert_eq!(spec["upgrade"], true);
    assert_eq!(spec["packages"], serde_json::json!(["curl", "git"]));
}

#[test]
fn invalid_recipes_exit_with_the_recipe_code() {
    let dir = TempDir::new().unwrap();
    let path = recipe(&dir, "Dockerfile", "FROM fedora:29\nCOPY . /srv\n");

    pod_provision()
        .arg("-f")
        .arg(&path)
        .arg("plan")
        .assert()
        .code(6)
        .stderr(predicate::str::contains("unsupported instruction COPY"))
        .stderr(predicate::str::contains("Dockerfile:2"));
}

#[test]
fn missing_recipe_is_reported() {
    let dir = TempDir::new().unwrap();

    pod_provision()
        .arg("-f")
        .arg(dir.path().join("Dockerfile"))
        .arg("plan")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to find recipe"));
}

#[test]
fn unusable_podman_fails_the_build() {
    let dir = TempDir::new().unwrap();
    let path = recipe(&dir, "Dockerfile", FEDORA_RECIPE);

    pod_provision()
        .arg("-f")
        .arg(&path)
        .arg("--podman")
        .arg(dir.path().join("no-such-podman"))
        .arg("build")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to run"));
}

#[cfg(unix)]
mod fake_podman {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Writes a shell script answering the podman commands a build issues
    /// and logging every invocation.
    fn install(dir: &Path) -> std::path::PathBuf {
        let script = format!(
            r#"#!/bin/sh
STATE="{state}"
echo "$@" >> "$STATE/calls.log"
case "$1" in
  version) echo 4.9.0 ;;
  image)
    if [ "$3" = "fedora:29" ] && [ -f "$STATE/pulled" ]; then
      echo '[{{"Id": "base0", "Size": 1048576, "Config": {{"Cmd": ["/bin/bash"]}}}}]'
    elif [ "$3" = "localhost/slides:latest" ] && [ -f "$STATE/committed" ]; then
      echo '[{{"Id": "built0", "Size": 3145728, "Labels": {{}}}}]'
    else
      echo "Error: $3: image not known" >&2
      exit 125
    fi ;;
  pull)
    if [ "$3" = "fedora:29" ]; then
      touch "$STATE/pulled"
      echo base0
    else
      echo "Error: initializing source docker://$3: reading manifest: manifest unknown" >&2
      exit 125
    fi ;;
  create) echo work0 ;;
  start) echo work0 ;;
  exec)
    case "$*" in
      *not-a-real-package*)
        echo "No match for argument: not-a-real-package" >&2
        echo "Error: Unable to find a match: not-a-real-package" >&2
        exit 1 ;;
    esac ;;
  commit)
    touch "$STATE/committed"
    echo built0123456789abcdef ;;
  rm) echo work0 ;;
esac
"#,
            state = dir.display()
        );

        let path = dir.join("podman");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn calls(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn position(calls: &[String], prefix: &str) -> usize {
        calls
            .iter()
            .position(|call| call.starts_with(prefix))
            .unwrap_or_else(|| panic!("no call starting with {:?} in {:#?}", prefix, calls))
    }

    #[test]
    fn builds_the_fedora_recipe() {
        let dir = TempDir::new().unwrap();
        let podman = install(dir.path());
        let path = recipe(&dir, "Dockerfile", FEDORA_RECIPE);

        pod_provision()
            .arg("-f")
            .arg(&path)
            .arg("--podman")
            .arg(&podman)
            .args(&["build", "-t", "localhost/slides:latest"])
            .assert()
            .success()
            .stdout(predicate::str::contains(
                "Built localhost/slides:latest (built0123456, 3.0 MiB)",
            ));

        let calls = calls(dir.path());
        let upgrade = position(&calls, "exec work0 dnf -y upgrade");
        let install = position(&calls, "exec work0 dnf -y install iproute nodejs git");
        let verify = position(&calls, "exec work0 rpm -q --whatprovides iproute nodejs git");
        let commit = position(&calls, "commit --quiet");
        let remove = position(&calls, "rm --force work0");

        assert!(position(&calls, "pull --quiet fedora:29") < position(&calls, "create"));
        assert!(upgrade < install && install < verify && verify < commit && commit < remove);
        assert!(calls[commit].contains("io.podman.provision.hash="));
        assert!(calls[commit].ends_with("work0 localhost/slides:latest"));
    }

    #[test]
    fn unresolvable_packages_leave_no_image() {
        let dir = TempDir::new().unwrap();
        let podman = install(dir.path());
        let path = recipe(
            &dir,
            "Dockerfile",
            "FROM fedora:29\nRUN dnf -y upgrade && dnf -y install git not-a-real-package\n",
        );

        pod_provision()
            .arg("-f")
            .arg(&path)
            .arg("--podman")
            .arg(&podman)
            .args(&["build", "-t", "localhost/slides:latest"])
            .assert()
            .code(3)
            .stderr(predicate::str::contains(
                "could not resolve package(s) not-a-real-package",
            ));

        let calls = calls(dir.path());
        assert!(!calls.iter().any(|call| call.starts_with("commit")));
        assert_eq!(calls.last().map(String::as_str), Some("rm --force work0"));
    }

    #[test]
    fn unknown_base_tags_fail_before_installing() {
        let dir = TempDir::new().unwrap();
        let podman = install(dir.path());
        let path = recipe(
            &dir,
            "Dockerfile",
            "FROM fedora:doesnotexist\nRUN dnf -y upgrade && dnf -y install git\n",
        );

        pod_provision()
            .arg("-f")
            .arg(&path)
            .arg("--podman")
            .arg(&podman)
            .args(&["build", "-t", "localhost/slides:latest"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains(
                "failed to pull base image fedora:doesnotexist",
            ));

        let calls = calls(dir.path());
        assert!(!calls.iter().any(|call| call.starts_with("create") || call.starts_with("exec")));
    }
}
