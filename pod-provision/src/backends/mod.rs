pub use podman::PodmanBackend;

mod podman;
mod runner;
