mod process;

#[cfg(feature = "docker")]
mod docker;

pub use process::ProcessSupervisor;

#[cfg(feature = "docker")]
pub use docker::DockerSupervisor;
