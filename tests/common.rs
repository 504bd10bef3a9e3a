use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Runs the real binary against throwaway config/data directories so tests
/// never touch the user's state and never need a network.
pub struct TestContext {
    pub _temp_dir: TempDir,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub bin_path: PathBuf,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("config");
        let data_dir = temp_dir.path().join("data");

        let bin_path = PathBuf::from(env!("CARGO_BIN_EXE_upkeep"));

        Self {
            _temp_dir: temp_dir,
            config_dir,
            data_dir,
            bin_path,
        }
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = Command::new(&self.bin_path);
        cmd.env("UPKEEP_CONFIG_DIR", &self.config_dir);
        cmd.env("UPKEEP_DATA_DIR", &self.data_dir);
        cmd.env("HOME", self._temp_dir.path());
        cmd.env_remove("UPKEEP_REPO");
        cmd.env_remove("UPKEEP_FORM_URL");
        cmd
    }

    pub fn run(&self, args: &[&str]) -> CommandOutput {
        self.cmd()
            .args(args)
            .output()
            .expect("Failed to run upkeep binary")
            .into()
    }
}

pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: std::process::ExitStatus,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status,
        }
    }
}
