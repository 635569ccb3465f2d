use assert_cmd::Command;
use std::time::Duration;
use tempfile::TempDir;

/// Private config and runtime roots per test, so tests can run in parallel.
pub struct TestContext {
    pub cmd: Command,
    pub dir: TempDir,
}

impl TestContext {
    /// Another invocation against the same roots.
    pub fn new_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_vcbox");
        let mut cmd = Command::new(bin_path);
        cmd.timeout(Duration::from_secs(30));
        cmd.env_remove("VCBOX_CONFIG_ROOT");
        cmd.env_remove("VCBOX_RUNTIME_ROOT");
        cmd.arg("--config-root").arg(self.dir.path().join("config"));
        cmd.arg("--root").arg(self.dir.path().join("run"));
        cmd
    }

    /// Run `vcbox <args>` and expect success.
    #[allow(dead_code)]
    pub fn run_ok(&self, args: &[&str]) -> String {
        let output = self.new_cmd().args(args).assert().success().get_output().clone();
        String::from_utf8_lossy(&output.stdout).to_string()
    }
}

pub fn vcbox() -> TestContext {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut ctx = TestContext {
        cmd: Command::new(env!("CARGO_BIN_EXE_vcbox")),
        dir,
    };
    ctx.cmd = ctx.new_cmd();
    ctx
}
