//! The toolchain seam.
//!
//! Actual compiler invocation is an external collaborator: the pipeline only
//! depends on this trait. [`ProcessToolchain`] is the host implementation,
//! driving the platform's compiler command as child processes; tests supply
//! scripted implementations instead.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::board::Platform;

/// Output captured from one toolchain step.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Raw stdout bytes.
    pub stdout: Vec<u8>,
    /// Raw stderr bytes.
    pub stderr: Vec<u8>,
    /// Whether the step exited successfully.
    pub success: bool,
    /// Process exit code (-1 when killed by a signal).
    pub exit_code: i32,
}

impl StepOutput {
    /// A successful step with the given stdout.
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
            success: true,
            exit_code: 0,
        }
    }
}

/// One source file scheduled for compilation.
#[derive(Debug, Clone)]
pub struct CompileUnit {
    /// Absolute path of the (merged) source file.
    pub source: PathBuf,
    /// Absolute path the object file is written to.
    pub object: PathBuf,
}

/// Drives the build tools for one platform.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// The argv that would compile `unit`, for compilation databases.
    fn compile_command_line(&self, unit: &CompileUnit, flags: &[String]) -> Vec<String>;

    /// Run the preprocessor over `source`, producing the expanded text on
    /// stdout.
    async fn preprocess(&self, source: &Path, flags: &[String]) -> io::Result<StepOutput>;

    /// Compile one unit to its object file.
    async fn compile_unit(&self, unit: &CompileUnit, flags: &[String]) -> io::Result<StepOutput>;

    /// Link objects into the final executable.
    async fn link(&self, objects: &[PathBuf], output: &Path) -> io::Result<StepOutput>;

    /// Occupied size per section of the linked executable.
    async fn sizes(&self, executable: &Path) -> io::Result<Vec<(String, u64)>>;
}

/// Chooses the toolchain used to build for a given platform.
pub trait ToolchainProvider: Send + Sync {
    /// Toolchain for the platform supplying the build core.
    fn toolchain(&self, build_platform: &Platform) -> Arc<dyn Toolchain>;
}

/// Default provider: host compiler processes configured by the platform.
#[derive(Debug, Default)]
pub struct HostToolchainProvider;

impl ToolchainProvider for HostToolchainProvider {
    fn toolchain(&self, build_platform: &Platform) -> Arc<dyn Toolchain> {
        Arc::new(ProcessToolchain::for_platform(build_platform))
    }
}

/// Toolchain invoking the platform's compiler as host processes.
#[derive(Debug, Clone)]
pub struct ProcessToolchain {
    compiler: String,
    size_command: Option<String>,
}

impl ProcessToolchain {
    /// Toolchain using `build_platform`'s declared tools.
    pub fn for_platform(build_platform: &Platform) -> Self {
        Self {
            compiler: build_platform.tools.compiler_command.clone(),
            size_command: build_platform.tools.size_command.clone(),
        }
    }

    async fn run(&self, program: &str, args: Vec<String>) -> io::Result<StepOutput> {
        // kill_on_drop: an abandoned step (client cancelled the request)
        // must not leave compiler processes behind.
        let output = Command::new(program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(StepOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[async_trait]
impl Toolchain for ProcessToolchain {
    fn compile_command_line(&self, unit: &CompileUnit, flags: &[String]) -> Vec<String> {
        let mut argv = vec![self.compiler.clone()];
        argv.extend(flags.iter().cloned());
        argv.push("-c".to_string());
        argv.push(unit.source.display().to_string());
        argv.push("-o".to_string());
        argv.push(unit.object.display().to_string());
        argv
    }

    async fn preprocess(&self, source: &Path, flags: &[String]) -> io::Result<StepOutput> {
        let mut args: Vec<String> = flags.to_vec();
        args.push("-E".to_string());
        args.push(source.display().to_string());
        self.run(&self.compiler, args).await
    }

    async fn compile_unit(&self, unit: &CompileUnit, flags: &[String]) -> io::Result<StepOutput> {
        let argv = self.compile_command_line(unit, flags);
        self.run(&self.compiler, argv[1..].to_vec()).await
    }

    async fn link(&self, objects: &[PathBuf], output: &Path) -> io::Result<StepOutput> {
        let mut args: Vec<String> = objects.iter().map(|o| o.display().to_string()).collect();
        args.push("-o".to_string());
        args.push(output.display().to_string());
        self.run(&self.compiler, args).await
    }

    async fn sizes(&self, executable: &Path) -> io::Result<Vec<(String, u64)>> {
        match &self.size_command {
            Some(cmd) => {
                let out = self
                    .run(cmd, vec!["-A".to_string(), executable.display().to_string()])
                    .await?;
                if !out.success {
                    return Err(io::Error::other(format!(
                        "size tool exited with code {}",
                        out.exit_code
                    )));
                }
                Ok(parse_berkeley_sections(&String::from_utf8_lossy(&out.stdout)))
            }
            // No size tool: report the image itself as a single section.
            None => {
                let len = tokio::fs::metadata(executable).await?.len();
                Ok(vec![("program".to_string(), len)])
            }
        }
    }
}

/// Parse `size -A` output: one `.section size addr` line per section.
fn parse_berkeley_sections(output: &str) -> Vec<(String, u64)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            if !name.starts_with('.') {
                return None;
            }
            let size: u64 = fields.next()?.parse().ok()?;
            Some((name.trim_start_matches('.').to_string(), size))
        })
        .collect()
}
