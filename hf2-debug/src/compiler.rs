//! The program compiler collaborator.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::debug_info::{CompiledDebugInfo, DebugMetadata};
use crate::image::{BinaryImage, ImageError, ImageFormat};

/// What the session asks the compiler to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Generate native code for the device instead of simulator code.
    pub native: bool,
    /// Emit the breakpoint table and procedure debug information.
    pub debug: bool,
}

impl CompileOptions {
    /// Native code with debug information, as a debug session needs it.
    pub fn native_debug() -> Self {
        Self {
            native: true,
            debug: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Failed to run build command {command:?}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("Build command {command:?} exited with {status}:\n{stderr}")]
    BuildFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("Failed to read {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse debug information in {path:?}")]
    DebugInfo {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to load the binary image")]
    Image(#[from] ImageError),
    #[error("The compiler cannot produce {0}")]
    Unsupported(&'static str),
}

/// Produces the debug information and binary image for a session.
#[async_trait::async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(&self, options: CompileOptions) -> Result<CompiledDebugInfo, CompileError>;
}

/// Settings for [`ArtifactCompiler`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Artifacts {
    /// Command run before the artifacts are read, as program and arguments.
    pub build_command: Vec<String>,
    /// The compiler's JSON debug output.
    pub debug_info: PathBuf,
    /// The image to flash.
    pub binary: PathBuf,
    /// Image format. Guessed from the extension if unset.
    pub format: Option<ImageFormat>,
    /// Load address for raw binaries.
    pub base_address: u32,
}

/// A compiler whose output is read from disk, optionally after running a build command.
#[derive(Debug, Clone)]
pub struct ArtifactCompiler {
    artifacts: Artifacts,
}

impl ArtifactCompiler {
    pub fn new(debug_info: impl Into<PathBuf>, binary: impl Into<PathBuf>) -> Self {
        Self::from_artifacts(Artifacts {
            debug_info: debug_info.into(),
            binary: binary.into(),
            ..Default::default()
        })
    }

    pub fn from_artifacts(artifacts: Artifacts) -> Self {
        Self { artifacts }
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    async fn run_build_command(&self) -> Result<(), CompileError> {
        let Some((program, arguments)) = self.artifacts.build_command.split_first() else {
            return Ok(());
        };
        let command = self.artifacts.build_command.join(" ");

        tracing::info!("Running build command: {}", command);
        let output = tokio::process::Command::new(program)
            .args(arguments)
            .output()
            .await
            .map_err(|source| CompileError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CompileError::BuildFailed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    fn load_metadata(path: &Path) -> Result<DebugMetadata, CompileError> {
        let data = std::fs::read(path).map_err(|source| CompileError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        DebugMetadata::from_json(&data).map_err(|source| CompileError::DebugInfo {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[async_trait::async_trait]
impl Compiler for ArtifactCompiler {
    async fn compile(&self, options: CompileOptions) -> Result<CompiledDebugInfo, CompileError> {
        if !options.native {
            return Err(CompileError::Unsupported("simulator code"));
        }

        self.run_build_command().await?;

        let metadata = Self::load_metadata(&self.artifacts.debug_info)?;
        if options.debug && metadata.breakpoints.is_empty() {
            tracing::warn!(
                "{:?} contains no breakpoints, was it built with debugging enabled?",
                self.artifacts.debug_info
            );
        }

        let image = BinaryImage::load(
            &self.artifacts.binary,
            self.artifacts.format,
            self.artifacts.base_address,
        )?;

        tracing::info!(
            "Loaded {} breakpoints, {} procedures and {} bytes of code",
            metadata.breakpoints.len(),
            metadata.proc_debug_info.len(),
            image.len()
        );

        Ok(CompiledDebugInfo::new(metadata, image))
    }
}

/// A compiler that hands out output produced earlier.
#[derive(Debug, Clone)]
pub struct Precompiled(pub CompiledDebugInfo);

#[async_trait::async_trait]
impl Compiler for Precompiled {
    async fn compile(&self, _options: CompileOptions) -> Result<CompiledDebugInfo, CompileError> {
        Ok(self.0.clone())
    }
}
