//! bandar configuration (`.bandar.toml`).
//!
//! Every field has a default, so a missing file behaves exactly like an empty
//! one. The configuration names the external tools bandar shells out to;
//! each tool may be a single program or an argv prefix such as
//! `["sudo", "poudriere"]`.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::error::{BandarError, Result};

/// File name looked up in the development tree when no `--config` is given.
pub const CONFIG_FILE_NAME: &str = ".bandar.toml";

/// Default value of `[overlay] max_files`.
pub const DEFAULT_MAX_FILES: u64 = 65_536;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level bandar configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BandarConfig {
    /// Upstream ports collection used as the lowest overlay layer.
    #[serde(default = "default_ports_dir")]
    pub ports_dir: PathBuf,

    /// Environment variable that points the port tools at the collection root.
    #[serde(default = "default_collection_env")]
    pub collection_env: String,

    /// Overlay mount settings.
    #[serde(default)]
    pub overlay: OverlayConfig,

    /// Lint settings.
    #[serde(default)]
    pub lint: LintConfig,

    /// External tool locations.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Verbose diagnostics. Never read from the file; set from the command line.
    #[serde(skip)]
    pub debug: bool,
}

impl Default for BandarConfig {
    fn default() -> Self {
        Self {
            ports_dir: default_ports_dir(),
            collection_env: default_collection_env(),
            overlay: OverlayConfig::default(),
            lint: LintConfig::default(),
            tools: ToolsConfig::default(),
            debug: false,
        }
    }
}

fn default_ports_dir() -> PathBuf {
    PathBuf::from("/usr/ports")
}

fn default_collection_env() -> String {
    "PORTSDIR".to_owned()
}

impl BandarConfig {
    /// Load configuration from `path`. A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns [`BandarError::Config`] if the file exists but cannot be read,
    /// is not valid TOML, or names an empty tool command.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(BandarError::Config {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                });
            }
        };
        Self::parse(&text).map_err(|detail| BandarError::Config {
            path: path.to_path_buf(),
            detail,
        })
    }

    /// Load `.bandar.toml` from a development tree.
    ///
    /// # Errors
    /// See [`BandarConfig::load`].
    pub fn load_from_dir(dev_dir: &Path) -> Result<Self> {
        Self::load(&dev_dir.join(CONFIG_FILE_NAME))
    }

    /// Parse configuration text.
    ///
    /// # Errors
    /// Returns a human-readable description of the first problem found.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let config: Self = toml::from_str(text).map_err(|e| e.message().to_owned())?;
        config.tools.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// OverlayConfig / LintConfig
// ---------------------------------------------------------------------------

/// Overlay mount settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverlayConfig {
    /// Passed through to the mount tool as `max_files=<N>`.
    #[serde(default = "default_max_files")]
    pub max_files: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
        }
    }
}

const fn default_max_files() -> u64 {
    DEFAULT_MAX_FILES
}

/// Lint settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LintConfig {
    /// Flags handed to the lint tool before the port path.
    #[serde(default = "default_lint_flags")]
    pub flags: Vec<String>,
}

impl Default for LintConfig {
    fn default() -> Self {
        Self {
            flags: default_lint_flags(),
        }
    }
}

fn default_lint_flags() -> Vec<String> {
    vec!["-gAC".to_owned()]
}

// ---------------------------------------------------------------------------
// ToolsConfig
// ---------------------------------------------------------------------------

/// Locations of the external tools bandar drives.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToolsConfig {
    /// Union filesystem mount tool.
    pub mount: ToolCommand,
    /// Unmount tool (invoked with `-f`).
    pub unmount: ToolCommand,
    /// Port test runner (invoked as `<port> test`).
    pub port: ToolCommand,
    /// Port linter.
    pub lint: ToolCommand,
    /// `make`, used for `run-depends-list`.
    pub make: ToolCommand,
    /// Bulk builder.
    pub poudriere: ToolCommand,
    /// git, used to enumerate tracked ports.
    pub git: ToolCommand,
    /// Shell archive generator.
    pub shar: ToolCommand,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mount: ToolCommand::program("unionfs"),
            unmount: ToolCommand::program("umount"),
            port: ToolCommand::program("port"),
            lint: ToolCommand::program("portlint"),
            make: ToolCommand::program("make"),
            poudriere: ToolCommand::program("poudriere"),
            git: ToolCommand::program("git"),
            shar: ToolCommand::program("shar"),
        }
    }
}

impl ToolsConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        for (key, tool) in [
            ("mount", &self.mount),
            ("unmount", &self.unmount),
            ("port", &self.port),
            ("lint", &self.lint),
            ("make", &self.make),
            ("poudriere", &self.poudriere),
            ("git", &self.git),
            ("shar", &self.shar),
        ] {
            if tool.argv.is_empty() || tool.argv[0].is_empty() {
                return Err(format!("tools.{key} must name a program"));
            }
        }
        Ok(())
    }
}

/// A program plus any leading arguments.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "RawToolCommand")]
pub struct ToolCommand {
    argv: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawToolCommand {
    Program(String),
    Argv(Vec<String>),
}

impl From<RawToolCommand> for ToolCommand {
    fn from(raw: RawToolCommand) -> Self {
        match raw {
            RawToolCommand::Program(p) => Self { argv: vec![p] },
            RawToolCommand::Argv(argv) => Self { argv },
        }
    }
}

impl ToolCommand {
    /// A tool invoked by program name alone.
    pub fn program(name: impl Into<String>) -> Self {
        Self {
            argv: vec![name.into()],
        }
    }

    /// A tool invoked through an argv prefix.
    ///
    /// An empty prefix is accepted here but fails when spawned.
    pub fn with_prefix<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// The configured argv prefix.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Build a [`Command`] for this tool followed by `args`.
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (program, prefix) = self
            .argv
            .split_first()
            .map_or(("", &[][..]), |(p, rest)| (p.as_str(), rest));
        let mut cmd = Command::new(program);
        cmd.args(prefix);
        cmd.args(args);
        cmd
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}
