use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use bandar::check_git::{self, GitCheck};
use bandar::tree::{self, Glyphs};
use bandar::{BandarConfig, BandarError, LintResult, Orchestrator, archive, cleanup, path_guard};

/// Development helper for ports trees kept outside the upstream collection
///
/// Overlay-backed commands (lint, tree, poudriere, test) mount the project
/// tree over the upstream collection in a temporary copy-on-write view and
/// run the port tools against it. The view is unmounted when the command
/// finishes, fails, or is interrupted.
///
/// Port lists accept the single word 'all' to mean every port with files
/// tracked by git in the project tree.
#[derive(Parser)]
#[command(name = "bandar")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'bandar <command> --help' for more information on a specific command.")]
struct Cli {
    /// Directory of project ports (default: current working directory)
    #[arg(short = 'd', value_name = "dev-ports-path", global = true)]
    dev_path: Option<PathBuf>,

    /// Directory of upstream ports (default: `ports_dir` from config, /usr/ports)
    #[arg(short = 'p', value_name = "ports-path", global = true)]
    ports_path: Option<PathBuf>,

    /// Configuration file (default: <dev-ports-path>/.bandar.toml)
    #[arg(short = 'c', long = "config", value_name = "path", global = true)]
    config: Option<PathBuf>,

    /// Verbose diagnostics on stderr
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate archive files; only files committed to git are included
    Archive {
        /// Output directory (default: each port's own directory)
        #[arg(short = 'o', value_name = "path")]
        output_path: Option<PathBuf>,

        /// Ports to archive, or 'all'
        #[arg(required = true)]
        ports: Vec<String>,
    },

    /// Check that the git repository is configured for bandar
    CheckGit,

    /// Run the lint tool on development ports
    Lint {
        /// Output format
        #[arg(long, value_enum, default_value_t)]
        format: Format,

        /// Ports to lint, or 'all'
        #[arg(required = true)]
        ports: Vec<String>,
    },

    /// Print the run-time dependency tree of a port
    Tree {
        /// Output format
        #[arg(long, value_enum, default_value_t)]
        format: Format,

        /// Port whose tree is printed
        port: String,
    },

    /// Bulk-build development ports with poudriere
    Poudriere {
        /// Jail to build in
        #[arg(short = 'j', value_name = "jail")]
        jail: String,

        /// Ports to build, or 'all'
        #[arg(required = true)]
        ports: Vec<String>,
    },

    /// Run `port test` on development ports
    Test {
        /// Ports to test, or 'all'
        #[arg(required = true)]
        ports: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum Format {
    #[default]
    Text,
    Json,
}

/// Resolved command-line context shared by every handler.
struct Context {
    dev_path: PathBuf,
    ports_path: PathBuf,
    config: BandarConfig,
}

impl Context {
    fn from_cli(cli: &Cli) -> Result<Self> {
        let dev_path = match &cli.dev_path {
            Some(path) => path.clone(),
            None => std::env::current_dir().context("reading current directory")?,
        };
        let dev_path = path_guard::resolve(&dev_path, None)?;

        let mut config = match &cli.config {
            Some(path) => BandarConfig::load(path)?,
            None => BandarConfig::load_from_dir(&dev_path)?,
        };
        config.debug = cli.debug;

        let ports_path = cli
            .ports_path
            .clone()
            .unwrap_or_else(|| config.ports_dir.clone());

        Ok(Self {
            dev_path,
            ports_path,
            config,
        })
    }

    /// Expand a lone `all` to every git-tracked port.
    fn ports(&self, ports: Vec<String>) -> Result<Vec<String>> {
        if ports.first().is_some_and(|p| p == "all") {
            Ok(archive::git_list_ports(&self.config.tools.git, &self.dev_path)?)
        } else {
            Ok(ports)
        }
    }

    /// Run `f` against a freshly mounted overlay and always unmount it.
    fn with_overlay<T>(&self, f: impl FnOnce(&Orchestrator) -> Result<T>) -> Result<T> {
        let orchestrator = Orchestrator::new(&self.dev_path, &self.ports_path, &self.config)?;
        tracing::debug!(
            mountpoint = %orchestrator.mountpoint().display(),
            "overlay mounted"
        );
        let result = f(&orchestrator);
        eprintln!("Please wait, unmounting overlay...");
        orchestrator.teardown();
        result
    }
}

fn main() -> ExitCode {
    if let Err(e) = cleanup::install_interrupt_handler() {
        eprintln!("warning: interrupts will not trigger cleanup: {e}");
    }

    let cli = Cli::parse();
    bandar::telemetry::init(cli.debug);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => report(&e),
    }
}

fn report(e: &anyhow::Error) -> ExitCode {
    eprintln!("[!] ERROR: {e:#}");
    let code = e.downcast_ref::<BandarError>().map_or(2, BandarError::exit_code);
    ExitCode::from(code)
}

fn run(cli: Cli) -> Result<u8> {
    let ctx = Context::from_cli(&cli)?;
    tracing::debug!(
        dev_path = %ctx.dev_path.display(),
        ports_path = %ctx.ports_path.display(),
        "starting"
    );

    match cli.command {
        Commands::Archive { output_path, ports } => {
            let ports = ctx.ports(ports)?;
            archive_cmd(&ctx, output_path.as_deref(), &ports)
        }
        Commands::CheckGit => check_git_cmd(&ctx),
        Commands::Lint { format, ports } => {
            let ports = ctx.ports(ports)?;
            ctx.with_overlay(|o| lint_cmd(&ctx, o, &ports, format))
        }
        Commands::Tree { format, port } => ctx.with_overlay(|o| tree_cmd(o, &port, format)),
        Commands::Poudriere { jail, ports } => {
            let ports = ctx.ports(ports)?;
            ctx.with_overlay(|o| {
                println!("{}", o.bulk_build(&jail, &ports)?);
                Ok(0)
            })
        }
        Commands::Test { ports } => {
            let ports = ctx.ports(ports)?;
            ctx.with_overlay(|o| test_cmd(o, &ports))
        }
    }
}

fn glyphs() -> Glyphs {
    Glyphs::detect(|key| std::env::var(key).ok())
}

fn archive_cmd(ctx: &Context, out_dir: Option<&Path>, ports: &[String]) -> Result<u8> {
    if let Some(dir) = out_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory '{}'", dir.display()))?;
    }
    let tools = &ctx.config.tools;
    let mut stdout = std::io::stdout().lock();
    for port in ports {
        write!(stdout, "[-] {port} -> ")?;
        stdout.flush()?;
        let path = archive::archive_path(&ctx.dev_path, port, out_dir);
        archive::generate_shar(&tools.git, &tools.shar, &ctx.dev_path, port, &path)?;
        writeln!(stdout, "{}", path.display())?;
    }
    Ok(0)
}

fn check_git_cmd(ctx: &Context) -> Result<u8> {
    let result = check_git::check(&ctx.dev_path)?;
    match &result {
        GitCheck::NotARepository => {
            println!(
                "[!] ERROR: '{}' is not a git repository.",
                ctx.dev_path.display()
            );
        }
        GitCheck::Suboptimal {
            missing_gitignore,
            missing,
        } => {
            if *missing_gitignore {
                println!("[!] WARN: You have no .gitignore file!");
            }
            if missing.is_empty() {
                println!("Optimal repository configuration!");
            } else {
                println!("[-] For best results, add the following to your .gitignore:");
                println!("{}", missing.join("\n"));
            }
        }
        GitCheck::Optimal => println!("Optimal repository configuration!"),
    }
    Ok(result.exit_code())
}

#[derive(Serialize)]
struct LintReport<'a> {
    port: &'a str,
    #[serde(flatten)]
    result: &'a LintResult,
}

fn lint_cmd(ctx: &Context, o: &Orchestrator, ports: &[String], format: Format) -> Result<u8> {
    let flags = &ctx.config.lint.flags;
    match format {
        Format::Json => {
            let results = o.lint_ports(ports, flags)?;
            let reports: Vec<LintReport<'_>> = results
                .iter()
                .map(|(port, result)| LintReport { port, result })
                .collect();
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Format::Text => {
            let glyphs = glyphs();
            let mut stdout = std::io::stdout().lock();
            for port in ports {
                write!(stdout, "[-] {port} -> ")?;
                stdout.flush()?;
                let result = o.lint_port(port, flags)?;
                writeln!(stdout, "{}", glyphs.status(result.is_clean()))?;
                for line in result.errors.iter().chain(&result.warnings) {
                    writeln!(stdout, "{line}")?;
                }
            }
        }
    }
    Ok(0)
}

fn tree_cmd(o: &Orchestrator, port: &str, format: Format) -> Result<u8> {
    let root = o.dependency_tree(port)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&root)?),
        Format::Text => print!("{}", tree::render(&root, &glyphs())),
    }
    Ok(0)
}

fn test_cmd(o: &Orchestrator, ports: &[String]) -> Result<u8> {
    let glyphs = glyphs();
    for outcome in o.test_ports(ports)? {
        println!("[-] {} -> {}", outcome.port, glyphs.status(outcome.passed));
    }
    Ok(0)
}
