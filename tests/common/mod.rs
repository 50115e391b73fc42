//! Shared test helpers for bandar integration tests.
//!
//! Every test gets its own [`Sandbox`]: a temp directory holding a project
//! ports tree, an upstream tree, stand-in shell scripts for the external
//! tools, and a call log the scripts append to. Nothing is mounted for real;
//! the mount stand-in copies the read-only layers into the mountpoint so the
//! merged view can be inspected.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use bandar::config::{BandarConfig, ToolsConfig};
use bandar::ToolCommand;
use tempfile::TempDir;

pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    /// Create the layout and install the stand-in tools.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let sandbox = Self { dir };
        for sub in ["project", "base", "bin", "log"] {
            fs::create_dir_all(sandbox.root().join(sub)).unwrap();
        }
        fs::write(sandbox.log_path(), "").unwrap();
        sandbox.install_stubs();
        sandbox
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn project(&self) -> PathBuf {
        self.root().join("project")
    }

    pub fn base(&self) -> PathBuf {
        self.root().join("base")
    }

    fn bin(&self, name: &str) -> PathBuf {
        self.root().join("bin").join(name)
    }

    fn log_dir(&self) -> PathBuf {
        self.root().join("log")
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir().join("calls.log")
    }

    /// Every stand-in invocation, one line each, in call order.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.log_path())
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Calls made to one stand-in, with the tool name stripped.
    pub fn calls_to(&self, tool: &str) -> Vec<String> {
        let prefix = format!("{tool} ");
        self.calls()
            .iter()
            .filter_map(|l| l.strip_prefix(&prefix).map(str::to_owned))
            .collect()
    }

    /// Make a stand-in fail: `mount`, `register` or `depends`.
    pub fn fail(&self, what: &str) {
        fs::write(self.log_dir().join(format!("{what}.fail")), "").unwrap();
    }

    /// Path of a file the stand-ins write as a side channel.
    pub fn captured(&self, name: &str) -> PathBuf {
        self.log_dir().join(name)
    }

    /// Create a port directory with a Makefile under `tree`.
    pub fn add_port(&self, tree: &Path, port: &str, makefile: &str) -> PathBuf {
        let dir = tree.join(port);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("Makefile"), makefile).unwrap();
        dir
    }

    /// Declare the run-time dependencies reported for a port.
    pub fn set_deps(&self, tree: &Path, port: &str, deps: &[&str]) {
        let mut text = deps.join("\n");
        text.push('\n');
        fs::write(tree.join(port).join("deps"), text).unwrap();
    }

    fn tool(&self, name: &str) -> ToolCommand {
        ToolCommand::with_prefix(["sh".to_owned(), self.bin(name).display().to_string()])
    }

    pub fn tools(&self) -> ToolsConfig {
        ToolsConfig {
            mount: self.tool("mount.sh"),
            unmount: self.tool("umount.sh"),
            port: self.tool("port.sh"),
            lint: self.tool("lint.sh"),
            make: self.tool("make.sh"),
            poudriere: self.tool("poudriere.sh"),
            ..ToolsConfig::default()
        }
    }

    pub fn config(&self) -> BandarConfig {
        BandarConfig {
            ports_dir: self.base(),
            tools: self.tools(),
            ..BandarConfig::default()
        }
    }

    /// Same configuration as [`Sandbox::config`], as `.bandar.toml` text.
    pub fn config_toml(&self) -> String {
        let entry = |key: &str, script: &str| {
            format!("{key} = [\"sh\", \"{}\"]\n", self.bin(script).display())
        };
        let mut text = format!("ports_dir = \"{}\"\n\n[tools]\n", self.base().display());
        text.push_str(&entry("mount", "mount.sh"));
        text.push_str(&entry("unmount", "umount.sh"));
        text.push_str(&entry("port", "port.sh"));
        text.push_str(&entry("lint", "lint.sh"));
        text.push_str(&entry("make", "make.sh"));
        text.push_str(&entry("poudriere", "poudriere.sh"));
        text
    }

    /// Swap in a lint stand-in that is killed by a signal.
    pub fn lint_gets_killed(&self) {
        fs::write(self.bin("lint.sh"), "kill -9 $$\n").unwrap();
    }

    fn install_stubs(&self) {
        let log = self.log_path();
        let log = log.display();
        let flags = self.log_dir();
        let flags = flags.display();

        let mount = format!(
            r#"echo "mount $*" >> "{log}"
if [ -f "{flags}/mount.fail" ]; then echo "mount refused" >&2; exit 3; fi
mnt=$4
rev=""
for b in $(echo "$3" | tr ':' ' '); do
  case "$b" in *=RO) rev="${{b%=RO}} $rev" ;; esac
done
for l in $rev; do cp -R "$l/." "$mnt/"; done
"#
        );
        let umount = format!("echo \"umount $*\" >> \"{log}\"\n");
        let port = format!(
            r#"echo "port $* $(pwd -P) $PORTSDIR" >> "{log}"
if [ -f FAIL ]; then exit 1; fi
"#
        );
        let lint = format!(
            r#"echo "lint $*" >> "{log}"
for a; do dir=$a; done
echo "WARN: $dir/Makefile: consider sorting"
echo "FATAL: $dir/distinfo: missing" >&2
echo "0 fatal errors and 1 warning found."
exit 1
"#
        );
        let make = format!(
            r#"echo "make $* $(pwd -P)" >> "{log}"
if [ -f "{flags}/depends.fail" ]; then echo "no such target" >&2; exit 2; fi
if [ -f deps ]; then
  while read d; do
    if [ -z "$d" ]; then echo; else echo "$PORTSDIR/$d"; fi
  done < deps
fi
"#
        );
        let poudriere = format!(
            r#"echo "poudriere $*" >> "{log}"
case "$1" in
  ports)
    if [ "$2" = "-c" ] && [ -f "{flags}/register.fail" ]; then echo "cannot register" >&2; exit 4; fi ;;
  bulk)
    prev=""
    for a; do
      if [ "$prev" = "-f" ]; then cp "$a" "{flags}/bulk.list"; echo "$a" > "{flags}/bulk.path"; fi
      prev=$a
    done ;;
esac
"#
        );

        for (name, body) in [
            ("mount.sh", mount),
            ("umount.sh", umount),
            ("port.sh", port),
            ("lint.sh", lint),
            ("make.sh", make),
            ("poudriere.sh", poudriere),
        ] {
            fs::write(self.bin(name), body).unwrap();
        }
    }
}

/// Run the bandar binary with `args` from `cwd`.
pub fn bandar_in(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_bandar"))
        .args(args)
        .current_dir(cwd)
        .env_remove("BANDAR_LOG")
        .output()
        .expect("failed to execute bandar")
}
