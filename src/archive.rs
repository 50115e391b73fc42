//! Git-tracked port enumeration and shell archives.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::config::ToolCommand;
use crate::error::{BandarError, Result};

/// Files tracked by git under `path`, as reported relative to `cwd`.
///
/// # Errors
/// [`BandarError::Spawn`] if git cannot run, [`BandarError::Io`] if it exits
/// unsuccessfully.
pub fn git_ls_files(git: &ToolCommand, path: &Path, cwd: &Path) -> Result<Vec<String>> {
    let mut cmd = git.command(["ls-files", "-z"]);
    cmd.arg(path)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stderr(Stdio::piped());
    tracing::debug!(command = ?cmd, "listing tracked files");

    let output = cmd.output().map_err(|source| BandarError::Spawn {
        command: format!("{git} ls-files"),
        source,
    })?;
    if !output.status.success() {
        return Err(BandarError::Io(std::io::Error::other(format!(
            "`{git} ls-files` failed in '{}': {}",
            cwd.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ))));
    }

    Ok(output
        .stdout
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| String::from_utf8_lossy(entry).into_owned())
        .collect())
}

/// Ports (`category/name`) with at least one tracked file in `dev_path`.
///
/// Sorted and de-duplicated; paths whose first two components are not an
/// existing directory are skipped.
///
/// # Errors
/// See [`git_ls_files`].
pub fn git_list_ports(git: &ToolCommand, dev_path: &Path) -> Result<Vec<String>> {
    let files = git_ls_files(git, dev_path, dev_path)?;
    Ok(ports_from_files(&files, dev_path))
}

fn ports_from_files(files: &[String], dev_path: &Path) -> Vec<String> {
    let ports: BTreeSet<String> = files
        .iter()
        .filter_map(|file| {
            let mut parts = file.split('/');
            let (category, name) = (parts.next()?, parts.next()?);
            Some(format!("{category}/{name}"))
        })
        .filter(|port| dev_path.join(port).is_dir())
        .collect();
    ports.into_iter().collect()
}

/// Archive file name for a port: `www/nginx` becomes `www_nginx.shar`.
#[must_use]
pub fn archive_name(port: &str) -> String {
    format!("{}.shar", port.replace('/', "_"))
}

/// Where the archive for `port` is written: `out_dir`, or the port directory.
#[must_use]
pub fn archive_path(dev_path: &Path, port: &str, out_dir: Option<&Path>) -> PathBuf {
    let name = archive_name(port);
    out_dir.map_or_else(|| dev_path.join(port).join(&name), |dir| dir.join(&name))
}

/// Write a shell archive of the port's tracked files to `output`.
///
/// # Errors
/// [`BandarError::Spawn`] if git or shar cannot run, [`BandarError::Io`] if
/// either fails or the archive cannot be written.
pub fn generate_shar(
    git: &ToolCommand,
    shar: &ToolCommand,
    git_root: &Path,
    port: &str,
    output: &Path,
) -> Result<()> {
    let files = git_ls_files(git, Path::new(port), git_root)?;

    let mut cmd = shar.command(&files);
    cmd.current_dir(git_root)
        .stdin(Stdio::null())
        .stderr(Stdio::piped());
    tracing::debug!(port, files = files.len(), "generating shell archive");

    let out = cmd.output().map_err(|source| BandarError::Spawn {
        command: shar.to_string(),
        source,
    })?;
    if !out.status.success() {
        return Err(BandarError::Io(std::io::Error::other(format!(
            "`{shar}` failed for '{port}': {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ))));
    }
    std::fs::write(output, out.stdout)?;
    Ok(())
}
