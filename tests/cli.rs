//! End-to-end tests of the `bandar` binary.

mod common;

use std::fs;

use common::{Sandbox, bandar_in};

fn stdout(out: &std::process::Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &std::process::Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

/// Sandbox whose project tree carries a `.bandar.toml` pointing at the stand-ins.
fn configured() -> Sandbox {
    let sb = Sandbox::new();
    fs::write(sb.project().join(".bandar.toml"), sb.config_toml()).unwrap();
    sb
}

#[test]
fn missing_dev_path_exits_1() {
    let sb = Sandbox::new();
    let missing = sb.root().join("missing");
    let out = bandar_in(sb.root(), &["-d", missing.to_str().unwrap(), "check-git"]);
    assert_eq!(out.status.code(), Some(1), "{}", stderr(&out));
    assert!(stderr(&out).contains("does not exist"), "{}", stderr(&out));
}

#[test]
fn malformed_config_exits_1() {
    let sb = Sandbox::new();
    fs::write(sb.project().join(".bandar.toml"), "bogus = 1\n").unwrap();
    let out = bandar_in(&sb.project(), &["check-git"]);
    assert_eq!(out.status.code(), Some(1), "{}", stderr(&out));
    assert!(stderr(&out).contains("invalid configuration"), "{}", stderr(&out));
}

#[test]
fn check_git_outside_a_repository_exits_2() {
    let sb = Sandbox::new();
    let out = bandar_in(&sb.project(), &["check-git"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(stdout(&out).contains("is not a git repository"));
}

#[test]
fn check_git_lists_missing_ignores() {
    let sb = Sandbox::new();
    fs::create_dir(sb.project().join(".git")).unwrap();

    let out = bandar_in(&sb.project(), &["check-git"]);
    assert_eq!(out.status.code(), Some(1));
    let text = stdout(&out);
    assert!(text.contains("You have no .gitignore file!"), "{text}");
    assert!(text.ends_with("add the following to your .gitignore:\nwork\n"), "{text}");

    fs::write(sb.project().join(".gitignore"), "work\n").unwrap();
    let out = bandar_in(&sb.project(), &["check-git"]);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(stdout(&out), "Optimal repository configuration!\n");
}

#[test]
fn test_command_reports_each_port_and_unmounts() {
    let sb = configured();
    sb.add_port(&sb.project(), "www/a", "");
    sb.add_port(&sb.base(), "www/b", "");
    fs::write(sb.base().join("www/b/FAIL"), "").unwrap();

    let out = bandar_in(&sb.project(), &["test", "www/a", "www/b"]);
    assert_eq!(out.status.code(), Some(0), "{}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("[-] www/a -> "), "{text}");
    assert!(text.contains("[-] www/b -> "), "{text}");
    assert!(stderr(&out).contains("Please wait, unmounting overlay..."));
    assert_eq!(sb.calls_to("umount").len(), 1);
}

#[test]
fn escaping_port_exits_1_and_still_unmounts() {
    let sb = configured();
    let out = bandar_in(&sb.project(), &["test", "../../../etc"]);
    assert_eq!(out.status.code(), Some(1), "{}", stderr(&out));
    assert!(stderr(&out).contains("escapes"), "{}", stderr(&out));
    assert!(sb.calls_to("port").is_empty());
    assert_eq!(sb.calls_to("umount").len(), 1);
}

#[test]
fn mount_failure_exits_2() {
    let sb = configured();
    sb.fail("mount");
    let out = bandar_in(&sb.project(), &["test", "www/a"]);
    assert_eq!(out.status.code(), Some(2), "{}", stderr(&out));
    assert!(sb.calls_to("umount").is_empty());
}

#[test]
fn lint_prints_errors_before_warnings() {
    let sb = configured();
    sb.add_port(&sb.project(), "www/a", "");

    let out = bandar_in(&sb.project(), &["lint", "www/a"]);
    assert_eq!(out.status.code(), Some(0), "{}", stderr(&out));
    let text = stdout(&out);
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].starts_with("[-] www/a -> "), "{text}");
    assert_eq!(
        &lines[1..],
        ["www/a/distinfo: missing", "www/a/Makefile: consider sorting"]
    );
}

#[test]
fn lint_json_output() {
    let sb = configured();
    sb.add_port(&sb.project(), "www/a", "");

    let out = bandar_in(&sb.project(), &["lint", "--format", "json", "www/a"]);
    assert_eq!(out.status.code(), Some(0), "{}", stderr(&out));
    let value: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(value[0]["port"], "www/a");
    assert_eq!(value[0]["errors"][0], "www/a/distinfo: missing");
    assert_eq!(value[0]["warnings"][0], "www/a/Makefile: consider sorting");
}

#[test]
fn tree_renders_in_ascii_without_utf8_locale() {
    let sb = configured();
    sb.add_port(&sb.project(), "www/a", "");
    sb.add_port(&sb.base(), "www/b", "");
    sb.set_deps(&sb.project(), "www/a", &["www/b"]);

    let out = std::process::Command::new(env!("CARGO_BIN_EXE_bandar"))
        .args(["tree", "www/a"])
        .current_dir(sb.project())
        .env("LC_ALL", "C")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(0), "{}", stderr(&out));
    assert_eq!(stdout(&out), "www/a\n \\-www/b\n");
}

#[test]
fn poudriere_prints_build_id() {
    let sb = configured();
    let out = bandar_in(&sb.project(), &["poudriere", "-j", "13amd64", "www/a"]);
    assert_eq!(out.status.code(), Some(0), "{}", stderr(&out));
    let id = stdout(&out).trim().to_owned();
    assert_eq!(id.len(), 32, "{id}");
    assert_eq!(fs::read_to_string(sb.captured("bulk.list")).unwrap(), "www/a\n");
    assert!(
        sb.calls_to("poudriere")
            .iter()
            .any(|c| c.starts_with("ports -d -k -p "))
    );
}
