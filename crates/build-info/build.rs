use std::env;
use std::path::Path;
use std::process::Command;

use chrono::{TimeZone, Utc};

fn main() {
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    let head = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../.git/HEAD");
    if head.exists() {
        println!("cargo:rerun-if-changed={}", head.display());
    }

    println!("cargo:rustc-env=SUBPROC_BUILT_AT={}", built_at());
    println!(
        "cargo:rustc-env=SUBPROC_GIT_REV={}",
        git_revision().unwrap_or_else(|| "unknown".to_string())
    );
}

/// Honours `SOURCE_DATE_EPOCH` so reproducible builds stay reproducible.
fn built_at() -> String {
    let pinned = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|secs| secs.trim().parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    pinned
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Short commit hash, suffixed with `+dirty` when tracked files changed.
fn git_revision() -> Option<String> {
    let rev = git(&["rev-parse", "--short=12", "HEAD"]).filter(|rev| !rev.is_empty())?;
    let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
        .is_some_and(|changes| !changes.is_empty());
    Some(if dirty { format!("{}+dirty", rev) } else { rev })
}
