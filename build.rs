use std::process::Command;

/// Trimmed stdout of a git command, if git is available and it succeeded
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    let tag = git(&["describe", "--tags", "--abbrev=0"])
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    let version = match git(&["rev-parse", "--short", "HEAD"]) {
        Some(hash) => format!("{} ({})", tag, hash),
        None => tag,
    };

    println!("cargo:rustc-env=QUICTUN_VERSION={}", version);
    println!(
        "cargo:rustc-env=QUICTUN_BUILD_TIME={}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");
}
