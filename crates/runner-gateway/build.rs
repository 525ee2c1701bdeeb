use chrono::Utc;
use std::process::Command;

fn main() {
    let git_sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|sha| sha.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=AGENT_RUNNER_GIT_SHA={git_sha}");
    println!(
        "cargo:rustc-env=AGENT_RUNNER_BUILD_TIME={}",
        Utc::now().to_rfc3339()
    );
    println!("cargo:rerun-if-changed=build.rs");
}
