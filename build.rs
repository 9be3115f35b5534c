use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");

    // Embed build timestamp for version reporting
    let timestamp = Command::new("date")
        .args(["-u", "+%Y-%m-%d %H:%M:%S UTC"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=HAWKEYE_BUILD_TIME={}", timestamp.trim());

    // Embed git short SHA
    let git_sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .filter(|sha| !sha.trim().is_empty())
        .unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=HAWKEYE_GIT_SHA={}", git_sha.trim());
}
