use std::process::Command;

fn main() {
    tauri_build::build();

    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", utc_timestamp());
    println!("cargo:rustc-env=BUILD_GIT_SHA={}", git_short_sha());
    println!("cargo:rerun-if-changed=.git/HEAD");
}

fn run_trimmed(program: &str, args: &[&str]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn git_short_sha() -> String {
    run_trimmed("git", &["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".into())
}

/// UTC ISO-8601 build time without pulling chrono into the build script.
fn utc_timestamp() -> String {
    run_trimmed("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])
        .or_else(|| {
            run_trimmed(
                "powershell",
                &[
                    "-Command",
                    "(Get-Date).ToUniversalTime().ToString('yyyy-MM-ddTHH:mm:ssZ')",
                ],
            )
        })
        .unwrap_or_else(|| "unknown".into())
}
