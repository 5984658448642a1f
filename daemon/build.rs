fn main() {
    // Release builds stamp the commit through GIT_COMMIT.
    println!("cargo:rerun-if-env-changed=GIT_COMMIT");
    let commit = std::env::var("GIT_COMMIT")
        .ok()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| "not specified".to_string());
    println!("cargo:rustc-env=DOCKWALL_GIT_COMMIT={commit}");
}
