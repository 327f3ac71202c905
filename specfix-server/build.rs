fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Pass through SPECFIX_GIT_HASH from a packaged build environment
    println!("cargo:rerun-if-env-changed=SPECFIX_GIT_HASH");
    if let Ok(hash) = std::env::var("SPECFIX_GIT_HASH") {
        println!("cargo:rustc-env=SPECFIX_GIT_HASH={}", hash);
    }
}
