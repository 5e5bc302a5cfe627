// build.rs
// This script configures the Rust compiler to optimize release builds
// specifically for the CPU of the machine performing the compilation.

use std::env;

fn main() {
    // Tell Cargo to only re-run this build script if build.rs itself changes.
    println!("cargo:rerun-if-changed=build.rs");

    // Get the current build profile. Cargo sets this environment variable.
    // We only want to apply aggressive optimizations for 'release' builds.
    let profile = env::var("PROFILE").unwrap_or_else(|_| {
        eprintln!("[build.rs] WARN: PROFILE environment variable not found. Assuming 'debug' build.");
        "debug".to_string()
    });

    if profile == "release" {
        // "-C target-cpu=native" lets rustc use every instruction-set
        // extension of the build host, which the dense eigendecomposition
        // and bootstrap loops benefit from.
        println!("cargo:rustc-flags=-C target-cpu=native");

        eprintln!("[build.rs] Configuring for RELEASE build: Applying '-C target-cpu=native'.");
    } else {
        eprintln!("[build.rs] Profile: '{}'. No specific optimization flags applied by this script.", profile);
    }
}
