use std::env;
use std::fs;
use std::path::PathBuf;

// Exposes the workspace `VERSION` file to the crate as `VIPER_VERSION`.
fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("manifest dir"));
    let version_file = manifest_dir
        .ancestors()
        .nth(2)
        .expect("crate lives under <root>/crates/")
        .join("VERSION");
    println!("cargo:rerun-if-changed={}", version_file.display());

    let contents = fs::read_to_string(&version_file)
        .unwrap_or_else(|error| panic!("cannot read {}: {error}", version_file.display()));
    let version = contents.lines().next().unwrap_or_default().trim();
    if version.is_empty() {
        panic!("{} is empty", version_file.display());
    }

    println!("cargo:rustc-env=VIPER_VERSION={version}");
}
