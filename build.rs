fn main() {
    // Sidecar binaries are discovered by target triple suffix at runtime.
    println!(
        "cargo:rustc-env=TARGET={}",
        std::env::var("TARGET").expect("cargo sets TARGET")
    );
}
