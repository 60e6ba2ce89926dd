use which::which;

/// Rebuild the programs whenever the linker changes, since `cargo` has no
/// way of knowing the BPF object depends on it.
fn main() {
    match which("bpf-linker") {
        Ok(linker) => println!("cargo:rerun-if-changed={}", linker.display()),
        Err(e) => println!("cargo:warning=bpf-linker not found in PATH: {e}"),
    }
}
