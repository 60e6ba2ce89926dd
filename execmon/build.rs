use std::{
    env, fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

/// Set to skip compiling the BPF programs (no nightly or bpf-linker on the
/// build host). The binary then fails at load time instead.
const SKIP_VAR: &str = "EXECMON_SKIP_EBPF_BUILD";

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let out_file = out_dir.join("execmon");

    println!("cargo:rerun-if-changed=../execmon-ebpf/src");
    println!("cargo:rerun-if-changed=../execmon-common/src");
    println!("cargo:rerun-if-env-changed={SKIP_VAR}");

    if env::var_os(SKIP_VAR).is_some() {
        println!("cargo:warning={SKIP_VAR} set, not building eBPF programs");
        write_placeholder(&out_file);
        return;
    }

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let bpf_target = match arch.as_str() {
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" => "bpfeb-unknown-none",
        _ => "bpfel-unknown-none",
    };

    // A separate target directory keeps the nested cargo off the outer build's lock.
    let ebpf_target_dir = out_dir.join("ebpf-target");
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir(Path::new("../execmon-ebpf"))
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .args([
            "build",
            "--release",
            &format!("--target={bpf_target}"),
            "-Z",
            "build-std=core",
        ])
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status();

    let built = ebpf_target_dir.join(format!("{bpf_target}/release/execmon"));
    match status {
        Ok(status) if status.success() => {
            if let Err(e) = fs::copy(&built, &out_file) {
                println!("cargo:warning=Failed to copy {}: {e}", built.display());
                write_placeholder(&out_file);
            }
        }
        Ok(status) => {
            println!("cargo:warning=eBPF build failed ({status}); `execmon run` will not load");
            write_placeholder(&out_file);
        }
        Err(e) => {
            println!("cargo:warning=Failed to run cargo for eBPF build: {e}");
            write_placeholder(&out_file);
        }
    }
}

fn write_placeholder(path: &Path) {
    fs::write(path, []).expect("OUT_DIR is writable");
}
