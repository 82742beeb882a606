//! Build script for generating Rust code from the CNI protobuf definition.
//!
//! Generation is opt-in (`--features codegen`) so that normal builds do not
//! require protoc; the generated module is checked in under src/generated.

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only regenerate when explicitly requested.
    if std::env::var_os("CARGO_FEATURE_CODEGEN").is_none() {
        return Ok(());
    }

    let out_dir = PathBuf::from("src/generated");
    std::fs::create_dir_all(&out_dir)?;

    let proto = PathBuf::from("proto/cni.proto");
    println!("cargo:rerun-if-changed={}", proto.display());

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(&out_dir)
        .compile(&[proto], &[PathBuf::from("proto")])?;

    Ok(())
}
