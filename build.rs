use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only rerun if proto files change
    println!("cargo:rerun-if-changed=proto/maestro/testing.proto");

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    // The testing package backs test_utils: services with known schemas that
    // the reflection and execution tests run against.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("maestro_testing_descriptor.bin"))
        .compile_protos(&["proto/maestro/testing.proto"], &["proto"])?;
    Ok(())
}
