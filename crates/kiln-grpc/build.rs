fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Point prost-build at a vendored `protoc` unless one is already
    // configured, so the build works without a system-wide install.
    if std::env::var_os("PROTOC").is_none() {
        // SAFETY: single-threaded build script, set before any proto
        // compilation reads the variable.
        unsafe {
            std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
        }
    }
    tonic_build::configure()
        .build_server(true)
        .build_client(true) // Useful for testing
        .compile_protos(
            &[
                "proto/kiln/v1/commands.proto",
                "proto/kiln/v1/monitor.proto",
                "proto/kiln/v1/settings.proto",
                "proto/kiln/v1/debug.proto",
            ],
            &["proto/"],
        )?;
    Ok(())
}
