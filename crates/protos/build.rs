fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Compile the vendored CAS protos with tonic-build
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        // Make Digest hashable for use in HashMaps and HashSets
        .type_attribute(
            "build.bazel.remote.execution.v2.Digest",
            "#[derive(Eq, Hash)]",
        )
        .compile_protos(
            &[
                "proto/build/bazel/remote/execution/v2/remote_execution.proto",
                "proto/google/bytestream/bytestream.proto",
                "proto/buildstream/v2/buildstream.proto",
            ],
            &["proto"],
        )?;

    Ok(())
}
