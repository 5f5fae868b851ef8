fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only rerun if proto files change
    println!("cargo:rerun-if-changed=proto");

    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .bytes(["."])
        .compile_protos(
            &[
                "proto/shared.proto",
                "proto/streams.proto",
                "proto/persistent.proto",
                "proto/gossip.proto",
                "proto/serverfeatures.proto",
                "proto/v2/streams.proto",
                "proto/v2/errors.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
