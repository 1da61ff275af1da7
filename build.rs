fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var(
            "PROTOC",
            protoc_bin_vendored::protoc_bin_path().expect("failed to locate vendored protoc"),
        );
    }

    tonic_build::configure()
        .build_server(false)
        .compile(&["proto/hds.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/hds.proto");
    Ok(())
}
