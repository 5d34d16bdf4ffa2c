fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_root = "proto";
    let api_proto = format!("{proto_root}/deviceplugin/v1beta1/api.proto");

    println!("cargo:rerun-if-changed={api_proto}");

    // Use the bundled protoc unless the environment already provides one
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[&api_proto], &[proto_root])?;

    Ok(())
}
