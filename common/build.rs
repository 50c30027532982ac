fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so the build does not depend on a system install
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    println!("cargo:rerun-if-changed=proto/yggdrasil.proto");
    tonic_build::compile_protos("proto/yggdrasil.proto")?;
    Ok(())
}
