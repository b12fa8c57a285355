//! Build script for compiling the dispatch protobuf definitions into Rust code

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=proto/firewatch.proto");
    tonic_build::configure().compile(&["proto/firewatch.proto"], &["proto"])?;
    Ok(())
}
