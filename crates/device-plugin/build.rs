fn main() -> Result<(), Box<dyn std::error::Error>> {
    // servers for the plugin side, clients for the kubelet side and for tests
    tonic_build::configure().compile_protos(
        &[
            "proto/deviceplugin/v1beta1/api.proto",
            "proto/pluginregistration/v1/api.proto",
        ],
        &["proto"],
    )?;
    Ok(())
}
