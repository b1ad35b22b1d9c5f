//! Kubelet-facing side of the plugin: the device plugin and plugin
//! registration gRPC services, served over a Unix domain socket.

#![allow(clippy::doc_markdown)]

pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub mod registration {
    tonic::include_proto!("pluginregistration");
}

pub mod device_plugin;
pub mod uds;

pub use device_plugin::PluginServer;
pub use device_plugin::PluginServerConfig;
pub use device_plugin::PluginServerError;
pub use device_plugin::ServerState;

/// Device plugin API version spoken with the kubelet.
pub const API_VERSION: &str = "v1beta1";
