use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

use super::PluginServerError;

/// Opens a gRPC channel to the Unix socket at `path`, giving up after `timeout`.
pub async fn connect(path: &Path, timeout: Duration) -> Result<Channel, Report<PluginServerError>> {
    let socket_path = path.to_path_buf();
    let display = || path.display().to_string();

    // the URI is a placeholder, the connector ignores it
    let endpoint = Endpoint::from_static("http://tonic");
    let connecting = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let socket_path = socket_path.clone();
        async move { UnixStream::connect(socket_path).await.map(TokioIo::new) }
    }));

    tokio::time::timeout(timeout, connecting)
        .await
        .change_context_lazy(|| PluginServerError::DialTimeout { path: display() })?
        .change_context_lazy(|| PluginServerError::Dial { path: display() })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn missing_socket_fails_to_dial() {
        let dir = TempDir::new().unwrap();

        let err = connect(&dir.path().join("absent.sock"), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            PluginServerError::Dial { .. } | PluginServerError::DialTimeout { .. }
        ));
    }
}
