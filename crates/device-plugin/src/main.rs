use anyhow::Result;
use clap::Parser;
use furiosa_device_plugin::app::Application;
use furiosa_device_plugin::config::Cli;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    utils::logging::init(cli.verbose);

    tracing::info!("Starting furiosa device plugin {}", &**version::VERSION);
    if let Some(branch) = version::branch() {
        tracing::debug!("built from branch {branch}");
    }

    let mut app = Application::build(&cli).await?;

    let result = app.run().await;
    app.shutdown().await;

    result
}
