use ict_engine::application::system::Application;
use ict_engine::domain::settings::Settings;
use tracing::{error, info, Level};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("initializing ict-engine");

    let config_path = std::env::var("ICT_CONFIG_PATH").ok();
    let settings = Settings::load(config_path.as_deref())?;

    let app = match Application::bootstrap(settings).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "failed to bootstrap application");
            return Err(e);
        }
    };

    app.run().await
}
