use anyhow::Result;

use nl2sql_daemon::{config::AppConfig, server, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _telemetry = telemetry::init(server::SERVICE_NAME)?;
    let config = AppConfig::from_env()?;
    server::run(config).await
}
