use anyhow::Context;

use teamcache_lib::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_default().context("loading configuration")?;
    teamcache_lib::logging::init_logging(&config.log)?;
    tracing::info!(database = %config.database_path.display(), "starting teamcache");
    teamcache_lib::run(config).await.context("teamcache exited with an error")
}
