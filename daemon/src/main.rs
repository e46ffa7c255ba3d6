use astro_daemon::app::run_app;
use astro_daemon::config::AppConfig;

fn init_logger(default_level: &str) {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_owned());
    pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_logger(&config.log_level);
    run_app(config).await
}
