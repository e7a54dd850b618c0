use anyhow::Context as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let cfg = swarm_node::config_io::load_or_create_config(&config_path)
        .await
        .with_context(|| format!("unable to read or create {config_path}"))?;

    swarm_node::config::init_tracing(&cfg);
    tracing::info!(config = %config_path, "swarm-node booted");

    swarm_node::app::run(cfg).await
}
