use kube::{Client, CustomResourceExt};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use monitoring_operator::{
    config::Config,
    controller,
    crd::{Prometheus, PrometheusAgent, PrometheusRule},
    error::Error,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    if std::env::args().nth(1).as_deref() == Some("crd") {
        for crd in [
            Prometheus::crd(),
            PrometheusAgent::crd(),
            PrometheusRule::crd(),
        ] {
            print!("---\n{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;
    let client = Client::try_default().await?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting monitoring-operator");

    controller::run(client, config).await
}
