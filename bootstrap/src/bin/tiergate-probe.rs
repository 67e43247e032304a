//! 自检工具：按配置组装可靠性层，做一次写读删，输出状态报告

use std::time::Duration;

use anyhow::{Context, bail};
use cache::CacheKeyParams;
use common::RequestId;
use config::AppConfig;
use tiergate_bootstrap::{MetricsRecorder, ReliabilityLayer, RuntimeConfig, init_runtime, record_layer_gauges};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| RuntimeConfig::default().config_dir);
    let config = AppConfig::load(&config_dir)
        .with_context(|| format!("failed to load configuration from {config_dir}"))?;
    init_runtime(&config);

    let metrics = match MetricsRecorder::install() {
        Ok(recorder) => Some(recorder),
        Err(e) => {
            warn!(error = %e, "Metrics disabled");
            None
        }
    };

    let layer = ReliabilityLayer::build(&config).await;

    let probe_id = RequestId::new().to_string();
    let key = layer
        .keys()
        .generate_key(&CacheKeyParams::new("probe", "tiergate-probe", probe_id.as_str()))?;
    layer
        .cache()
        .set(&key, &probe_id, Some(Duration::from_secs(60)))
        .await
        .context("probe write failed")?;
    if layer.cache().get(&key).await.as_deref() != Some(probe_id.as_str()) {
        bail!("probe value could not be read back");
    }
    layer.cache().delete(&key).await.context("probe delete failed")?;
    info!(key = %key, "Probe round trip succeeded");

    println!("{}", serde_json::to_string_pretty(&layer.report())?);
    if let Some(metrics) = metrics {
        record_layer_gauges(&layer);
        println!("{}", metrics.render());
    }

    layer.dispose();
    Ok(())
}
