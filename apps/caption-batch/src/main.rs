use captioning::{load_engine, BatchConfig, BatchJob, BatchOptions, EngineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // also loads .env, so it goes before any config
    analytics_tracing::init_tracing();

    let engine_config = EngineConfig::from_env()?;
    let batch_config = BatchConfig::from_env()?;
    tracing::info!("{:?}", batch_config);

    let engine = load_engine(&engine_config).await?;
    let job = BatchJob::new(engine, BatchOptions::from(&batch_config));

    match job
        .run(&batch_config.images_url, &batch_config.output_archive)
        .await
    {
        Ok(report) => {
            for (name, e) in report.failed.iter() {
                tracing::warn!("{} was not captioned: {}", name, e);
            }
            tracing::info!(
                "{} captions written to {}",
                report.captioned.len(),
                batch_config.output_archive.display()
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("caption batch failed: {}", e);
            Err(e.into())
        }
    }
}
