use anyhow::Context;
use docksmith_client::entities::logger::{LogConfig, StdioLogMode};
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
  Layer, Registry, layer::SubscriberExt,
  util::SubscriberInitExt,
};

mod otel;

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let log_level: tracing::Level = config.level.into();

  let registry =
    Registry::default().with(LevelFilter::from(log_level));

  let stdio = match config.stdio {
    StdioLogMode::Standard if config.pretty => Some(
      tracing_subscriber::fmt::layer()
        .pretty()
        .with_file(false)
        .with_line_number(false)
        .boxed(),
    ),
    StdioLogMode::Standard => Some(
      tracing_subscriber::fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .boxed(),
    ),
    StdioLogMode::Json => {
      Some(tracing_subscriber::fmt::layer().json().boxed())
    }
    StdioLogMode::None => None,
  };

  let otel = (!config.otlp_endpoint.is_empty()).then(|| {
    let tracer = otel::tracer(
      &config.otlp_endpoint,
      config.opentelemetry_service_name.clone(),
    );
    OpenTelemetryLayer::new(tracer).boxed()
  });

  if stdio.is_none() && otel.is_none() {
    return Ok(());
  }

  registry
    .with(stdio)
    .with(otel)
    .try_init()
    .context("failed to init logger")
}
