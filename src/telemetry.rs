//! Process-wide logging and OpenTelemetry providers for the binaries
//!
//! Logs go to stdout through `tracing-subscriber`: JSON lines by default,
//! human-readable with `SHARDHOUSE_LOG_FORMAT=pretty`. `RUST_LOG` directives
//! refine the level given on the command line. Instruments and spans record
//! into the global OpenTelemetry providers installed here, and every signal
//! carries the cluster shape as resource attributes.

use crate::config::ClusterConfig;
use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(Error::Config(format!(
                "SHARDHOUSE_LOG_FORMAT must be json or pretty, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    /// Groups the signals of one load test or experiment
    pub run_id: Option<String>,
    pub resource_attributes: Vec<KeyValue>,
    sampler: Sampler,
}

impl TelemetryConfig {
    /// Read `OTEL_SERVICE_NAME`, `OTEL_RESOURCE_ATTRIBUTES`,
    /// `OTEL_TRACES_SAMPLER[_ARG]`, `SHARDHOUSE_LOG_FORMAT` and
    /// `SHARDHOUSE_RUN_ID`
    pub fn from_env(default_service_name: &str, cluster: &ClusterConfig) -> Result<Self> {
        let service_name = env_var("OTEL_SERVICE_NAME")
            .unwrap_or_else(|| default_service_name.to_string());
        if service_name.is_empty() {
            return Err(Error::Config("service name cannot be empty".into()));
        }
        let log_format = env_var("SHARDHOUSE_LOG_FORMAT")
            .map(|raw| raw.parse::<LogFormat>())
            .transpose()?
            .unwrap_or_default();
        let run_id = env_var("SHARDHOUSE_RUN_ID");
        let sampler = sampler_from(
            env_var("OTEL_TRACES_SAMPLER").as_deref(),
            env_var("OTEL_TRACES_SAMPLER_ARG").as_deref(),
        )?;

        let extra = match env_var("OTEL_RESOURCE_ATTRIBUTES") {
            Some(raw) => parse_resource_attributes(&raw)?,
            None => Vec::new(),
        };
        let resource_attributes =
            resource_attributes(&service_name, run_id.as_deref(), cluster, extra);

        Ok(Self {
            service_name,
            log_format,
            run_id,
            resource_attributes,
            sampler,
        })
    }
}

/// Keeps the SDK providers alive; dropping it flushes and shuts them down
pub struct Telemetry {
    config: TelemetryConfig,
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(config: TelemetryConfig, log_level: &str) -> Result<Self> {
        let level = parse_log_level(log_level)?;
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(level).into())
            .from_env_lossy();
        let builder = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true);
        let installed = match config.log_format {
            LogFormat::Json => builder.with_thread_ids(true).json().try_init(),
            LogFormat::Pretty => builder.pretty().try_init(),
        };
        installed.map_err(|e| Error::Config(format!("log subscriber: {e}")))?;

        let resource = Resource::new(config.resource_attributes.clone());
        let tracer_provider = TracerProvider::builder()
            .with_config(
                trace::Config::default()
                    .with_sampler(config.sampler.clone())
                    .with_resource(resource.clone()),
            )
            .build();
        let _ = global::set_tracer_provider(tracer_provider.clone());
        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        global::set_meter_provider(meter_provider.clone());
        global::set_text_map_propagator(TraceContextPropagator::new());

        info!(
            service_name = %config.service_name,
            log_format = ?config.log_format,
            run_id = config.run_id.as_deref().unwrap_or("none"),
            "Telemetry initialized"
        );
        Ok(Self {
            config,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn run_id(&self) -> Option<&str> {
        self.config.run_id.as_deref()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let _ = self.meter_provider.shutdown();
        let _ = self.tracer_provider.shutdown();
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `OTEL_RESOURCE_ATTRIBUTES` first, then the attributes this process owns,
/// which win on a clash
fn resource_attributes(
    service_name: &str,
    run_id: Option<&str>,
    cluster: &ClusterConfig,
    extra: Vec<(String, String)>,
) -> Vec<KeyValue> {
    let mut attrs: BTreeMap<String, String> = extra.into_iter().collect();
    attrs
        .entry("service.namespace".into())
        .or_insert_with(|| "shardhouse".into());
    attrs.insert("service.name".into(), service_name.to_string());
    attrs.insert("service.version".into(), env!("CARGO_PKG_VERSION").into());
    attrs.insert("shardhouse.shard_groups".into(), cluster.shard_groups.to_string());
    attrs.insert(
        "shardhouse.replicas_per_group".into(),
        cluster.replicas_per_group.to_string(),
    );
    attrs.insert(
        "shardhouse.partition".into(),
        format!("{:?}", cluster.partition).to_ascii_lowercase(),
    );
    if let Some(run_id) = run_id {
        attrs.insert("shardhouse.run_id".into(), run_id.to_string());
    }
    attrs
        .into_iter()
        .map(|(k, v)| KeyValue::new(k, v))
        .collect()
}

fn parse_log_level(raw: &str) -> Result<Level> {
    Level::from_str(raw.trim()).map_err(|_| {
        Error::Config(format!(
            "invalid log level '{raw}', expected trace, debug, info, warn or error"
        ))
    })
}

fn sampler_from(name: Option<&str>, arg: Option<&str>) -> Result<Sampler> {
    let ratio = || -> Result<f64> {
        let raw = arg.ok_or_else(|| {
            Error::Config("OTEL_TRACES_SAMPLER_ARG is required for ratio samplers".into())
        })?;
        match raw.parse::<f64>() {
            Ok(v) if (0.0..=1.0).contains(&v) => Ok(v),
            _ => Err(Error::Config(format!(
                "OTEL_TRACES_SAMPLER_ARG must be a ratio in [0, 1], got '{raw}'"
            ))),
        }
    };
    let name = name.unwrap_or("parentbased_always_on").to_ascii_lowercase();
    let (parent_based, root) = match name.strip_prefix("parentbased_") {
        Some(root) => (true, root),
        None => (false, name.as_str()),
    };
    let root = match root {
        "always_on" => Sampler::AlwaysOn,
        "always_off" => Sampler::AlwaysOff,
        "traceidratio" => Sampler::TraceIdRatioBased(ratio()?),
        _ => {
            return Err(Error::Config(format!(
                "unsupported OTEL_TRACES_SAMPLER '{name}'"
            )))
        }
    };
    Ok(if parent_based {
        Sampler::ParentBased(Box::new(root))
    } else {
        root
    })
}

fn parse_resource_attributes(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' is not key=value"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_attributes_parse() {
        let attrs = parse_resource_attributes("deployment.environment=dev, ,host.name = a").unwrap();
        assert_eq!(
            attrs,
            vec![
                ("deployment.environment".to_string(), "dev".to_string()),
                ("host.name".to_string(), "a".to_string()),
            ]
        );
        assert!(parse_resource_attributes("broken").is_err());
        assert!(parse_resource_attributes("=value").is_err());
    }

    #[test]
    fn test_cluster_shape_is_a_resource_attribute() {
        let cluster = ClusterConfig::for_testing(4, 3);
        let attrs = resource_attributes(
            "shardhouse",
            Some("run-7"),
            &cluster,
            vec![("service.name".into(), "overridden".into())],
        );
        let get = |key: &str| {
            attrs
                .iter()
                .find(|kv| kv.key.as_str() == key)
                .map(|kv| kv.value.to_string())
        };
        assert_eq!(get("service.name").as_deref(), Some("shardhouse"));
        assert_eq!(get("shardhouse.shard_groups").as_deref(), Some("4"));
        assert_eq!(get("shardhouse.replicas_per_group").as_deref(), Some("3"));
        assert_eq!(get("shardhouse.partition").as_deref(), Some("hashrange"));
        assert_eq!(get("shardhouse.run_id").as_deref(), Some("run-7"));
    }

    #[test]
    fn test_log_settings() {
        assert_eq!(parse_log_level(" warn ").unwrap(), Level::WARN);
        assert!(parse_log_level("chatty").is_err());
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_sampler_names() {
        assert!(matches!(sampler_from(None, None), Ok(Sampler::ParentBased(_))));
        assert!(matches!(
            sampler_from(Some("always_off"), None),
            Ok(Sampler::AlwaysOff)
        ));
        assert!(sampler_from(Some("traceidratio"), None).is_err());
        assert!(sampler_from(Some("traceidratio"), Some("1.5")).is_err());
        assert!(matches!(
            sampler_from(Some("parentbased_traceidratio"), Some("0.25")),
            Ok(Sampler::ParentBased(_))
        ));
        assert!(sampler_from(Some("sometimes"), None).is_err());
    }
}
