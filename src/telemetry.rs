//! Telemetry bootstrap for the logbarrel node.

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const ATTR_SERVICE_NAME: &str = "service.name";
const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";
const ATTR_SERVICE_INSTANCE_ID: &str = "service.instance.id";
const ATTR_LOGBARREL_RUN_ID: &str = "logbarrel.run_id";

/// Whether SDK providers are installed or only structured logs are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    LogsOnly,
    Sdk,
}

impl TelemetryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryMode::LogsOnly => "logs_only",
            TelemetryMode::Sdk => "sdk",
        }
    }
}

/// Telemetry configuration read from the environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
    pub service_name: String,
    pub traces_sampler: String,
    pub run_id: Option<String>,
    pub resource_attributes: Vec<KeyValue>,
    sampler: Sampler,
}

impl TelemetryConfig {
    /// Environment variables:
    /// - OTEL_SERVICE_NAME: overrides the component name
    /// - OTEL_RESOURCE_ATTRIBUTES: `key=value,...`
    /// - OTEL_TRACES_SAMPLER / OTEL_TRACES_SAMPLER_ARG
    /// - LOGBARREL_TELEMETRY_ENABLED: install SDK providers (default true)
    /// - LOGBARREL_RUN_ID: tags every signal with a run id
    pub fn from_env(default_service_name: &str, instance_id: &str) -> Result<Self> {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service_name.to_string());
        let service_name = service_name.trim();
        if service_name.is_empty() {
            return Err(Error::Config(
                "OTEL_SERVICE_NAME cannot be empty".to_string(),
            ));
        }

        let mode = match parse_optional_bool("LOGBARREL_TELEMETRY_ENABLED")? {
            Some(false) => TelemetryMode::LogsOnly,
            _ => TelemetryMode::Sdk,
        };

        let run_id = std::env::var("LOGBARREL_RUN_ID")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let sampler_name = std::env::var("OTEL_TRACES_SAMPLER")
            .unwrap_or_else(|_| "parentbased_always_on".to_string());
        let sampler_arg = std::env::var("OTEL_TRACES_SAMPLER_ARG").ok();
        let sampler = parse_sampler(&sampler_name, sampler_arg.as_deref())?;

        let extra = match std::env::var("OTEL_RESOURCE_ATTRIBUTES") {
            Ok(raw) => parse_resource_attributes(&raw)?,
            Err(_) => Vec::new(),
        };
        let resource_attributes =
            build_resource_attributes(service_name, instance_id, run_id.as_deref(), extra);

        Ok(Self {
            mode,
            service_name: service_name.to_string(),
            traces_sampler: sampler_name,
            run_id,
            resource_attributes,
            sampler,
        })
    }
}

fn build_resource_attributes(
    service_name: &str,
    instance_id: &str,
    run_id: Option<&str>,
    extra: Vec<(String, String)>,
) -> Vec<KeyValue> {
    let mut attr_map: BTreeMap<String, String> = extra.into_iter().collect();
    attr_map.insert(ATTR_SERVICE_NAME.to_string(), service_name.to_string());
    attr_map
        .entry(ATTR_SERVICE_NAMESPACE.to_string())
        .or_insert_with(|| "logbarrel".to_string());
    attr_map
        .entry(ATTR_SERVICE_INSTANCE_ID.to_string())
        .or_insert_with(|| instance_id.to_string());
    if let Some(run_id) = run_id {
        attr_map.insert(ATTR_LOGBARREL_RUN_ID.to_string(), run_id.to_string());
    }
    attr_map
        .into_iter()
        .map(|(k, v)| KeyValue::new(k, v))
        .collect()
}

/// Keeps the SDK providers alive for the process lifetime.
pub struct Telemetry {
    config: TelemetryConfig,
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Install the JSON log subscriber and, unless disabled, the SDK providers.
    pub fn init_for_component(
        default_service_name: &str,
        instance_id: &str,
        log_level: &str,
    ) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name, instance_id)?;
        let level = parse_log_level(log_level)?;

        FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .try_init()
            .map_err(|e| {
                Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
            })?;

        let (tracer_provider, meter_provider) = match config.mode {
            TelemetryMode::LogsOnly => (None, None),
            TelemetryMode::Sdk => {
                let resource =
                    Resource::default().merge(&Resource::new(config.resource_attributes.clone()));

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
                (Some(tracer_provider), Some(meter_provider))
            }
        };

        info!(
            service_name = %config.service_name,
            telemetry_mode = config.mode.as_str(),
            traces_sampler = %config.traces_sampler,
            run_id = %config.run_id.as_deref().unwrap_or("none"),
            "Telemetry initialized"
        );

        Ok(Self {
            config,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn run_id(&self) -> Option<&str> {
        self.config.run_id.as_deref()
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn mode(&self) -> TelemetryMode {
        self.config.mode
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.meter_provider {
            let _ = provider.shutdown();
        }
        if let Some(provider) = &self.tracer_provider {
            let _ = provider.shutdown();
        }
    }
}

pub(crate) fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

fn parse_optional_bool(name: &str) -> Result<Option<bool>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    parse_bool(name, &raw).map(Some)
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}

fn parse_sampler(name: &str, arg: Option<&str>) -> Result<Sampler> {
    match name.trim().to_ascii_lowercase().as_str() {
        "always_on" => Ok(Sampler::AlwaysOn),
        "always_off" => Ok(Sampler::AlwaysOff),
        "traceidratio" => Ok(Sampler::TraceIdRatioBased(parse_ratio(arg)?)),
        "parentbased_always_on" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOn))),
        "parentbased_always_off" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOff))),
        "parentbased_traceidratio" => Ok(Sampler::ParentBased(Box::new(
            Sampler::TraceIdRatioBased(parse_ratio(arg)?),
        ))),
        other => Err(Error::Config(format!(
            "OTEL_TRACES_SAMPLER '{other}' is not supported"
        ))),
    }
}

fn parse_ratio(arg: Option<&str>) -> Result<f64> {
    let raw = arg.ok_or_else(|| {
        Error::Config("OTEL_TRACES_SAMPLER_ARG is required for ratio samplers".to_string())
    })?;
    let value = raw.trim().parse::<f64>().map_err(|e| {
        Error::Config(format!(
            "OTEL_TRACES_SAMPLER_ARG must be a float in [0,1]: {e}"
        ))
    })?;
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::Config(format!(
            "OTEL_TRACES_SAMPLER_ARG must be in [0,1], got {value}"
        )));
    }
    Ok(value)
}

fn parse_resource_attributes(raw: &str) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for pair in raw.split(',') {
        let trimmed = pair.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{trimmed}' is invalid, expected key=value"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Config(
                "OTEL_RESOURCE_ATTRIBUTES contains an empty attribute key".to_string(),
            ));
        }
        attrs.push((key.to_string(), value.trim().to_string()));
    }
    Ok(attrs)
}
