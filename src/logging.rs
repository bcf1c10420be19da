// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Log and trace setup for binaries and tests.
//!
//! Logs always go to stderr, since stdout carries the wire protocol.
//! Traces are only collected if an OpenTelemetry endpoint is given.

use std::borrow::Cow;

use fastrace::collector::Config;
use fastrace_opentelemetry::OpenTelemetryReporter;
use logforth::color::LevelColor;
use logforth::filter::EnvFilter;
use logforth::{Layout, append};
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;

#[derive(Clone, Copy, Debug)]
struct MinimalLogforthLayout;

impl Layout for MinimalLogforthLayout {
    fn format(
        &self,
        record: &log::Record,
        _: &[Box<dyn logforth::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let colors = LevelColor::default();
        let level = colors.colorize_record_level(false, record.level());
        let target = record.target();
        let message = record.args();
        Ok(format!("{level:>5} {target}: {message}").into_bytes())
    }
}

/// Enables logging to stderr with a minimal layout.
///
/// The filter is taken from `RUST_LOG`, defaulting to `murmur=debug,info`.
pub fn enable_logforth() {
    enable_logforth_append(append::Stderr::default().with_layout(MinimalLogforthLayout));
}

fn enable_logforth_append<A: logforth::Append>(to_append: A) {
    let filter = EnvFilter::from_default_env_or("murmur=debug,info");
    logforth::builder()
        .dispatch(|d| d.filter(filter).append(to_append))
        .apply();
}

/// Reports `fastrace` spans to the OpenTelemetry collector at `endpoint`.
///
/// Call [`fastrace::flush`] before exiting to not lose any spans.
///
/// # Errors
///
/// Returns an error if the OTLP exporter can not be built.
pub fn enable_fastrace_otlp(
    endpoint: &str,
    service_name: &'static str,
) -> color_eyre::Result<()> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.to_string())
        .with_protocol(opentelemetry_otlp::Protocol::Grpc)
        .with_timeout(opentelemetry_otlp::OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT)
        .build()?;
    let reporter = OpenTelemetryReporter::new(
        exporter,
        Cow::Owned(
            Resource::builder()
                .with_attributes([KeyValue::new("service.name", service_name)])
                .build(),
        ),
        InstrumentationScope::builder("murmur")
            .with_version(env!("CARGO_PKG_VERSION"))
            .build(),
    );
    fastrace::set_reporter(reporter, Config::default());
    Ok(())
}
