// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Log output of the harness.
//!
//! Every line names the harness module it came from, so round progress
//! (`driver`), grinding (`grinding`) and replication (`propagation`) can be
//! told apart without timestamps. `RUST_LOG` overrides [`DEFAULT_FILTER`].

use logforth::color::LevelColor;
use logforth::filter::EnvFilter;
use logforth::{Layout, append};

/// Harness debug output plus `info` from dependencies.
pub const DEFAULT_FILTER: &str = "grinding_attack=debug,info";

/// One line per record: level, harness module, message.
#[derive(Clone, Copy, Debug)]
struct HarnessLayout;

impl Layout for HarnessLayout {
    fn format(
        &self,
        record: &log::Record,
        _: &[Box<dyn logforth::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let colors = LevelColor::default();
        let level = colors.colorize_record_level(false, record.level());
        let module = short_module(record.target());
        let message = record.args();
        Ok(format!("{level:>5} [{module}] {message}").into_bytes())
    }
}

/// Strips the crate name from a log target, `grinding_attack::network::tcp` gives `network::tcp`.
fn short_module(target: &str) -> &str {
    target
        .strip_prefix(concat!(env!("CARGO_CRATE_NAME"), "::"))
        .unwrap_or(target)
}

/// Logs to stderr.
pub fn enable_logforth() {
    let filter = EnvFilter::from_default_env_or(DEFAULT_FILTER);
    logforth::builder()
        .dispatch(|d| {
            d.filter(filter)
                .append(append::Stderr::default().with_layout(HarnessLayout))
        })
        .apply();
}

/// Logs to stderr and also records every line as an event on the current span.
///
/// Used when spans are exported, so grinding progress shows up in the trace.
pub fn enable_logforth_with_spans() {
    let filter = EnvFilter::from_default_env_or(DEFAULT_FILTER);
    logforth::builder()
        .dispatch(|d| {
            d.filter(filter)
                .append(append::Stderr::default().with_layout(HarnessLayout))
                .append(append::FastraceEvent::default())
        })
        .apply();
}

#[cfg(test)]
mod tests {
    use log::{Level, debug, error, info, log_enabled, trace, warn};

    use super::*;

    #[test]
    fn module_names() {
        assert_eq!(short_module("grinding_attack::driver"), "driver");
        assert_eq!(short_module("grinding_attack::network::tcp"), "network::tcp");
        assert_eq!(short_module("tokio::net"), "tokio::net");
    }

    #[test]
    fn basic() {
        enable_logforth();

        // the harness logs down to "debug", everything else at "info"
        assert!(log_enabled!(Level::Error));
        assert!(log_enabled!(Level::Warn));
        assert!(log_enabled!(Level::Info));
        assert!(log_enabled!(Level::Debug));
        assert!(!log_enabled!(Level::Trace));
        assert!(!log_enabled!(target: "other_crate", Level::Debug));

        trace!("trace");
        debug!("debug");
        info!("info");
        warn!("warn");
        error!("error");
    }
}
