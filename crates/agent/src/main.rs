// Copyright (C) 2025-present The ProbeWatch Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use futures_util::future::join_all;
use probewatch_agent::{
    config::AgentConfig, init_aggregation, payload::PayloadFormat, AggregateUpdates,
    AggregationPipeline,
};
use std::{env, path::PathBuf, str::FromStr};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn, Level};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn init_tracing(level: &'_ str) -> Result<(), BoxError> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::from_str(level)?)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Feed stdin lines to the aggregation until EOF
async fn read_input(
    format: PayloadFormat,
    pipeline: AggregationPipeline,
) -> Result<(), BoxError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let probe = match format.decode(&line) {
            Ok(probe) => probe,
            Err(err) => {
                warn!("Dropping input line {line_no}: {err}");
                continue;
            }
        };
        pipeline.route(probe).await?;
    }
    Ok(())
}

async fn log_updates(updates: AggregateUpdates) {
    while let Ok(update) = updates.recv().await {
        debug!(
            key = %update.key,
            average_speed = update.aggregates.average_speed,
            average_acceleration = update.aggregates.average_acceleration,
            move_distance = update.aggregates.move_distance,
            window_len = update.aggregates.window_len,
            "Aggregates updated"
        );
        for alert in &update.alerts {
            warn!(
                key = %update.key,
                condition = %alert.condition_id,
                "Alert: {} {} {} (observed {})",
                alert.metric,
                alert.operator,
                alert.threshold,
                alert.observed
            );
        }
    }
}

fn main() -> Result<(), BoxError> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        return Err(format!("Usage: {} <config-file>", args[0]).into());
    }
    let config_file = PathBuf::from(&args[1]);
    let config: AgentConfig = match Figment::new()
        .merge(Yaml::file(config_file))
        .merge(Env::prefixed("PW_").split("__"))
        .extract()
    {
        Ok(config) => config,
        Err(err) => {
            return Err(format!("Parsing config file failed: {err}").into());
        }
    };
    config.validate()?;
    init_tracing(&config.logging.level)?;

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    // If num threads is not configured then the default use all CPU cores is used
    if let Some(num_threads) = config.runtime.threads {
        runtime_builder.worker_threads(num_threads);
    }
    runtime_builder.enable_all();
    let runtime = runtime_builder.build()?;
    let result = runtime.block_on(async move {
        let meter = opentelemetry::global::meter("probewatch");
        let (join_handles, pipeline, updates) =
            init_aggregation(&config.aggregation, config.alerts.clone(), meter)?;
        let logger = tokio::spawn(log_updates(updates));
        let input = tokio::spawn(read_input(config.input.format, pipeline.clone()));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Termination signal received, gracefully shutting down actors");
                if let Err(err) = pipeline.shutdown().await {
                    warn!("Failed to shut down aggregation actors: {err}");
                }
            }
            result = input => {
                match result {
                    Ok(Ok(())) => info!("Input closed, draining aggregation actors"),
                    Ok(Err(err)) => warn!("Input terminated: {err}"),
                    Err(err) => warn!("Input task failed: {err}"),
                }
                pipeline.close();
            }
        }

        let shutdown_timeout = config.aggregation.shutdown_timeout;
        match tokio::time::timeout(shutdown_timeout, join_all(join_handles)).await {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(Ok(msg)) => debug!("{msg}"),
                        Ok(Err(err)) => warn!("Aggregation actor failed: {err}"),
                        Err(err) => warn!("Aggregation actor task failed: {err}"),
                    }
                }
                // The update channel closes once every actor is gone
                if let Err(err) = logger.await {
                    warn!("Update logger task failed: {err}");
                }
            }
            Err(_) => warn!("Aggregation actors did not stop within {shutdown_timeout:?}"),
        }
        Ok::<(), BoxError>(())
    });
    // Do not wait on the blocking stdin reader
    runtime.shutdown_background();
    result
}
