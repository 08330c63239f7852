// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Command-line front end for the MCP catalog
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

use mcp_catalog::catalog::descriptors::StaticDescriptors;
use mcp_catalog::config::{Config, LifecyclePolicy};
use mcp_catalog::Orchestrator;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server descriptor file (JSON or YAML)
    #[arg(long, global = true)]
    servers: Option<PathBuf>,

    /// keep_running or stop_after_discovery
    #[arg(long, global = true)]
    lifecycle: Option<LifecyclePolicy>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether each server's required environment is present
    Check {
        /// Only this server
        name: Option<String>,
    },
    /// Run a discovery pass and print the report
    Discover,
    /// List discovered tools
    Tools {
        /// Case-insensitive filter over names and descriptions
        #[arg(long)]
        search: Option<String>,
    },
    /// Discover, then call one tool by display name (server__tool)
    Call {
        display_name: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    install_panic_hook();

    let mut config = Config::from_env();
    if let Some(path) = &cli.servers {
        config.servers_path = Some(path.clone());
    }
    if let Some(lifecycle) = cli.lifecycle {
        config.lifecycle = lifecycle;
    }
    init_tracing(&config);

    match run(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &Config) -> Result<ExitCode> {
    let Some(path) = &config.servers_path else {
        bail!("no server descriptors: pass --servers or set MCP_CATALOG_SERVERS");
    };
    let descriptors = StaticDescriptors::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    info!(servers = descriptors.len(), lifecycle = %config.lifecycle, "Catalog starting");

    let orchestrator = Orchestrator::from_config(config, Arc::new(descriptors));
    let result = execute(&orchestrator, command).await;
    // Children never outlive the command.
    orchestrator.shutdown().await;
    result
}

async fn execute(orchestrator: &Orchestrator, command: Command) -> Result<ExitCode> {
    match command {
        Command::Check { name } => {
            let names = match name {
                Some(name) => vec![name],
                None => orchestrator.descriptor_names(),
            };
            let mut all_ready = true;
            let mut out = Vec::new();
            for name in names {
                let readiness = orchestrator.check_readiness(&name)?;
                all_ready &= readiness.ready;
                out.push(readiness);
            }
            print_json(&out)?;
            Ok(exit_code(all_ready))
        }
        Command::Discover => {
            let report = orchestrator.discover().await;
            print_json(&report)?;
            Ok(exit_code(report.succeeded().count() > 0 || report.servers.is_empty()))
        }
        Command::Tools { search } => {
            orchestrator.discover().await;
            let tools = match search {
                Some(query) => orchestrator.search_tools(&query),
                None => orchestrator.list_tools(),
            };
            print_json(&tools)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Call { display_name, args } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            orchestrator.discover().await;
            match orchestrator.invoke_payload(&display_name, arguments).await {
                Ok(result) => {
                    print_json(&result)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(payload) => {
                    print_json(&serde_json::json!({ "error": payload }))?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("PANIC: {} at {}", message, location);
    }));
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output only.
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
