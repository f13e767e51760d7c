// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugdesk - plugin runtime for helpdesk extensions.
//!
//! This is the binary entry point and composition root.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod plugins;
mod serve;
mod shutdown;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Plugdesk - plugin runtime for helpdesk extensions.
#[derive(Parser, Debug)]
#[command(name = "plugdesk", version, about, long_about = None)]
struct Cli {
    /// Configuration file. The standard search path is used when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server and plugin runtime.
    Serve,
    /// Inspect or install plugins without a running server.
    Plugins {
        #[command(subcommand)]
        action: PluginCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// List plugins found in the plugin directory.
    List,
    /// Validate and install a .wasm, .zip or .tar.gz package.
    Install {
        /// Package to install.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match plugdesk_config::load_and_validate(cli.config.as_deref()) {
        Ok(config) => config,
        Err(errors) => {
            plugdesk_config::render_errors(&errors);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Some(Commands::Serve) => serve::run_serve(config).await,
        Some(Commands::Plugins { action }) => match action {
            PluginCommands::List => plugins::list(&config),
            PluginCommands::Install { file } => plugins::install(&config, &file),
        },
        None => {
            println!("plugdesk: use --help for available commands");
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    #[cfg(not(target_env = "msvc"))]
    fn jemalloc_is_active() {
        use tikv_jemalloc_ctl::{epoch, stats};
        epoch::advance().unwrap();
        let allocated = stats::allocated::read().unwrap();
        assert!(allocated > 0, "jemalloc should report non-zero allocation");
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_install_with_global_config() {
        let cli = Cli::try_parse_from([
            "plugdesk",
            "plugins",
            "install",
            "reports.zip",
            "--config",
            "/etc/plugdesk/custom.toml",
        ])
        .unwrap();
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/etc/plugdesk/custom.toml"))
        );
        match cli.command {
            Some(Commands::Plugins {
                action: PluginCommands::Install { file },
            }) => assert_eq!(file, PathBuf::from("reports.zip")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn binary_loads_config_defaults() {
        let config = plugdesk_config::load_and_validate_str("").expect("defaults are valid");
        assert_eq!(config.server.port, 8080);
    }
}
