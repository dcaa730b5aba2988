use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "farmrelay", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file path
    #[arg(short, long = "config", value_name = "FILE")]
    pub config_path: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default)
    Serve(ServeArgs),

    /// Generate sample configuration
    ConfigSample {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load, validate and print the effective configuration
    CheckConfig,
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Bind host for both listeners
    #[arg(long)]
    pub host: Option<String>,

    /// WebSocket port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// HTTP API port
    #[arg(long)]
    pub api_port: Option<u16>,

    /// SQLite database file
    #[arg(long, value_name = "FILE")]
    pub database: Option<PathBuf>,

    /// Verbose logging
    #[arg(long)]
    pub dev: bool,
}

impl ServeArgs {
    /// Command-line flags win over file and environment settings
    pub fn apply(&self, config: &mut farmrelay_core::Config) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(port) = self.api_port {
            config.server.api_port = port;
        }
        if let Some(path) = &self.database {
            config.storage.database_path = path.clone();
        }
        if self.dev {
            config.logging.level = "debug".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_none() {
        let cli = Cli::parse_from(["farmrelay"]);
        assert!(cli.command.is_none());
        assert!(cli.config_path.is_none());
    }

    #[test]
    fn test_serve_flags_override_config() {
        let cli = Cli::parse_from([
            "farmrelay",
            "--config",
            "relay.yaml",
            "serve",
            "--port",
            "9000",
            "--database",
            "/tmp/relay.db",
            "--dev",
        ]);
        assert_eq!(cli.config_path.as_deref(), Some("relay.yaml"));

        let Some(Commands::Serve(args)) = cli.command else {
            panic!("expected serve");
        };
        let mut config = farmrelay_core::Config::default();
        args.apply(&mut config);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.api_port, 8001);
        assert_eq!(config.storage.database_path, PathBuf::from("/tmp/relay.db"));
        assert_eq!(config.logging.level, "debug");
    }
}
