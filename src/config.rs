use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tether_server::{BrokerConfig, DEFAULT_CONFIG_PATH};

#[derive(Debug, Parser)]
#[command(name = "tether")]
#[command(version, about = "Multiplayer session broker")]
pub struct Args {
    /// TOML file with broker tunables.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Override the TCP listen port.
    #[arg(short, long)]
    pub port: Option<u16>,

    #[arg(long, help = "Override the UDP listen port (0 disables UDP)")]
    pub udp_port: Option<u16>,

    #[arg(long, help = "Directory for the file store and channel snapshots")]
    pub data_dir: Option<PathBuf>,

    #[arg(short, long)]
    pub name: Option<String>,

    #[arg(long = "admin-password", help = "Seed an admin password (repeatable)")]
    pub admin_passwords: Vec<String>,

    #[arg(long, help = "Write the effective config back to --config and exit")]
    pub write_config: bool,
}

impl Args {
    /// Load the config file and apply command-line overrides.
    pub fn resolve(&self) -> BrokerConfig {
        self.apply(BrokerConfig::load_from_path(&self.config))
    }

    pub fn apply(&self, mut config: BrokerConfig) -> BrokerConfig {
        if let Some(port) = self.port {
            config.tcp_bind.set_port(port);
        }
        match self.udp_port {
            Some(0) => config.udp_bind = None,
            Some(port) => {
                let ip = config.udp_bind.unwrap_or(config.tcp_bind).ip();
                config.udp_bind = Some(SocketAddr::new(ip, port));
            }
            None => {}
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(name) = &self.name {
            config.server_name = name.clone();
        }
        for password in &self.admin_passwords {
            if !config.admin_passwords.contains(password) {
                config.admin_passwords.push(password.clone());
            }
        }
        config
    }
}
