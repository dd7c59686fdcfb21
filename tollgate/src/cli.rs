use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tollgate",
    version,
    about = "Asynchronous SMTP policy daemon with pluggable hooks and greylisting"
)]
pub struct Cli {
    /// Address to listen on for SMTP
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    pub listen_address: IpAddr,

    /// SMTP port
    #[arg(short = 'p', long, default_value_t = 2525)]
    pub port: u16,

    /// Worker process count; above 1 enables the prefork supervisor
    #[arg(short = 'j', long, default_value_t = 1)]
    pub procs: usize,

    /// Drop privileges to this user after binding
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'd', long, action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Directory holding the key-per-file configuration
    #[arg(short = 'c', long, default_value = "./config")]
    pub config_dir: PathBuf,

    /// Directory for the greylist database
    #[arg(long, default_value = "/var/lib/tollgate")]
    pub db_dir: PathBuf,

    /// Control channel address (loopback only)
    #[arg(long, default_value = tollgate_control::DEFAULT_CONTROL_ADDR)]
    pub control_address: String,

    /// Accepted for command-line compatibility; the async runtime selects
    /// its readiness backend itself
    #[arg(long, hide = true)]
    pub use_poll: bool,
}
