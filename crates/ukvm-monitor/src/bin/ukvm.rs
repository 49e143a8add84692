//! Boot a unikernel under the ukvm monitor.
//!
//! Usage: ukvm [--mem=MiB] [--disk=IMAGE] [--net=TAP] [--net-mac=HWADDR]
//!             [--record=DIR | --replay=DIR] [--rr-checks] KERNEL [ARGS...]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ukvm_monitor::boot::launch;
use ukvm_monitor::config::{MonitorConfig, NetConfig, DEFAULT_MEM_MIB};
use ukvm_monitor::devices::net::parse_mac;
use ukvm_monitor::rr::{RrConfig, RrMode};

#[derive(Parser, Debug)]
#[command(name = "ukvm")]
#[command(about = "Run a unikernel on KVM with optional record/replay")]
#[command(version)]
struct Args {
    /// Guest memory in MiB
    #[arg(long, value_name = "MiB", default_value_t = DEFAULT_MEM_MIB)]
    mem: usize,

    /// Raw disk image for the block device
    #[arg(long, value_name = "IMAGE")]
    disk: Option<PathBuf>,

    /// Host tap interface, or @N for an already-open descriptor
    #[arg(long, value_name = "TAP")]
    net: Option<String>,

    /// Guest MAC address (random if omitted)
    #[arg(long, value_name = "HWADDR", requires = "net", value_parser = parse_mac_arg)]
    net_mac: Option<[u8; 6]>,

    /// Record nondeterministic inputs into DIR
    #[arg(long, value_name = "DIR", conflicts_with = "replay")]
    record: Option<PathBuf>,

    /// Replay a recording from DIR
    #[arg(long, value_name = "DIR")]
    replay: Option<PathBuf>,

    /// Also log field checks and full state checkpoints
    #[arg(long)]
    rr_checks: bool,

    /// Unikernel ELF image
    kernel: PathBuf,

    /// Arguments passed to the guest command line
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn parse_mac_arg(s: &str) -> Result<[u8; 6], String> {
    parse_mac(s).map_err(|e| e.to_string())
}

impl Args {
    fn into_config(self) -> MonitorConfig {
        let (mode, dir) = match (self.record, self.replay) {
            (Some(dir), _) => (RrMode::Record, dir),
            (None, Some(dir)) => (RrMode::Replay, dir),
            (None, None) => (RrMode::None, PathBuf::new()),
        };
        MonitorConfig {
            mem_size: self.mem << 20,
            kernel: self.kernel,
            cmdline: self.args.join(" "),
            disk: self.disk,
            net: self.net.map(|iface| NetConfig {
                iface,
                mac: self.net_mac,
            }),
            rr: RrConfig {
                mode,
                dir,
                checks: self.rr_checks,
            },
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    match launch(&config) {
        Ok(end) => {
            log::info!("ukvm: {:?}", end);
            ExitCode::from(end.exit_code() as u8)
        }
        Err(e) => {
            log::error!("ukvm: {}", e);
            ExitCode::FAILURE
        }
    }
}
