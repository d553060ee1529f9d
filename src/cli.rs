//! CLI argument definitions using clap

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "aqua-ble",
    about = "BLE service daemon for aquarium dosing pumps and lights",
    version
)]
pub struct Cli {
    /// Host address to bind (overrides AQUA_BLE_SERVICE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind (overrides AQUA_BLE_SERVICE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    pub verbose: bool,
}
