//! circuit-sidecar CLI application entry point.
//!
//! Loads configuration, sets up logging and runs the sidecar until CTRL+C.
//!
//! # Startup Flow
//!
//! ```text
//!   ┌──────────────────┐
//!   │  Parse CLI Args  │ ◄── clap, with MGR_* environment fallbacks
//!   └────────┬─────────┘
//!            │
//!            ▼
//!   ┌──────────────────┐       ┌─────────────────┐
//!   │ --generate_config│──────▶│ Write default   │────▶ Exit
//!   │    specified?    │       │ config & exit   │
//!   └────────┬─────────┘       └─────────────────┘
//!            │ No
//!            ▼
//!   ┌──────────────────┐
//!   │  Load Config     │ ◄── Defaults → File → CLI/Env
//!   └────────┬─────────┘
//!            │
//!            ▼
//!   ┌──────────────────┐
//!   │ Initialize       │
//!   │   Logging        │
//!   └────────┬─────────┘
//!            │
//!            ▼
//!   ┌──────────────────┐
//!   │ run_main()       │ ◄── Retry startup, wait for CTRL+C, shut down
//!   └──────────────────┘
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Clean shutdown |
//! | 1 | Error (see stderr for details) |
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `MGR_CONFIG` | Path to config file |
//! | `MGR_CONTROL_HOST` / `MGR_CONTROL_PORT` | Control port location |
//! | `MGR_COOKIE_PATH` | Authentication cookie |
//! | `MGR_HOPCOUNT` | Default hop count |
//! | `MGR_EXIT_COUNTRIES` | Default exit countries, comma-separated |
//! | `MGR_TARGETS` | Target hosts, comma-separated |
//! | `MGR_MIN_CIRCS` / `MGR_MAX_CIRCS` | Circuits per target |
//! | `MGR_COUNTRY_CACHE` | Country cache file |

use clap::Parser;
use std::process::ExitCode;

use circuit_sidecar::{config, logger, run_main, CliArgs, Config, LogLevel, VERSION};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> circuit_sidecar::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let toml = Config::default().to_toml()?;
        std::fs::write(output_path, toml)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;
    logger::init(config.loglevel, config.logfile.as_deref())?;

    logger::plog(
        LogLevel::Notice,
        &format!("circuit-sidecar {} starting", VERSION),
    );
    logger::plog(
        LogLevel::Debug,
        &format!(
            "Control port: {}:{}",
            config.control_ip, config.control_port
        ),
    );
    logger::plog(
        LogLevel::Debug,
        &format!("Country cache: {}", config.cache.file.display()),
    );
    logger::plog(
        LogLevel::Info,
        &format!(
            "Hops {}, exits [{}], {}..{} circuits per target",
            config.hop_count,
            if config.exit_countries.is_empty() {
                "AUTO".to_string()
            } else {
                config.exit_countries.join(",")
            },
            config.min_circuits,
            config.max_circuits
        ),
    );
    if config.rotation.enabled {
        logger::plog(
            LogLevel::Info,
            &format!(
                "Rotation every {}s ±{}%",
                config.rotation.interval_secs, config.rotation.variance_percent
            ),
        );
    }

    run_main(config).await
}
