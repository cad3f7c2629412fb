//! The cpcd binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use cpcd::config::Config;
use cpcd::core::Error;
use cpcd::crypto::{BindingKey, SecurityHandle};
use cpcd::engine::{Engine, EngineConfig};
use cpcd::logging::{init_logging, LogFormat, LogLevel};
use cpcd::server::ServerConfig;
use cpcd::{driver, server};

/// Co-Processor Communication daemon.
#[derive(Debug, Parser)]
#[command(name = "cpcd", version, about)]
struct Cli {
    /// Instance name, namespacing the socket directory.
    #[arg(long, default_value = "cpcd_0")]
    instance: String,

    /// Directory under which per-instance sockets are created.
    #[arg(long, default_value = "/dev/shm")]
    socket_dir: PathBuf,

    /// UART device carrying the link.
    #[arg(long, default_value = "/dev/ttyACM0")]
    uart_device: String,

    /// UART baud rate.
    #[arg(long, default_value_t = 115_200)]
    uart_baudrate: u32,

    /// Enable UART hardware flow control.
    #[arg(long)]
    uart_hardflow: bool,

    /// Encrypt user endpoint traffic.
    #[arg(long)]
    use_encryption: bool,

    /// Binding key file (required with --use-encryption).
    #[arg(long)]
    binding_key_file: Option<PathBuf>,

    /// Skip the secondary reset sequence at startup.
    #[arg(long)]
    no_reset_sequence: bool,

    /// Log format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Log level.
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            instance: self.instance,
            socket_dir: self.socket_dir,
            uart_device: self.uart_device,
            uart_baudrate: self.uart_baudrate,
            uart_hardflow: self.uart_hardflow,
            use_encryption: self.use_encryption,
            binding_key_file: self.binding_key_file,
            reset_sequence: !self.no_reset_sequence,
            ..Config::default()
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);
    let cfg = cli.into_config();

    if let Err(e) = cfg.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    // The engine owns all endpoint state on one thread; everything async
    // runs on a current-thread runtime.
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config) -> Result<(), Error> {
    info!(instance = %cfg.instance, device = %cfg.uart_device, "starting cpcd");

    // Both of these are fatal before the daemon is useful: no link, or
    // encryption demanded without a key.
    let driver = driver::open_uart(&cfg.uart_device, cfg.uart_baudrate, cfg.uart_hardflow)?;

    let (security, key_id) = if cfg.use_encryption {
        let path = cfg
            .binding_key_file
            .as_ref()
            .expect("validated: encryption requires a key file");
        let binding = BindingKey::load(path)?;
        let key_id = binding.key_id();
        let key_id_hex = format!("{key_id:016x}");
        info!(key_id = %key_id_hex, "binding key loaded");
        (Some(SecurityHandle::spawn(binding)), Some(key_id))
    } else {
        (None, None)
    };

    let engine_cfg = EngineConfig {
        tx_window: cfg.tx_window,
        encryption: cfg.use_encryption,
        reset_sequence: cfg.reset_sequence,
        key_id,
    };
    let (engine, handle, notices) = Engine::new(driver, engine_cfg, security);

    let server_cfg = ServerConfig {
        socket_dir: cfg.socket_dir.clone(),
        instance: cfg.instance.clone(),
    };
    let server_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run(server_handle, notices, server_cfg).await {
            error!(error = %e, "server failed");
        }
    });

    let shutdown_handle = handle;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_handle.shutdown().await;
        }
    });

    engine.run().await
}
