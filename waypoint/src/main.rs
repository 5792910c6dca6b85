#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod config;
mod log;

use crate::{
  config::{ConfigFormat, ConfigReloader, EXAMPLE_CONFIG, Invocation, load_config, parse_config, parse_opts, render_config},
  log::*,
};
use hot_reload::{ReloaderReceiver, ReloaderService};
use tokio_util::sync::CancellationToken;
use waypoint_lib::{Config, Entrypoint};

/// Delay in seconds between config file checks
const CONFIG_WATCH_DELAY_SECS: u32 = 15;

fn main() {
  let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
  runtime_builder.enable_all();
  runtime_builder.thread_name("waypoint");
  let runtime = runtime_builder.build().unwrap();

  runtime.block_on(async {
    let opts = match parse_opts() {
      Ok(opts) => opts,
      Err(e) => {
        eprintln!("Invalid invocation: {e}");
        std::process::exit(1);
      }
    };
    init_logger(opts.debug);

    let outcome = match opts.command {
      Invocation::Example { format } => parse_config(EXAMPLE_CONFIG, ConfigFormat::Toml)
        .and_then(|config| render_config(&config, format))
        .map(|rendered| println!("{rendered}")),
      Invocation::Dump { config_path, format } => load_config(&config_path)
        .and_then(|config| render_config(&config, format))
        .map(|rendered| println!("{rendered}")),
      Invocation::Run { entry } => {
        let config = Config {
          core: Default::default(),
          entrypoints: vec![*entry],
        };
        serve_once(config, runtime.handle().clone(), opts.dry_run).await
      }
      Invocation::Serve { config_path } => match config_path {
        Some(path) if path != "-" => serve_watched(path, runtime.handle().clone(), opts.dry_run).await,
        other => {
          let path = other.unwrap_or_else(|| "-".to_string());
          match load_config(&path) {
            Ok(config) => serve_once(config, runtime.handle().clone(), opts.dry_run).await,
            Err(e) => Err(e),
          }
        }
      },
    };

    match outcome {
      Ok(()) => std::process::exit(0),
      Err(e) => {
        error!("Service exited: {e}");
        std::process::exit(1);
      }
    }
  });
}

/// Serve a fixed configuration until shutdown
async fn serve_once(config: Config, runtime_handle: tokio::runtime::Handle, dry_run: bool) -> Result<(), anyhow::Error> {
  if dry_run {
    info!("Dry run; resolved entrypoints:");
    for entry in &config.entrypoints {
      info!("  {entry:?}");
    }
    return Ok(());
  }

  info!("Starting waypoint");
  let supervisor = Entrypoint::new(&config, runtime_handle);
  let cancel_token = CancellationToken::new();

  tokio::select! {
    res = supervisor.start(cancel_token.child_token()) => res.map_err(|e| anyhow::anyhow!(e)),
    _ = tokio::signal::ctrl_c() => {
      info!("Shutdown signal received, draining flows");
      cancel_token.cancel();
      Ok(())
    }
  }
}

/// Serve with the config file under watch; the supervisor is replaced on change
async fn serve_watched(config_path: String, runtime_handle: tokio::runtime::Handle, dry_run: bool) -> Result<(), anyhow::Error> {
  if dry_run {
    let config = load_config(&config_path)?;
    return serve_once(config, runtime_handle, true).await;
  }

  info!("Starting waypoint, watching {config_path}");
  let (config_service, config_rx) =
    ReloaderService::<ConfigReloader, Config, String>::new(&config_path, CONFIG_WATCH_DELAY_SECS, false).await?;

  tokio::select! {
    config_res = config_service.start() => {
      if let Err(e) = config_res {
        error!("Config reloader service exited: {e}");
        return Err(anyhow::anyhow!("config reloader service exited"));
      }
      Ok(())
    }
    res = supervisor_loop(config_rx, runtime_handle) => res,
  }
}

/// Run supervisor generations: each config change cancels the old generation
/// and starts a fresh one with a fresh tag registry
async fn supervisor_loop(
  mut config_rx: ReloaderReceiver<Config, String>,
  runtime_handle: tokio::runtime::Handle,
) -> Result<(), anyhow::Error> {
  // Initial loading
  config_rx.changed().await?;
  let config = config_rx
    .borrow()
    .clone()
    .ok_or(anyhow::anyhow!("Something wrong in config reloader receiver"))?;
  let mut supervisor = Entrypoint::new(&config, runtime_handle.clone());

  loop {
    let cancel_token = CancellationToken::new();

    tokio::select! {
      res = supervisor.start(cancel_token.child_token()) => {
        if let Err(ref e) = res {
          error!("Supervisor stopped: {e}");
        } else {
          error!("Supervisor exited");
        }
        return res.map_err(|e| anyhow::anyhow!(e));
      }
      _ = config_rx.changed() => {
        let Some(new_config) = config_rx.borrow().clone() else {
          error!("Something wrong in config reloader receiver");
          return Err(anyhow::anyhow!("Something wrong in config reloader receiver"));
        };
        info!("Configuration reloaded");
        // Kill the previous generation; SO_REUSEADDR/SO_REUSEPORT lets the
        // replacement re-bind the same listeners
        cancel_token.cancel();
        supervisor = Entrypoint::new(&new_config, runtime_handle.clone());
      }
      _ = tokio::signal::ctrl_c() => {
        info!("Shutdown signal received, draining flows");
        cancel_token.cancel();
        return Ok(());
      }
    }
  }
}
