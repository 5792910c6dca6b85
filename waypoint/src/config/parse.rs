use super::file::ConfigFormat;
use anyhow::anyhow;
use clap::{Arg, ArgAction};
use waypoint_lib::{EntryPoint, config::parse_duration, config::parse_listen_addr};

/// Parsed invocation
pub(crate) struct Opts {
  pub command: Invocation,
  pub debug: bool,
  pub dry_run: bool,
}

/// What the process was asked to do
pub(crate) enum Invocation {
  /// Start from a config file (or stdin)
  Serve { config_path: Option<String> },
  /// One-shot entry assembled from flags
  Run { entry: Box<EntryPoint> },
  /// Parse a config file and re-serialise it
  Dump { config_path: String, format: ConfigFormat },
  /// Print the embedded example
  Example { format: ConfigFormat },
}

fn format_arg() -> Arg {
  Arg::new("format")
    .long("format")
    .short('f')
    .value_name("FORMAT")
    .default_value("toml")
    .help("Output format: toml, json or yaml")
}

/// Parse arg values passed from cli
pub(crate) fn parse_opts() -> Result<Opts, anyhow::Error> {
  let _ = include_str!("../../Cargo.toml");
  let options = clap::command!()
    .arg(
      Arg::new("config_file")
        .long("config")
        .short('c')
        .value_name("FILE")
        .help("Configuration file path like ./config.toml; use - for stdin"),
    )
    .arg(
      Arg::new("debug")
        .long("debug")
        .global(true)
        .action(ArgAction::SetTrue)
        .help("Log at debug level"),
    )
    .arg(
      Arg::new("dry_run")
        .long("dry-run")
        .global(true)
        .action(ArgAction::SetTrue)
        .help("Parse the configuration, print the resolved entries and exit"),
    )
    .subcommand(
      clap::Command::new("run")
        .about("Run a single entry assembled from flags instead of a config file")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('p')
            .value_name("ADDR")
            .default_value("8080")
            .help("Address to listen on, host:port or a bare port"),
        )
        .arg(
          Arg::new("routing")
            .long("routing")
            .short('r')
            .value_name("MODE")
            .required(true)
            .help("Routing mode: tcp-raw, udp-raw, sni or http-header"),
        )
        .arg(
          Arg::new("target")
            .long("target")
            .short('t')
            .value_name("TARGET")
            .required(true)
            .help("Target, interpreted per routing mode"),
        )
        .arg(
          Arg::new("proxy")
            .long("proxy")
            .short('x')
            .value_name("URL")
            .action(ArgAction::Append)
            .help("Proxy URLs forming the outbound chain (repeatable)"),
        )
        .arg(
          Arg::new("timeout")
            .long("timeout")
            .short('T')
            .value_name("DURATION")
            .help("Per-flow timeout, e.g. 30s or 24h"),
        ),
    )
    .subcommand(
      clap::Command::new("dump")
        .about("Parse a config file and re-serialise it")
        .arg(
          Arg::new("config_file")
            .long("config")
            .short('c')
            .value_name("FILE")
            .required(true)
            .help("Configuration file to parse"),
        )
        .arg(format_arg()),
    )
    .subcommand(
      clap::Command::new("example")
        .about("Print the embedded example configuration")
        .arg(format_arg()),
    );
  let matches = options.get_matches();

  let debug = matches.get_flag("debug");
  let dry_run = matches.get_flag("dry_run");

  ///////////////////////////////////
  let command = match matches.subcommand() {
    Some(("run", sub)) => {
      let listen = sub.get_one::<String>("listen").expect("has a default");
      let routing = sub
        .get_one::<String>("routing")
        .ok_or_else(|| anyhow!("routing is required"))?;
      let target = sub
        .get_one::<String>("target")
        .ok_or_else(|| anyhow!("target is required"))?;

      let proxy = sub
        .get_many::<String>("proxy")
        .unwrap_or_default()
        .map(|p| url::Url::parse(p).map_err(|e| anyhow!("invalid proxy url {p}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;

      let timeout = sub
        .get_one::<String>("timeout")
        .map(|t| parse_duration(t))
        .transpose()?;

      let entry = EntryPoint {
        routing: routing.parse()?,
        listen: parse_listen_addr(listen)?,
        target: target.clone(),
        proxy,
        block_list: Vec::new(),
        allow_list: Vec::new(),
        timeout,
        tag: None,
        features: Vec::new(),
      };
      Invocation::Run { entry: Box::new(entry) }
    }
    Some(("dump", sub)) => Invocation::Dump {
      config_path: sub
        .get_one::<String>("config_file")
        .ok_or_else(|| anyhow!("config file is required"))?
        .to_owned(),
      format: sub.get_one::<String>("format").expect("has a default").parse()?,
    },
    Some(("example", sub)) => Invocation::Example {
      format: sub.get_one::<String>("format").expect("has a default").parse()?,
    },
    _ => Invocation::Serve {
      config_path: matches.get_one::<String>("config_file").cloned(),
    },
  };

  Ok(Opts { command, debug, dry_run })
}
