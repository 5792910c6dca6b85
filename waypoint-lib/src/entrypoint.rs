//! Entrypoint supervisor: one worker per configured entry, dispatched by
//! routing mode, restarted with exponential backoff when it fails for a
//! non-fatal reason.
//!
//! Tag groups are registered before any listener accepts, in entry order, so
//! per-flow selection sees a stable group. A fresh supervisor carries a fresh
//! registry; configuration reload replaces the whole supervisor.

use crate::{
  config::{Config, EntryPoint, RoutingKind},
  constants::{WORKER_BACKOFF_INITIAL_MSEC, WORKER_BACKOFF_MAX_MSEC, WORKER_BACKOFF_RESET_AFTER_SECS},
  error::{ConfigurationError, ProxyError},
  router::{TagRegistry, http::HttpRouter, sni::SniRouter, tcp::TcpRawRouter, udp::UdpRawRouter},
  trace::*,
};
use std::{
  sync::Arc,
  time::{Duration, Instant},
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
/// Supervisor for one configuration generation
pub struct Entrypoint {
  entries: Vec<EntryPoint>,
  registry: Arc<TagRegistry>,
  runtime_handle: Handle,
}

impl Entrypoint {
  pub fn new(config: &Config, runtime_handle: Handle) -> Self {
    config.core.warn_ignored();
    Self {
      entries: config.entrypoints.clone(),
      registry: Arc::new(TagRegistry::new()),
      runtime_handle,
    }
  }

  /// The tag registry of this generation
  pub fn registry(&self) -> &Arc<TagRegistry> {
    &self.registry
  }

  /// Spawn every entry worker and wait until all of them exit.
  /// Cancellation of the token drains every listener and in-flight flow.
  pub async fn start(&self, cancel_token: CancellationToken) -> Result<(), ProxyError> {
    if self.entries.is_empty() {
      error!("No entrypoints configured");
      return Err(ConfigurationError::NoEntrypoints.into());
    }

    // Registration pass first: group membership is complete before any
    // listener starts accepting.
    let prepared = self
      .entries
      .iter()
      .map(|entry| (entry.clone(), self.registry.register(entry)))
      .collect::<Vec<_>>();

    let mut join_handles = Vec::new();
    for (entry, owns_listener) in prepared {
      if !owns_listener {
        info!(
          "Entry on {} joins tag group {:?} without binding a listener",
          entry.listen, entry.tag
        );
        continue;
      }
      join_handles.push(self.runtime_handle.spawn(run_worker(
        entry,
        Arc::clone(&self.registry),
        self.runtime_handle.clone(),
        cancel_token.child_token(),
      )));
    }

    let _ = futures::future::join_all(join_handles).await;
    info!("All entry workers exited");
    Ok(())
  }
}

/* ---------------------------------------------------------- */
/// Worker loop: serve the entry, restart on non-fatal failure with exponential
/// backoff capped at 16s. Configuration and bind errors exit permanently.
async fn run_worker(entry: EntryPoint, registry: Arc<TagRegistry>, runtime_handle: Handle, cancel_token: CancellationToken) {
  let mut backoff = Duration::from_millis(WORKER_BACKOFF_INITIAL_MSEC);
  loop {
    let started = Instant::now();
    let result = serve_entry(&entry, &registry, &runtime_handle, cancel_token.clone()).await;

    if cancel_token.is_cancelled() {
      info!("Worker for {} drained", entry.listen);
      return;
    }
    match result {
      Ok(()) => {
        info!("Worker for {} exited", entry.listen);
        return;
      }
      Err(e) if e.is_fatal() => {
        error!("Entry on {} failed fatally, giving up: {e}", entry.listen);
        return;
      }
      Err(e) => {
        error!("Entry on {} failed: {e}; restarting in {backoff:?}", entry.listen);
        tokio::select! {
          _ = tokio::time::sleep(backoff) => {}
          _ = cancel_token.cancelled() => return,
        }
        backoff = if started.elapsed() >= Duration::from_secs(WORKER_BACKOFF_RESET_AFTER_SECS) {
          Duration::from_millis(WORKER_BACKOFF_INITIAL_MSEC)
        } else {
          (backoff * 2).min(Duration::from_millis(WORKER_BACKOFF_MAX_MSEC))
        };
      }
    }
  }
}

/// Routing dispatch is an exhaustive match: the set of modes is closed
async fn serve_entry(
  entry: &EntryPoint,
  registry: &Arc<TagRegistry>,
  runtime_handle: &Handle,
  cancel_token: CancellationToken,
) -> Result<(), ProxyError> {
  match entry.routing {
    RoutingKind::TcpRaw => {
      TcpRawRouter::bind(entry.clone(), runtime_handle.clone())?
        .start(cancel_token)
        .await
    }
    RoutingKind::UdpRaw => {
      UdpRawRouter::bind(entry.clone(), runtime_handle.clone(), cancel_token.child_token())?
        .start(cancel_token)
        .await
    }
    RoutingKind::Sni => {
      SniRouter::bind(entry.clone(), Arc::clone(registry), runtime_handle.clone())?
        .start(cancel_token)
        .await
    }
    RoutingKind::HttpHeader => {
      HttpRouter::bind(entry.clone(), Arc::clone(registry), runtime_handle.clone())?
        .start(cancel_token)
        .await
    }
  }
}

/* ---------------------------------------------------------- */
#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, TcpStream};
  use tokio::time::{Duration, sleep, timeout};

  /// Reserve an ephemeral port and free it for the supervisor to take over.
  /// SO_REUSEADDR/SO_REUSEPORT on the router sockets keeps this race-free
  /// enough for tests.
  async fn reserve_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
  }

  fn entry(routing: RoutingKind, listen_port: u16, target: &str) -> EntryPoint {
    EntryPoint {
      routing,
      listen: format!("127.0.0.1:{listen_port}").parse().unwrap(),
      target: target.to_string(),
      proxy: Vec::new(),
      block_list: Vec::new(),
      allow_list: Vec::new(),
      timeout: Some(Duration::from_secs(5)),
      tag: None,
      features: Vec::new(),
    }
  }

  #[tokio::test]
  async fn empty_configuration_is_rejected() {
    let supervisor = Entrypoint::new(&Config::default(), Handle::current());
    let res = supervisor.start(CancellationToken::new()).await;
    assert!(matches!(res, Err(ProxyError::Configuration(ConfigurationError::NoEntrypoints))));
  }

  #[tokio::test]
  async fn fatal_entries_do_not_take_down_healthy_ones() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(async move {
      loop {
        let Ok((mut s, _)) = backend.accept().await else { return };
        let _ = s.write_all(b"ok").await;
      }
    });

    let good_port = reserve_port().await;
    let config = Config {
      core: Default::default(),
      entrypoints: vec![
        entry(RoutingKind::TcpRaw, 0, ""), // fatal: no target
        entry(RoutingKind::TcpRaw, good_port, &backend_addr.to_string()),
      ],
    };

    let supervisor = Entrypoint::new(&config, Handle::current());
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
      let cancel = cancel.clone();
      async move { supervisor.start(cancel).await }
    });

    // give the healthy worker a moment to bind
    sleep(Duration::from_millis(200)).await;
    let mut client = TcpStream::connect(("127.0.0.1", good_port)).await.unwrap();
    let mut buf = [0u8; 2];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ok");

    cancel.cancel();
    timeout(Duration::from_secs(2), run).await.unwrap().unwrap().unwrap();
  }

  #[tokio::test]
  async fn cancellation_drains_all_workers() {
    let good_port = reserve_port().await;
    let config = Config {
      core: Default::default(),
      entrypoints: vec![entry(RoutingKind::TcpRaw, good_port, "127.0.0.1:1")],
    };
    let supervisor = Entrypoint::new(&config, Handle::current());
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
      let cancel = cancel.clone();
      async move { supervisor.start(cancel).await }
    });
    sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    timeout(Duration::from_secs(2), run).await.unwrap().unwrap().unwrap();
  }

  #[tokio::test]
  async fn tagged_followers_do_not_bind() {
    let owner_port = reserve_port().await;
    let mut first = entry(RoutingKind::HttpHeader, owner_port, "80");
    first.tag = Some("shared".to_string());
    let mut second = entry(RoutingKind::HttpHeader, owner_port, "81");
    second.tag = Some("shared".to_string());

    let config = Config {
      core: Default::default(),
      entrypoints: vec![first, second],
    };
    let supervisor = Entrypoint::new(&config, Handle::current());
    assert_eq!(supervisor.registry().group(&config.entrypoints[0]).len(), 0, "groups fill at start()");

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
      let cancel = cancel.clone();
      async move { supervisor.start(cancel).await }
    });
    sleep(Duration::from_millis(200)).await;

    // exactly one listener bound; a plain connect succeeds
    let client = TcpStream::connect(("127.0.0.1", owner_port)).await;
    assert!(client.is_ok());

    cancel.cancel();
    timeout(Duration::from_secs(2), run).await.unwrap().unwrap().unwrap();
  }
}
