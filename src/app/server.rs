//! Listener and session dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Builder;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use crate::auth::passwords::PasswordStore;
use crate::auth::AuthContext;
use crate::backend::{BackendStatus, Cluster};
use crate::cache::QueryCache;
use crate::config::{get_config, Config};
use crate::engine::cancel::CancelMap;
use crate::engine::{Session, SessionEnv};
use crate::errors::Error;
use crate::interlock::Interlock;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .thread_name("worker-pg-relay")
        .build()?;

    runtime.block_on(async move { serve(config).await })
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = Arc::new(Cluster::from_config(&config)?);
    // Static membership: configured slots come up unless the failover
    // orchestrator says otherwise.
    for node_id in 0..cluster.num_backends() {
        cluster.set_status(node_id, BackendStatus::Up);
    }

    let store = match PasswordStore::load(
        &config.auth.password_file,
        config.auth.aes_key_file.clone(),
    )
    .await
    {
        Ok(store) => store,
        Err(err) => {
            warn!("password file unavailable ({err}); continuing with an empty store");
            PasswordStore::empty()
        }
    };

    let env = SessionEnv {
        cluster,
        interlock: Interlock::new(),
        cache: config
            .cache
            .enabled
            .then(|| Arc::new(QueryCache::new(config.cache.clone()))),
        cancel_map: CancelMap::new(),
        auth: AuthContext::new(store, config.auth.frontend_auth_method),
    };

    let addr = format!("{}:{}", config.general.host, config.general.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    let mut sigterm = unix_signal(SignalKind::terminate())?;
    let mut sigint = unix_signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("accept failed: {err}");
                        continue;
                    }
                };
                let env = env.clone();
                tokio::spawn(async move {
                    let session_id = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = handle_connection(stream, peer.to_string(), session_id, env).await {
                        debug!("session {session_id} ended: {err}");
                    }
                });
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
        }
    }

    let shutdown = Duration::from_millis(get_config().general.shutdown_timeout);
    tokio::time::timeout(shutdown, env.interlock.wait_for_idle())
        .await
        .ok();
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: String,
    session_id: u64,
    env: SessionEnv,
) -> Result<(), Error> {
    configure_socket(&stream);
    let _guard = env.interlock.register_session();

    let mut session = match Session::establish(stream, &peer, session_id, env).await? {
        Some(session) => session,
        None => return Ok(()), // cancel connection, served inline
    };

    let result = session.run().await;
    session.teardown().await;

    match result {
        Ok(()) => Ok(()),
        Err(Error::ConnectionLost(_)) => {
            debug!("client {peer} disconnected");
            Ok(())
        }
        Err(err) => {
            warn!("session {session_id} failed: {err}");
            Err(err)
        }
    }
}

fn configure_socket(stream: &TcpStream) {
    let config = get_config();
    let sock = SockRef::from(stream);

    if let Err(err) = sock.set_tcp_nodelay(config.general.tcp_no_delay) {
        warn!("could not set TCP_NODELAY: {err}");
    }
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(config.general.tcp_keepalives_idle))
        .with_interval(Duration::from_secs(config.general.tcp_keepalives_interval))
        .with_retries(config.general.tcp_keepalives_count);
    if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
        warn!("could not configure TCP keepalive: {err}");
    }
}
