// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! parleyd: registers against a PBX as an ordinary extension, answers
//! inbound calls, and bridges caller audio to a realtime AI over WebSocket.

use std::sync::Arc;

use ai_realtime::{spawn_client, RealtimeConfig, SessionConfig};
use clap::Parser;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use parleyd::config::{Args, Config};
use parleyd::dispatcher::Dispatcher;
use parleyd::events;
use parleyd::registration::{RegEvent, RegistrationEngine};
use parleyd::session::{AiLink, SessionEvent};
use parleyd::transport::{spawn_sip_transport, SipSender};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();

    let config = match Config::load(&args) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    let socket = match UdpSocket::bind(("0.0.0.0", config.sip_client_port)).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            error!(error = %e, port = config.sip_client_port, "cannot bind SIP socket");
            std::process::exit(2);
        }
    };
    info!(port = config.sip_client_port, "SIP socket bound");

    let (packet_tx, packet_rx) = mpsc::channel(1024);
    let (recovered_tx, mut recovered_rx) = mpsc::channel(4);
    let sender: Arc<dyn SipSender> =
        Arc::new(spawn_sip_transport(Arc::clone(&socket), packet_tx, recovered_tx));

    // One provider connection for the whole process.
    let ai_handle = spawn_client(RealtimeConfig {
        url: config.ai_realtime_url.clone(),
        api_key: config.ai_api_key.clone(),
        session: SessionConfig::new(&config.ai_instructions, &config.ai_voice),
    });
    let ai: Arc<dyn AiLink> = Arc::new(ai_handle.clone());

    let (event_senders, mut event_receivers) = events::channels();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                call = event_receivers.incoming_call.recv() => match call {
                    Some(call) => info!(call_id = %call.call_id, from = %call.from, "call started"),
                    None => break,
                },
                ended = event_receivers.call_ended.recv() => match ended {
                    Some(ended) => {
                        info!(call_id = %ended.call_id, reason = %ended.reason, "call ended")
                    }
                    None => break,
                },
            }
        }
    });

    let reg_tx = if config.skip_sip_registration {
        warn!("SKIP_SIP_REGISTRATION set; not registering with upstream");
        None
    } else {
        let (engine, reg_tx, mut status_rx) =
            RegistrationEngine::new(Arc::clone(&config), Arc::clone(&sender));
        tokio::spawn(engine.run());

        // Socket recoveries feed the engine; status transitions are logged.
        let recovery_reg_tx = reg_tx.clone();
        tokio::spawn(async move {
            while recovered_rx.recv().await.is_some() {
                let _ = recovery_reg_tx.send(RegEvent::SocketRecovered).await;
            }
        });
        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow();
                info!(state = ?status.state, liveness = ?status.liveness, "client status");
            }
        });
        Some(reg_tx)
    };

    let sessions = Arc::new(DashMap::new());
    let (dispatcher, removed_rx) = Dispatcher::new(
        Arc::clone(&config),
        Arc::clone(&sender),
        Arc::clone(&ai),
        reg_tx.clone(),
        Arc::clone(&sessions),
        event_senders,
    );
    let mut dispatcher_task = tokio::spawn(dispatcher.run(packet_rx, removed_rx));

    info!(
        server = %config.sip_server,
        extension = %config.extension,
        "parleyd started"
    );

    // The dispatcher only returns when the transport dies for good, which
    // means the SIP socket could not be recovered.
    let exit_code = tokio::select! {
        code = wait_for_signal() => code,
        _ = &mut dispatcher_task => {
            error!("SIP transport lost and not recoverable");
            2
        }
    };

    // Orderly shutdown: unregister, close the provider socket, give live
    // sessions a bounded window to drain, then force-exit.
    info!("shutting down");
    if let Some(reg_tx) = reg_tx {
        let _ = reg_tx.send(RegEvent::Unregister).await;
    }
    for entry in sessions.iter() {
        let _ = entry.value().send(SessionEvent::Terminate).await;
    }
    ai_handle.shutdown().await;

    let deadline = Instant::now() + SHUTDOWN_DRAIN;
    while !sessions.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if !sessions.is_empty() {
        warn!(remaining = sessions.len(), "force-closing undrained sessions");
    }

    std::process::exit(exit_code);
}

/// Blocks until SIGINT or SIGTERM, returning the process exit code.
async fn wait_for_signal() -> i32 {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "cannot install SIGINT handler");
                std::future::pending::<()>().await;
                unreachable!()
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
                unreachable!()
            }
        };
        tokio::select! {
            _ = sigint.recv() => 130,
            _ = sigterm.recv() => 0,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        130
    }
}
