// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use sip_transport::UdpTransport;
use sip_ua::{UaConfig, UaEvent, UserAgent};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line SIP user agent: registers, places or answers calls.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Bind address (UDP)
    #[arg(long, default_value = "0.0.0.0:5060")]
    bind: String,
    /// User part of the address of record
    #[arg(long)]
    user: Option<String>,
    /// Registrar domain
    #[arg(long)]
    domain: Option<String>,
    /// Digest password
    #[arg(long)]
    password: Option<String>,
    /// Address advertised in Via and Contact
    #[arg(long)]
    public_ip: Option<String>,
    /// SIP URI of a proxy every request is sent through
    #[arg(long)]
    outbound_proxy: Option<String>,
    /// Register with the domain on startup
    #[arg(long)]
    register: bool,
    /// SIP URI to call once started
    #[arg(long)]
    call: Option<String>,
    /// Answer incoming calls instead of leaving them ringing
    #[arg(long)]
    auto_answer: bool,
    /// JSON config file; command-line flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = load_config(&args).await?;

    let (transport, inbound) = UdpTransport::bind(&args.bind)
        .await
        .map_err(|e| anyhow!("cannot bind {}: {}", args.bind, e))?;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let ua = Arc::new(UserAgent::new(config, transport.clone(), Arc::new(events_tx))?);
    let reader = ua.clone().spawn_reader(inbound);
    info!(
        bind = %args.bind,
        local = ?transport.local_addr().ok(),
        "user agent started"
    );

    if args.register {
        ua.register().await?;
    }
    if let Some(target) = &args.call {
        let call_id = ua.invite(target).await?;
        info!(%call_id, %target, "calling");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => on_event(&ua, event, args.auto_answer).await,
                None => break,
            },
        }
    }

    info!("shutting down");
    for (call_id, _) in ua.peers() {
        if let Err(e) = ua.terminate(&call_id).await {
            warn!(%call_id, error = %e, "hang-up failed");
        }
    }
    if ua.is_registered() {
        if let Err(e) = ua.unregister().await {
            warn!(error = %e, "unregister failed");
        }
    }
    ua.close();
    reader.abort();
    Ok(())
}

async fn load_config(args: &Args) -> Result<UaConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            UaConfig::from_json(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => UaConfig::default(),
    };

    if let Some(user) = &args.user {
        config.user = user.clone();
    }
    if let Some(domain) = &args.domain {
        config.domain = domain.clone();
    }
    if args.password.is_some() {
        config.password = args.password.clone();
    }
    if args.public_ip.is_some() {
        config.public_ip = args.public_ip.clone();
    }
    if args.outbound_proxy.is_some() {
        config.outbound_proxy = args.outbound_proxy.clone();
    }
    if let Some((host, port)) = args.bind.rsplit_once(':') {
        config.sip_port = port
            .parse()
            .with_context(|| format!("invalid port in --bind {}", args.bind))?;
        if host != "0.0.0.0" && host != "[::]" {
            config.local_ip = host.to_owned();
        }
    }
    Ok(config)
}

async fn on_event(ua: &UserAgent, event: UaEvent, auto_answer: bool) {
    match event {
        UaEvent::Registering { .. } => info!("registering"),
        UaEvent::RegisterSuccessful { response } => {
            info!(code = response.code(), registered = ua.is_registered(), "registration done")
        }
        UaEvent::RegisterFailed { response } => {
            warn!(code = response.as_ref().map(|r| r.code()), "registration failed")
        }
        UaEvent::IncomingCall { call_id, request } => {
            info!(%call_id, from = request.header("From").map(|f| f.as_str()), "incoming call");
            if auto_answer {
                if let Err(e) = ua.accept_call(&call_id).await {
                    warn!(%call_id, error = %e, "cannot answer");
                }
            }
        }
        UaEvent::Ringing { call_id, .. } => info!(%call_id, "ringing"),
        UaEvent::CalleePickup { call_id, .. } => info!(%call_id, "call answered"),
        UaEvent::RemoteHangup { call_id, .. } => info!(%call_id, "remote hung up"),
        UaEvent::Error { call_id, response } => {
            warn!(%call_id, code = response.as_ref().map(|r| r.code()), "call failed")
        }
    }
}
