//! Daemon configuration.
//!
//! The environment is the primary surface (this thing runs in a container
//! next to the PBX); a handful of flags exist for local runs. The merged
//! result is one immutable [`Config`] constructed at startup and passed
//! into every component. No module-level state.

use std::net::SocketAddr;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

/// SIP trunk to realtime-AI bridge.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Args {
    /// Override SIP_SERVER (host:port of the upstream PBX)
    #[arg(long)]
    pub sip_server: Option<String>,
    /// Override SIP_CLIENT_PORT (local SIP UDP port)
    #[arg(long)]
    pub sip_port: Option<u16>,
    /// Skip upstream registration (test mode)
    #[arg(long)]
    pub skip_registration: bool,
}

/// Immutable process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream PBX signaling address.
    pub sip_server: SocketAddr,
    /// Host form of the upstream server, for request URIs and realms.
    pub sip_server_host: String,
    /// Extension identity this bridge registers as.
    pub extension: String,
    /// Shared secret for digest authentication.
    pub password: String,
    /// Local SIP UDP port.
    pub sip_client_port: u16,
    /// RTP port range, inclusive start / exclusive end.
    pub rtp_port_range: (u16, u16),
    /// Address advertised in Contact and SDP.
    pub public_ip: String,
    /// Realtime provider WebSocket URL.
    pub ai_realtime_url: String,
    /// Bearer token for the provider.
    pub ai_api_key: String,
    /// Voice identifier.
    pub ai_voice: String,
    /// System prompt for the AI.
    pub ai_instructions: String,
    /// Prompt injected to trigger the greeting once a call goes live.
    pub ai_welcome_prompt: String,
    pub max_concurrent_calls: usize,
    pub skip_sip_registration: bool,
    /// Session-Expires we advertise (RFC 4028).
    pub session_expires_seconds: u32,
    /// Premature-BYE filtering (the PBX-quirk shield). Disable for
    /// RFC-strict teardown during integration testing.
    pub bye_filtering: bool,
    /// Require at least one received RTP packet before activating the AI.
    pub require_rtp_before_ai: bool,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Builds the configuration from the environment plus CLI overrides.
    /// Any error here is fatal (exit code 1).
    pub fn load(args: &Args) -> Result<Self> {
        let server_raw = args
            .sip_server
            .clone()
            .or_else(|| env_var("SIP_SERVER"))
            .ok_or_else(|| anyhow!("SIP_SERVER is required (host:port)"))?;
        let (sip_server, sip_server_host) = resolve_server(&server_raw)?;

        let extension = env_var("SIP_AUTHORIZATION_USER")
            .ok_or_else(|| anyhow!("SIP_AUTHORIZATION_USER is required"))?;
        let password =
            env_var("SIP_PASSWORD").ok_or_else(|| anyhow!("SIP_PASSWORD is required"))?;

        let sip_client_port = match args.sip_port {
            Some(port) => port,
            None => parse_env("SIP_CLIENT_PORT", 5060)?,
        };

        let rtp_port_range = match env_var("RTP_PORT_RANGE") {
            Some(raw) => parse_range(&raw)?,
            None => match env_var("RTP_PORT") {
                // A single configured port still gets a small probe window.
                Some(raw) => {
                    let start: u16 = raw
                        .parse()
                        .with_context(|| format!("RTP_PORT invalid: {}", raw))?;
                    (start, start.saturating_add(100))
                }
                None => (8000, 18000),
            },
        };

        let public_ip = env_var("PUBLIC_IP").unwrap_or_else(|| "127.0.0.1".to_string());

        let ai_realtime_url = env_var("AI_REALTIME_URL")
            .ok_or_else(|| anyhow!("AI_REALTIME_URL is required"))?;
        let ai_api_key =
            env_var("AI_API_KEY").ok_or_else(|| anyhow!("AI_API_KEY is required"))?;

        Ok(Self {
            sip_server,
            sip_server_host,
            extension,
            password,
            sip_client_port,
            rtp_port_range,
            public_ip,
            ai_realtime_url,
            ai_api_key,
            ai_voice: env_var("AI_VOICE").unwrap_or_else(|| "alloy".to_string()),
            ai_instructions: env_var("AI_INSTRUCTIONS").unwrap_or_else(|| {
                "You are a helpful phone assistant. Keep responses short and conversational."
                    .to_string()
            }),
            ai_welcome_prompt: env_var("AI_WELCOME_PROMPT").unwrap_or_else(|| {
                "Greet the caller briefly and ask how you can help.".to_string()
            }),
            max_concurrent_calls: parse_env("MAX_CONCURRENT_CALLS", 10)?,
            skip_sip_registration: args.skip_registration
                || parse_env("SKIP_SIP_REGISTRATION", false)?,
            session_expires_seconds: parse_env("SESSION_EXPIRES_SECONDS", 1800)?,
            bye_filtering: parse_env("BYE_FILTERING", true)?,
            require_rtp_before_ai: parse_env("REQUIRE_RTP_BEFORE_AI", false)?,
        })
    }

    /// Request URI of the upstream server: `sip:<server>`.
    pub fn server_uri(&self) -> String {
        format!("sip:{}", self.sip_server_host)
    }

    /// Our address-of-record: `sip:<ext>@<server>`.
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.extension, self.sip_server_host)
    }

    /// Contact URI advertised to the PBX.
    pub fn contact_uri(&self) -> String {
        format!(
            "sip:{}@{}:{}",
            self.extension, self.public_ip, self.sip_client_port
        )
    }
}

fn resolve_server(raw: &str) -> Result<(SocketAddr, String)> {
    let (host, port) = match raw.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .with_context(|| format!("SIP_SERVER port invalid: {}", raw))?,
        ),
        None => (raw.to_string(), 5060),
    };
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("SIP_SERVER must be an IP:port, got {}", raw))?;
    Ok((addr, host))
}

fn parse_range(raw: &str) -> Result<(u16, u16)> {
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| anyhow!("RTP_PORT_RANGE must be start-end, got {}", raw))?;
    let start: u16 = start.trim().parse().context("RTP_PORT_RANGE start")?;
    let end: u16 = end.trim().parse().context("RTP_PORT_RANGE end")?;
    if start >= end {
        bail!("RTP_PORT_RANGE start must be below end");
    }
    Ok((start, end))
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("{} invalid: {}", name, raw)),
        None => Ok(default),
    }
}
