//! splitvpn-check: profile checker
//!
//! Loads a routing profile (`.toml` or `.json`), validates every tunnel
//! definition and prints the per-application routing plan.

use anyhow::{Context, Result, bail};
use splitvpn::adapter::WireGuardProfile;
use splitvpn::adapter::openvpn::prepare_profile;
use splitvpn::{ProfileFile, ProtocolKind, TunnelDefinition};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        bail!("usage: splitvpn-check <profile.toml|profile.json>");
    };

    let profile = ProfileFile::from_file(&path)
        .with_context(|| format!("cannot load {}", path.display()))?;
    profile.validate().context("invalid profile")?;

    info!(
        "Loaded {} tunnels and {} rules from {}",
        profile.tunnels.len(),
        profile.rules.len(),
        path.display()
    );

    let mut failures = 0;
    for tunnel in &profile.tunnels {
        if let Err(e) = check_tunnel(tunnel) {
            error!("{}: {:#}", tunnel.id(), e);
            failures += 1;
        }
    }

    println!("Routing plan:");
    for rule in &profile.rules {
        let target = match &rule.tunnel {
            Some(tunnel) => tunnel.to_string(),
            None => "direct".to_string(),
        };
        let fallback = if rule.fallback_to_direct { " (direct while not ready)" } else { "" };
        println!("  {:<32} -> {}{}", rule.app, target, fallback);
    }
    println!("  {:<32} -> {:?}", "<unmatched>", profile.settings.unrouted_policy);

    if failures > 0 {
        bail!("{} tunnel definition(s) failed", failures);
    }
    Ok(())
}

fn check_tunnel(tunnel: &TunnelDefinition) -> Result<()> {
    match tunnel.protocol() {
        ProtocolKind::WireGuardLike => {
            let profile = WireGuardProfile::parse(&tunnel.config)?;
            let endpoint = profile
                .endpoint
                .clone()
                .unwrap_or_else(|| format!("{}:{}", tunnel.host, tunnel.port));
            let address = profile
                .addresses
                .first()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".into());
            info!("{}: wireguard via {} as {}", tunnel.id(), endpoint, address);
            if profile.dns.is_empty() && tunnel.require_dns {
                warn!("{}: no DNS in profile, tunnel will never become ready", tunnel.id());
            }
        }
        ProtocolKind::OpenVpnLike => {
            if tunnel.credentials.as_ref().is_none_or(|c| c.is_empty()) {
                bail!("openvpn profile without credentials");
            }
            let prepared = prepare_profile(&tunnel.config, &tunnel.host, tunnel.port);
            info!(
                "{}: openvpn via {}:{} ({} profile lines)",
                tunnel.id(),
                tunnel.host,
                tunnel.port,
                prepared.lines().count()
            );
        }
        ProtocolKind::Unrecognized => bail!("unrecognized profile format"),
    }
    Ok(())
}
