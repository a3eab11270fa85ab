//! Network identity bootstrap.
//!
//! The container orchestrator attaches the device's external interface
//! some time after boot. Once it appears, its MAC address becomes the
//! device's base hardware address: it is published into the environment
//! file along with the derived organizational identifier, and the interface
//! is configured as the WAN device.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Serialize;

use crate::envfile::{lookup, replace_if_changed, upsert};
use crate::layout::{Layout, ENVIRONMENT_FILES, SYSFS_NET};
use crate::store::read_optional;
use crate::task::Task;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Parse a MAC address of six `:` separated hex octets.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let mut r = [0u8; 6];
    let mut parts = s.trim().split(':');
    for octet in r.iter_mut() {
        let p = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("Invalid MAC address {s:?}: too short"))?;
        anyhow::ensure!(p.len() == 2, "Invalid MAC address {s:?}: bad octet {p:?}");
        *octet = u8::from_str_radix(p, 16)
            .with_context(|| format!("Invalid MAC address {s:?}: bad octet {p:?}"))?;
    }
    anyhow::ensure!(parts.next().is_none(), "Invalid MAC address {s:?}: too long");
    Ok(r)
}

/// The organizational identifier of a MAC address: its first three octets,
/// upper-cased and without separators.
pub fn oui_from_mac(mac: &str) -> Result<String> {
    let octets = parse_mac(mac)?;
    Ok(octets[..3].iter().map(|o| format!("{o:02X}")).collect())
}

/// Configures an interface as the device's external network interface.
pub trait NetworkConfigurator: std::fmt::Debug {
    /// Make `interface` the WAN device and request DHCP on it.
    fn configure(&self, interface: &str) -> Result<()>;
}

/// Configures the interface through `uci` and reloads the network service.
#[derive(Debug, Default)]
pub struct UciConfigurator;

impl NetworkConfigurator for UciConfigurator {
    #[context("Configuring {interface} as WAN")]
    fn configure(&self, interface: &str) -> Result<()> {
        let device = format!("network.wan.device={interface}");
        Task::new(format!("Setting WAN device to {interface}"), "uci")
            .args(["set", device.as_str()])
            .run()?;
        Task::new("Requesting DHCP on WAN", "uci")
            .args(["set", "network.wan.proto=dhcp"])
            .run()?;
        Task::new("Committing network configuration", "uci")
            .quiet()
            .args(["commit", "network"])
            .run()?;
        if let Err(e) = Task::new("Reloading network service", "/etc/init.d/network")
            .args(["reload"])
            .run()
        {
            tracing::warn!("{e:#}");
            Task::new("Restarting network service", "/etc/init.d/network")
                .args(["restart"])
                .run()?;
        }
        Ok(())
    }
}

/// The result of bootstrapping the network identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum IdentityOutcome {
    /// The environment already held a MAC address; nothing was done.
    AlreadyEstablished,
    /// The identity was derived and published.
    Published {
        /// MAC address of the interface
        mac: String,
        /// Derived organizational identifier
        oui: String,
    },
}

/// Derives and publishes the device identity from its external interface.
#[derive(Debug)]
pub struct NetworkIdentity {
    layout: Layout,
    interface: String,
    timeout: Duration,
    poll_interval: Duration,
    configurator: Box<dyn NetworkConfigurator>,
}

impl NetworkIdentity {
    /// Use the interface and timeout from the layout's configuration.
    pub fn new(layout: Layout) -> Self {
        let net = &layout.config().network;
        let interface = net.interface().to_owned();
        let timeout = net.timeout();
        Self {
            layout,
            interface,
            timeout,
            poll_interval: POLL_INTERVAL,
            configurator: Box::new(UciConfigurator),
        }
    }

    /// Override the interface.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    /// Override how long to wait for the interface.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override how often to look for the interface.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replace the network configurator.
    pub fn with_configurator(mut self, configurator: Box<dyn NetworkConfigurator>) -> Self {
        self.configurator = configurator;
        self
    }

    fn established(&self) -> Result<bool> {
        let root = self.layout.open_root()?;
        let var = self.layout.config().network.mac_variable();
        for path in ENVIRONMENT_FILES {
            let Some(text) = read_optional(&root, Utf8Path::new(path))? else {
                continue;
            };
            if lookup(&text, var).is_some_and(|v| !v.is_empty()) {
                tracing::debug!("{var} already set in /{path}");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn wait_for_address(&self) -> Result<String> {
        let path = self
            .layout
            .path(SYSFS_NET)
            .join(&self.interface)
            .join("address");
        let poll = async {
            let mut interval = tokio::time::interval(self.poll_interval);
            loop {
                interval.tick().await;
                match std::fs::read_to_string(&path) {
                    Ok(s) if !s.trim().is_empty() => return s.trim().to_owned(),
                    _ => tracing::trace!("{path} not present yet"),
                }
            }
        };
        tokio::time::timeout(self.timeout, poll)
            .await
            .map_err(|_| anyhow::anyhow!("Timed out after {:?}", self.timeout))
    }

    /// Publish the identity, unless it is already established.
    pub async fn run(&self) -> Result<IdentityOutcome> {
        if self.established()? {
            return Ok(IdentityOutcome::AlreadyEstablished);
        }
        let mac = self
            .wait_for_address()
            .await
            .with_context(|| format!("Waiting for {}", self.interface))?;
        let oui = oui_from_mac(&mac)?;
        tracing::info!("{}: MAC {mac}, OUI {oui}", self.interface);

        let net = &self.layout.config().network;
        let root = self.layout.open_root()?;
        let path = Utf8Path::new(ENVIRONMENT_FILES[0]);
        let old = read_optional(&root, path)?.unwrap_or_default();
        let new = upsert(&old, net.mac_variable(), &mac);
        let new = upsert(&new, net.oui_variable(), &oui);
        replace_if_changed(&root, path, &old, &new)?;

        self.configurator.configure(&self.interface)?;
        Ok(IdentityOutcome::Published { mac, oui })
    }
}
