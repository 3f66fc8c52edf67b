// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Waddle Social

//! Probe configuration from a TOML file and command line flags.

use anyhow::{Context, Result};
use xmpp_probe::{AddressFamily, ConnectionMode, ProbeConfig};

use crate::Cli;

/// Build the probe configuration: file values first, then flag overrides.
pub fn build(cli: &Cli) -> Result<ProbeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let config = ProbeConfig::from_toml_file(path)
                .with_context(|| format!("Failed to load config file: {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        }
        None => ProbeConfig::default(),
    };

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(address) = &cli.address {
        config.address = Some(address.clone());
    }
    if let Some(port) = cli.port {
        config.port = Some(port);
    }
    if cli.s2s {
        config.mode = ConnectionMode::Server;
    }
    if cli.ipv4 {
        config.address_family = AddressFamily::Ipv4;
    } else if cli.ipv6 {
        config.address_family = AddressFamily::Ipv6;
    }
    if cli.starttls {
        config.force_starttls = true;
    }
    if cli.no_check_certificates {
        config.verify_certificates = false;
    }
    if cli.no_certificate_expiry {
        config.check_certificate_expiry = false;
    }
    if let Some(ca_file) = &cli.ca_file {
        config.ca_certificates = Some(ca_file.clone());
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }

    config.validate().context("Invalid probe configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("check-xmpp").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_only() {
        let config = build(&parse(&["-H", "example.com", "--s2s", "-6", "-s", "-t", "3"])).unwrap();
        assert_eq!(config.host, "example.com");
        assert_eq!(config.mode, ConnectionMode::Server);
        assert_eq!(config.port(), 5269);
        assert_eq!(config.address_family, AddressFamily::Ipv6);
        assert!(config.force_starttls);
        assert!(config.verify_certificates);
        assert_eq!(config.timeout_secs, 3);
    }

    #[test]
    fn test_missing_host_is_rejected() {
        assert!(build(&parse(&[])).is_err());
    }

    #[test]
    fn test_out_of_range_timeout_is_rejected() {
        let err = build(&parse(&["-H", "example.com", "-t", "18446744073709551615"])).unwrap_err();
        assert!(format!("{:#}", err).contains("timeout"));
    }

    #[test]
    fn test_conflicting_families() {
        assert!(Cli::try_parse_from(["check-xmpp", "-4", "-6"]).is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"host = \"file.example.com\"\nport = 5223\ntimeout_secs = 20\nverify_certificates = true\n",
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = build(&parse(&["-c", &path, "-t", "5", "--no-check-certificates"])).unwrap();
        assert_eq!(config.host, "file.example.com");
        assert_eq!(config.port(), 5223);
        assert_eq!(config.timeout_secs, 5);
        assert!(!config.verify_certificates);
    }

    #[test]
    fn test_unreadable_config_file() {
        let err = build(&parse(&["-c", "/nonexistent/check-xmpp.toml"])).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to load config file"));
    }
}
