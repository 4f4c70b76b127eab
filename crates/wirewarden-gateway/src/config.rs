use std::env;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use thiserror::Error;
use tracing::warn;

/// Process configuration, loaded once at startup from the environment
/// (spec §6 "Environment variables").
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub data_dir: String,
    pub geoip_data_dir: String,
    pub encryption_key: [u8; 32],

    pub server_public_ip: Ipv4Addr,
    pub server_private_key: String,
    pub wg_interface: String,
    pub wg_listen_port: u16,
    pub peer_cidr: Ipv4Network,
    pub mesh_cidr: Option<Ipv4Network>,
    pub dns_address: Option<String>,
    pub trusted_proxy_cidrs: Vec<Ipv4Network>,

    pub identity_service_url: String,
    pub identity_service_token: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("ENCRYPTION_KEY must be exactly 64 hex characters (32 bytes)")]
    InvalidEncryptionKey,

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

fn require_env(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingEnvVar { var })
}

fn parse_hex_32(hex: &str) -> Result<[u8; 32], ConfigError> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(ConfigError::InvalidEncryptionKey);
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| ConfigError::InvalidEncryptionKey)?;
    }
    Ok(out)
}

fn parse_required<T: std::str::FromStr>(var: &'static str) -> Result<T, ConfigError> {
    let raw = require_env(var)?;
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue { var, value: raw })
}

fn parse_cidr_list(raw: &str) -> Vec<Ipv4Network> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let encryption_key = parse_hex_32(&require_env("ENCRYPTION_KEY")?)?;

        let trusted_proxy_cidrs =
            parse_cidr_list(&env::var("TRUSTED_PROXY_CIDRS").unwrap_or_default());
        if trusted_proxy_cidrs.is_empty() {
            warn!(
                "TRUSTED_PROXY_CIDRS is empty: every remote peer's X-Forwarded-For/X-Real-IP \
                 header will be trusted for rate-limiting purposes; set it on a fresh install"
            );
        }

        let mesh_cidr = env::var("MESH_CIDR").ok().and_then(|s| s.parse().ok());
        let dns_address = env::var("DNS_ADDRESS").ok();

        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/wirewarden".to_string()),
            geoip_data_dir: env::var("GEOIP_DATA_DIR")
                .unwrap_or_else(|_| "/var/lib/wirewarden/geoip".to_string()),
            encryption_key,

            server_public_ip: parse_required("SERVER_PUBLIC_IP")?,
            server_private_key: require_env("SERVER_PRIVATE_KEY")?,
            wg_interface: env::var("WG_INTERFACE").unwrap_or_else(|_| "wwg0".to_string()),
            wg_listen_port: env::var("WG_LISTEN_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(51820),
            peer_cidr: parse_required("PEER_CIDR")?,
            mesh_cidr,
            dns_address,
            trusted_proxy_cidrs,

            identity_service_url: require_env("IDENTITY_SERVICE_URL")?,
            identity_service_token: require_env("IDENTITY_SERVICE_TOKEN")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cidr_list_skips_blank_and_invalid() {
        let parsed = parse_cidr_list("10.0.0.0/8, , garbage, 192.168.0.0/16");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn parse_hex_32_rejects_wrong_length() {
        assert!(parse_hex_32("abcd").is_err());
    }

    #[test]
    fn parse_hex_32_accepts_64_chars() {
        let hex = "00".repeat(32);
        assert_eq!(parse_hex_32(&hex).unwrap(), [0u8; 32]);
    }
}
