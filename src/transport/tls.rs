//! Broker endpoint and TLS transport selection.
//!
//! `mqtt_host` may be a bare host, `host:port`, or carry a scheme:
//! - `mqtt://` / `tcp://` plain TCP
//! - `mqtts://` / `ssl://` TLS
//!
//! TLS uses rustls with the webpki roots unless a CA certificate is
//! configured.

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::Path;

use crate::config::MqttSettings;

/// MQTT endpoint with TLS flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    pub fn from_settings(settings: &MqttSettings) -> Result<Self> {
        parse_mqtt_endpoint(&settings.host, settings.port, settings.use_tls)
    }
}

/// PEM-encoded CA certificate for the broker. `None` means webpki roots.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
}

impl TlsMaterials {
    pub fn load(ca_path: Option<&Path>) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };
        Ok(Self { ca })
    }

    /// Build a rumqttc Transport for `endpoint`.
    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.ca.is_some() {
                return Err(anyhow!(
                    "MQTT TLS CA provided but TLS is disabled (set mqtt_use_tls or use mqtts://)"
                ));
            }
            return Ok(Transport::tcp());
        }
        match &self.ca {
            Some(ca) => Ok(Transport::tls(ca.clone(), None, None)),
            None => Ok(Transport::tls_with_default_config()),
        }
    }
}

/// Parse a broker address, using `default_port` when none is given.
pub fn parse_mqtt_endpoint(addr: &str, default_port: u16, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    let remainder = remainder.trim_end_matches('/');
    if remainder.is_empty() {
        return Err(anyhow!("MQTT host is empty"));
    }

    let (host, port) = split_host_port(remainder, default_port)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    // IPv6 in brackets: [::1]:1883 or [::1]
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    // Bare IPv6 without brackets carries no port.
    if addr.matches(':').count() > 1 {
        return Ok((addr.to_string(), default_port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_uses_configured_port() {
        let ep = parse_mqtt_endpoint("core-mosquitto", 1884, false).unwrap();
        assert_eq!(ep.host, "core-mosquitto");
        assert_eq!(ep.port, 1884);
        assert!(!ep.use_tls);
    }

    #[test]
    fn explicit_port_wins() {
        let ep = parse_mqtt_endpoint("127.0.0.1:1999", 1883, false).unwrap();
        assert_eq!(ep.port, 1999);
    }

    #[test]
    fn mqtts_scheme_enables_tls() {
        let ep = parse_mqtt_endpoint("mqtts://broker.example.com:8883", 1883, false).unwrap();
        assert_eq!(ep.host, "broker.example.com");
        assert_eq!(ep.port, 8883);
        assert!(ep.use_tls);
    }

    #[test]
    fn ipv6_forms() {
        let ep = parse_mqtt_endpoint("[::1]:1883", 1000, false).unwrap();
        assert_eq!((ep.host.as_str(), ep.port), ("::1", 1883));
        let ep = parse_mqtt_endpoint("[::1]", 1000, false).unwrap();
        assert_eq!(ep.port, 1000);
        let ep = parse_mqtt_endpoint("fe80::1", 1000, false).unwrap();
        assert_eq!((ep.host.as_str(), ep.port), ("fe80::1", 1000));
    }

    #[test]
    fn rejects_unknown_scheme_and_empty_host() {
        assert!(parse_mqtt_endpoint("ws://broker:80", 1883, false).is_err());
        assert!(parse_mqtt_endpoint("mqtt://", 1883, false).is_err());
        assert!(parse_mqtt_endpoint("broker:notaport", 1883, false).is_err());
    }

    #[test]
    fn ca_without_tls_is_rejected() {
        let materials = TlsMaterials {
            ca: Some(b"-----BEGIN CERTIFICATE-----".to_vec()),
        };
        let ep = parse_mqtt_endpoint("localhost", 1883, false).unwrap();
        assert!(materials.build_transport(&ep).is_err());
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        let err = TlsMaterials::load(Some(Path::new("/nonexistent/ca.pem"))).unwrap_err();
        assert!(err.to_string().contains("MQTT TLS CA"));
    }
}
