//! User agent configuration.
//!
//! Loaded from JSON (every field optional) or built in code; the public
//! address learned at runtime lives in [`crate::context::UaState`].

use std::time::Duration;

use serde::Deserialize;
use sip_core::SipUri;
use sip_transaction::TimerDefaults;

use crate::UaError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UaConfig {
    /// User part of the address of record
    pub user: String,
    pub domain: String,
    pub password: Option<String>,
    /// Sends every request to this proxy instead of the resolved target
    pub outbound_proxy: Option<String>,
    pub local_ip: String,
    /// Address advertised in Via and Contact until a `received` value is learned
    pub public_ip: Option<String>,
    pub sip_port: u16,
    /// Requested registration lifetime in seconds
    pub register_expires: u32,
    pub user_agent: String,
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
}

impl Default for UaConfig {
    fn default() -> Self {
        Self {
            user: "user".to_owned(),
            domain: "localhost".to_owned(),
            password: None,
            outbound_proxy: None,
            local_ip: "127.0.0.1".to_owned(),
            public_ip: None,
            sip_port: 5060,
            register_expires: 3600,
            user_agent: concat!("sip-ua/", env!("CARGO_PKG_VERSION")).to_owned(),
            t1_ms: 500,
            t2_ms: 4_000,
            t4_ms: 5_000,
        }
    }
}

impl UaConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn timer_defaults(&self) -> TimerDefaults {
        TimerDefaults {
            t1: Duration::from_millis(self.t1_ms),
            t2: Duration::from_millis(self.t2_ms),
            t4: Duration::from_millis(self.t4_ms),
        }
    }

    /// `sip:user@domain`, the address of record.
    pub fn profile_uri(&self) -> SipUri {
        SipUri::new(self.domain.as_str()).with_user(self.user.as_str())
    }

    /// `sip:domain`, the REGISTER request URI.
    pub fn registrar_uri(&self) -> SipUri {
        SipUri::new(self.domain.as_str())
    }

    pub fn outbound_proxy_uri(&self) -> Result<Option<SipUri>, UaError> {
        self.outbound_proxy
            .as_deref()
            .map(|raw| SipUri::parse(raw).ok_or_else(|| UaError::InvalidUri(raw.to_owned())))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = UaConfig::from_json(
            r#"{"user": "alice", "domain": "example.com", "password": "secret", "t1_ms": 100}"#,
        )
        .unwrap();
        assert_eq!(config.user, "alice");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.sip_port, 5060);
        assert_eq!(config.register_expires, 3600);
        assert_eq!(config.timer_defaults().t1, Duration::from_millis(100));
        assert_eq!(config.timer_defaults().t2, Duration::from_secs(4));
        assert_eq!(config.profile_uri().to_string(), "sip:alice@example.com");
    }

    #[test]
    fn bad_outbound_proxy_is_reported() {
        let config = UaConfig {
            outbound_proxy: Some("not a uri".to_owned()),
            ..UaConfig::default()
        };
        assert!(matches!(config.outbound_proxy_uri(), Err(UaError::InvalidUri(_))));

        let config = UaConfig {
            outbound_proxy: Some("sip:proxy.example.com:5080".to_owned()),
            ..UaConfig::default()
        };
        let proxy = config.outbound_proxy_uri().unwrap().unwrap();
        assert_eq!(proxy.port, Some(5080));
    }
}
