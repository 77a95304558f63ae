//! Snowflake client configuration
//!
//! Snowflake takes most of its configuration per connection. Keys a SOCKS
//! client does not send are filled in from [`SnowflakeSettings`] before
//! [`parse_args`] builds the snapshot for one dial.

use crate::args::PtArgs;
use crate::dialer::ProxyUrl;
use crate::transport::ParsedArgs;
use crate::{Error, Result};

/// SnowflakeConfig is one connection's view of the snowflake client setup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnowflakeConfig {
    pub broker_url: String,
    pub ampcache_url: String,
    pub sqs_queue_url: String,
    pub sqs_creds: String,
    pub front_domains: Vec<String>,
    pub ice_addresses: Vec<String>,
    pub max: Option<i64>,
    pub utls_remove_sni: bool,
    pub utls_client_id: String,
    pub bridge_fingerprint: String,
    pub proxy: String,
}

impl SnowflakeConfig {
    /// to_args encodes the snapshot back into arguments for the
    /// snowflake-client executable. Empty fields are left out.
    pub fn to_args(&self) -> PtArgs {
        let mut args = PtArgs::new();
        let mut put = |key: &str, value: &str| {
            if !value.is_empty() {
                args.set(key, value);
            }
        };

        put("url", &self.broker_url);
        put("ampcache", &self.ampcache_url);
        put("sqsqueue", &self.sqs_queue_url);
        put("sqscreds", &self.sqs_creds);
        put("fronts", &self.front_domains.join(","));
        put("ice", &self.ice_addresses.join(","));
        put("utls-imitate", &self.utls_client_id);
        put("fingerprint", &self.bridge_fingerprint);
        put("proxy", &self.proxy);

        if let Some(max) = self.max {
            args.set("max", max.to_string());
        }
        if self.utls_remove_sni {
            args.set("utls-nosni", "true");
        }

        args
    }
}

/// parse_args builds a snowflake snapshot out of connection arguments.
/// Unknown keys are ignored.
pub fn parse_args(args: &PtArgs) -> Result<ParsedArgs> {
    parse_config(SnowflakeConfig::default(), args).map(ParsedArgs::Snowflake)
}

/// parse_config overlays args on a copy of base
pub fn parse_config(mut config: SnowflakeConfig, args: &PtArgs) -> Result<SnowflakeConfig> {
    if let Some(arg) = args.get("ampcache") {
        config.ampcache_url = arg.to_string();
    }
    if let Some(arg) = args.get("sqsqueue") {
        config.sqs_queue_url = arg.to_string();
    }
    if let Some(arg) = args.get("sqscreds") {
        config.sqs_creds = arg.to_string();
    }

    // "front" is the single-domain form older bridge lines use
    match (args.get("fronts"), args.get("front")) {
        (Some(fronts), _) if !fronts.is_empty() => config.front_domains = split_list(fronts),
        (Some(_), _) => {}
        (None, Some(front)) => config.front_domains = split_list(front),
        (None, None) => {}
    }

    if let Some(arg) = args.get("ice") {
        config.ice_addresses = split_list(arg);
    }
    if let Some(arg) = args.get("max") {
        let max = arg
            .parse::<i64>()
            .map_err(|_| Error::invalid_argument("max", arg))?;
        config.max = Some(max);
    }
    if let Some(arg) = args.get("url") {
        config.broker_url = arg.to_string();
    }
    if let Some(arg) = args.get("utls-nosni") {
        if arg.eq_ignore_ascii_case("true") || arg.eq_ignore_ascii_case("yes") {
            config.utls_remove_sni = true;
        }
    }
    if let Some(arg) = args.get("utls-imitate") {
        config.utls_client_id = arg.to_string();
    }
    if let Some(arg) = args.get("fingerprint") {
        config.bridge_fingerprint = arg.to_string();
    }
    if let Some(arg) = args.get("proxy") {
        config.proxy = arg.to_string();
    }

    Ok(config)
}

fn split_list(s: &str) -> Vec<String> {
    s.trim().split(',').map(str::to_string).collect()
}

/// SnowflakeSettings are the static client settings an app configures once.
/// They apply to every connection that leaves the matching key out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnowflakeSettings {
    /// Comma separated STUN/TURN servers
    pub ice_servers: String,
    pub broker_url: String,
    /// Comma separated domain fronts
    pub front_domains: String,
    pub ampcache_url: String,
    pub sqs_queue_url: String,
    pub sqs_creds: String,
    /// Peers to keep open at once. Anything below 1 is treated as 1.
    pub max_peers: i64,
}

impl Default for SnowflakeSettings {
    fn default() -> Self {
        Self {
            ice_servers: String::new(),
            broker_url: String::new(),
            front_domains: String::new(),
            ampcache_url: String::new(),
            sqs_queue_url: String::new(),
            sqs_creds: String::new(),
            max_peers: 1,
        }
    }
}

impl SnowflakeSettings {
    /// extra_args turns the settings into the static arguments merged into
    /// every snowflake connection
    pub fn extra_args(&self, proxy: Option<&ProxyUrl>) -> PtArgs {
        let mut args = PtArgs::new();

        args.set("fronts", self.front_domains.clone());
        args.set("ice", self.ice_servers.clone());
        args.set("max", self.max_peers.max(1).to_string());
        args.set("url", self.broker_url.clone());
        args.set("ampcache", self.ampcache_url.clone());
        args.set("sqsqueue", self.sqs_queue_url.clone());
        args.set("sqscreds", self.sqs_creds.clone());
        if let Some(proxy) = proxy {
            args.set("proxy", proxy.as_str());
        }

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> PtArgs {
        PtArgs::parse(s).unwrap()
    }

    fn snapshot(s: &str) -> SnowflakeConfig {
        match parse_args(&args(s)).unwrap() {
            ParsedArgs::Snowflake(config) => config,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_recognised_keys() {
        let config = snapshot(
            "url=https://broker.example/;ice=stun:a:3478,stun:b:3478;max=3;utls-nosni=YES;fingerprint=ABCD;whatever=1",
        );
        assert_eq!(config.broker_url, "https://broker.example/");
        assert_eq!(config.ice_addresses, vec!["stun:a:3478", "stun:b:3478"]);
        assert_eq!(config.max, Some(3));
        assert!(config.utls_remove_sni);
        assert_eq!(config.bridge_fingerprint, "ABCD");
    }

    #[test]
    fn test_fronts_fall_back_to_front() {
        assert_eq!(snapshot("front=a.example").front_domains, vec!["a.example"]);
        assert_eq!(
            snapshot("fronts=a.example,b.example;front=c.example").front_domains,
            vec!["a.example", "b.example"]
        );
        // An empty fronts key suppresses the legacy key too
        assert!(snapshot("fronts=;front=c.example").front_domains.is_empty());
    }

    #[test]
    fn test_bad_max_is_rejected() {
        let err = parse_args(&args("max=notanumber")).unwrap_err();
        assert_eq!(err.to_string(), "invalid SOCKS arg: max=notanumber");
    }

    #[test]
    fn test_negative_max_is_passed_on() {
        // The client decides what a non-positive peer count means
        assert_eq!(snapshot("max=-1").max, Some(-1));
        assert_eq!(snapshot("max=-1").to_args().get("max"), Some("-1"));
    }

    #[test]
    fn test_parse_does_not_touch_base() {
        let base = SnowflakeConfig {
            broker_url: "https://base.example/".into(),
            ..Default::default()
        };
        let config = parse_config(base.clone(), &args("url=https://other.example/")).unwrap();
        assert_eq!(config.broker_url, "https://other.example/");
        assert_eq!(base.broker_url, "https://base.example/");
    }

    #[test]
    fn test_settings_clamp_max_and_merge() {
        let settings = SnowflakeSettings {
            broker_url: "https://broker.example/".into(),
            max_peers: -4,
            ..Default::default()
        };
        let extra = settings.extra_args(None);
        assert_eq!(extra.get("max"), Some("1"));

        let mut conn = args("url=;ice=stun:c:3478");
        conn.merge_defaults(&extra);
        let config = parse_config(SnowflakeConfig::default(), &conn).unwrap();
        assert_eq!(config.broker_url, "https://broker.example/");
        assert_eq!(config.ice_addresses, vec!["stun:c:3478"]);
    }

    #[test]
    fn test_to_args_skips_empty_fields() {
        let config = snapshot("url=https://b.example/;max=2");
        let encoded = config.to_args();
        assert_eq!(encoded.get("url"), Some("https://b.example/"));
        assert_eq!(encoded.get("max"), Some("2"));
        assert_eq!(encoded.get("ice"), None);
    }
}
