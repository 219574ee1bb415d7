use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the WebSocket listener, the broker and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the WebSocket listener.
///
/// With no `port` the listener probes for a free one in
/// `port_range_start..port_range_end`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: Option<u16>,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub root_path: String,
}

/// Configuration settings for the broker.
///
/// `queue_capacity` bounds each connection's inbound and outbound queue. A
/// non-empty `access_tokens` list turns on token validation at connect time.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub queue_capacity: usize,
    pub access_tokens: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub port_range_start: Option<u16>,
    pub port_range_end: Option<u16>,
    pub root_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub queue_capacity: Option<usize>,
    pub access_tokens: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            broker: BrokerSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            port_range_start: 49215,
            port_range_end: 65535,
            root_path: "/".to_string(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            access_tokens: Vec::new(),
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(defaults.server.host),
                port: server.port.or(defaults.server.port),
                port_range_start: server
                    .port_range_start
                    .unwrap_or(defaults.server.port_range_start),
                port_range_end: server
                    .port_range_end
                    .unwrap_or(defaults.server.port_range_end),
                root_path: server.root_path.unwrap_or(defaults.server.root_path),
            },
            broker: BrokerSettings {
                queue_capacity: broker
                    .queue_capacity
                    .unwrap_or(defaults.broker.queue_capacity),
                access_tokens: broker
                    .access_tokens
                    .unwrap_or(defaults.broker.access_tokens),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(defaults.logging.level),
            },
        }
    }
}
