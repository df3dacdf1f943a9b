use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::str::FromStr;

use super::constants;

/// Policy for MSE/PE encrypted peer connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionPolicy {
    /// Never offer encryption.
    Disabled,
    /// Try encrypted first, fall back to plaintext on rejection.
    Prefer,
    /// Keep only encrypted sessions.
    Required,
}

impl FromStr for EncryptionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(EncryptionPolicy::Disabled),
            "prefer" => Ok(EncryptionPolicy::Prefer),
            "required" => Ok(EncryptionPolicy::Required),
            other => Err(format!("unknown encryption policy: {}", other)),
        }
    }
}

/// `Cfg` struct containing the config file information, previously created with `Cfg::new`.
///
/// - `tcp_port`: port to listen for incoming peer connections,
/// - `download_directory`: directory where downloaded content is stored,
/// - `session_directory`: directory backing the session key-value store,
/// - `max_connections`: engine-wide cap on peer connections across all torrents,
/// - `max_peers_per_torrent`: maximum number of simultaneous peers per torrent,
/// - `pipelining_size`: starting number of outstanding block requests per peer,
/// - `request_timeout_seconds`: age after which an outstanding block request is cancelled,
/// - `read_write_seconds_timeout`: socket read/write timeout,
/// - `maintenance_min/base/max_seconds`: adaptive connection-maintenance cadence,
/// - `dht_enabled` / `dht_port`: DHT node switch and UDP port,
/// - `encryption_policy`: disabled | prefer | required,
/// - `upload_rate_kbps` / `download_rate_kbps`: rate caps, 0 meaning unlimited.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub tcp_port: u16,
    pub download_directory: String,
    pub session_directory: String,
    pub max_connections: usize,
    pub max_peers_per_torrent: usize,
    pub pipelining_size: u32,
    pub request_timeout_seconds: u64,
    pub read_write_seconds_timeout: u64,
    pub maintenance_min_seconds: u64,
    pub maintenance_base_seconds: u64,
    pub maintenance_max_seconds: u64,
    pub dht_enabled: bool,
    pub dht_port: u16,
    pub encryption_policy: EncryptionPolicy,
    pub upload_rate_kbps: u64,
    pub download_rate_kbps: u64,
}

impl Cfg {
    /// Builds a Cfg struct containing the config file information by the given path.
    /// The format of the config file must be: {config_name}={config_value} (without brackets).
    /// In case of success it returns a Cfg struct.
    ///
    /// It returns an io::Error if:
    /// - The path to the config file does not exist or could not be open/read.
    /// - The config file has wrong format.
    /// - A wrong config_name was in the config file.
    /// - A numeric setting is not a valid number in the config file.
    /// - Minimum number of correct settings were not reached.
    pub fn new(path: &str) -> io::Result<Self> {
        let mut cfg = Self {
            tcp_port: 0,
            download_directory: String::from(""),
            session_directory: String::from(""),
            max_connections: 0,
            max_peers_per_torrent: 0,
            pipelining_size: 0,
            request_timeout_seconds: 0,
            read_write_seconds_timeout: 0,
            maintenance_min_seconds: 0,
            maintenance_base_seconds: 0,
            maintenance_max_seconds: 0,
            dht_enabled: false,
            dht_port: 0,
            encryption_policy: EncryptionPolicy::Disabled,
            upload_rate_kbps: 0,
            download_rate_kbps: 0,
        };

        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut settings_loaded = 0;

        for line in reader.lines() {
            let current_line = line?;
            let setting: Vec<&str> = current_line.split('=').collect();

            if setting.len() != 2 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config input: {}", current_line),
                ));
            }
            cfg = Self::load_setting(cfg, setting[0], setting[1])?;
            settings_loaded += 1;
        }
        if settings_loaded < constants::MIN_SETTINGS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Minimum number of correct settings were not reached: {}",
                    settings_loaded
                ),
            ));
        }
        Ok(cfg)
    }

    fn load_setting(mut self, name: &str, value: &str) -> io::Result<Self> {
        match name {
            constants::TCP_PORT => {
                self.tcp_port = self.parse_value(value, constants::TCP_PORT)?;
            }
            constants::DOWNLOAD_DIRECTORY => self.download_directory = String::from(value),

            constants::SESSION_DIRECTORY => self.session_directory = String::from(value),

            constants::MAX_CONNECTIONS => {
                self.max_connections = self.parse_value(value, constants::MAX_CONNECTIONS)?;
            }

            constants::MAX_PEERS_PER_TORRENT => {
                self.max_peers_per_torrent =
                    self.parse_value(value, constants::MAX_PEERS_PER_TORRENT)?;
            }

            constants::PIPELINING_SIZE => {
                self.pipelining_size = self.parse_value(value, constants::PIPELINING_SIZE)?;
            }

            constants::REQUEST_TIMEOUT_SECONDS => {
                self.request_timeout_seconds =
                    self.parse_value(value, constants::REQUEST_TIMEOUT_SECONDS)?;
            }

            constants::READ_WRITE_SECONDS_TIMEOUT => {
                self.read_write_seconds_timeout =
                    self.parse_value(value, constants::READ_WRITE_SECONDS_TIMEOUT)?;
            }

            constants::MAINTENANCE_MIN_SECONDS => {
                self.maintenance_min_seconds =
                    self.parse_value(value, constants::MAINTENANCE_MIN_SECONDS)?;
            }

            constants::MAINTENANCE_BASE_SECONDS => {
                self.maintenance_base_seconds =
                    self.parse_value(value, constants::MAINTENANCE_BASE_SECONDS)?;
            }

            constants::MAINTENANCE_MAX_SECONDS => {
                self.maintenance_max_seconds =
                    self.parse_value(value, constants::MAINTENANCE_MAX_SECONDS)?;
            }

            constants::DHT_ENABLED => {
                self.dht_enabled = self.parse_value(value, constants::DHT_ENABLED)?;
            }

            constants::DHT_PORT => {
                self.dht_port = self.parse_value(value, constants::DHT_PORT)?;
            }

            constants::ENCRYPTION_POLICY => {
                self.encryption_policy = self.parse_value(value, constants::ENCRYPTION_POLICY)?;
            }

            constants::UPLOAD_RATE_KBPS => {
                self.upload_rate_kbps = self.parse_value(value, constants::UPLOAD_RATE_KBPS)?;
            }

            constants::DOWNLOAD_RATE_KBPS => {
                self.download_rate_kbps = self.parse_value(value, constants::DOWNLOAD_RATE_KBPS)?;
            }

            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config setting name: {}", name),
                ))
            }
        }
        Ok(self)
    }

    fn parse_value<F>(&self, value: &str, setting: &str) -> io::Result<F>
    where
        F: FromStr,
    {
        let parse = value.parse::<F>();
        match parse {
            Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Invalid setting: {}, is not a valid type: {}",
                    setting, value
                ),
            )),
            Ok(parse) => Ok(parse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write};

    const FULL_CONFIG: &[u8] = b"TCP_PORT=6881\nDOWNLOAD_DIRECTORY=./download\nSESSION_DIRECTORY=./session\nMAX_CONNECTIONS=200\nMAX_PEERS_PER_TORRENT=50\nPIPELINING_SIZE=8\nREQUEST_TIMEOUT_SECONDS=10\nREAD_WRITE_SECONDS_TIMEOUT=120\nMAINTENANCE_MIN_SECONDS=1\nMAINTENANCE_BASE_SECONDS=5\nMAINTENANCE_MAX_SECONDS=30\nDHT_ENABLED=true\nDHT_PORT=6881\nENCRYPTION_POLICY=prefer\nUPLOAD_RATE_KBPS=0\nDOWNLOAD_RATE_KBPS=0";

    #[test]
    fn test_good_config() {
        let path = "./test_good_config.cfg";
        create_and_write_file(path, FULL_CONFIG);

        let config = Cfg::new(path).unwrap();

        assert_eq!(config.tcp_port, 6881);
        assert_eq!(config.download_directory, "./download");
        assert_eq!(config.session_directory, "./session");
        assert_eq!(config.max_connections, 200);
        assert_eq!(config.max_peers_per_torrent, 50);
        assert_eq!(config.pipelining_size, 8);
        assert_eq!(config.request_timeout_seconds, 10);
        assert_eq!(config.read_write_seconds_timeout, 120);
        assert_eq!(config.maintenance_min_seconds, 1);
        assert_eq!(config.maintenance_base_seconds, 5);
        assert_eq!(config.maintenance_max_seconds, 30);
        assert!(config.dht_enabled);
        assert_eq!(config.dht_port, 6881);
        assert_eq!(config.encryption_policy, EncryptionPolicy::Prefer);
        assert_eq!(config.upload_rate_kbps, 0);
        assert_eq!(config.download_rate_kbps, 0);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_bad_path() {
        let path = "bad path";
        let config = Cfg::new(path);
        assert!(config.is_err());
    }

    #[test]
    fn test_empty_file() {
        let path = "./test_empty_file.cfg";
        create_and_write_file(path, b"");

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_setting_doesnt_exist() {
        let path = "./test_setting_doesnt_exist.cfg";
        create_and_write_file(path, b"WRONG_SETTING=1000");

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_bad_number_of_settings() {
        let path = "./test_bad_number_of_settings.cfg";
        create_and_write_file(path, b"TCP_PORT=1000\nDOWNLOAD_DIRECTORY=./download");

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_tcp_port_not_a_number() {
        let path = "./test_tcp_port_not_a_number.cfg";
        let contents = String::from_utf8_lossy(FULL_CONFIG).replace("TCP_PORT=6881", "TCP_PORT=abcd");
        create_and_write_file(path, contents.as_bytes());

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_dht_enabled_not_a_bool() {
        let path = "./test_dht_enabled_not_a_bool.cfg";
        let contents =
            String::from_utf8_lossy(FULL_CONFIG).replace("DHT_ENABLED=true", "DHT_ENABLED=yes");
        create_and_write_file(path, contents.as_bytes());

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_unknown_encryption_policy() {
        let path = "./test_unknown_encryption_policy.cfg";
        let contents = String::from_utf8_lossy(FULL_CONFIG)
            .replace("ENCRYPTION_POLICY=prefer", "ENCRYPTION_POLICY=always");
        create_and_write_file(path, contents.as_bytes());

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_order_doesnt_matter() {
        let path = "./test_order_doesnt_matter.cfg";
        let mut lines: Vec<&str> = std::str::from_utf8(FULL_CONFIG).unwrap().split('\n').collect();
        lines.reverse();
        create_and_write_file(path, lines.join("\n").as_bytes());

        let config = Cfg::new(path).unwrap();
        assert_eq!(config.tcp_port, 6881);
        assert_eq!(config.encryption_policy, EncryptionPolicy::Prefer);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_bad_format() {
        let path = "./test_bad_format.cfg";
        create_and_write_file(path, b"TCP_PORT=abcd=1234");

        create_and_assert_config_is_not_ok(path);
    }

    // Auxiliary functions

    fn create_and_write_file(path: &str, contents: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(contents).unwrap();
    }

    fn create_and_assert_config_is_not_ok(path: &str) {
        let config = Cfg::new(path);
        assert!(config.is_err());
        fs::remove_file(path).unwrap();
    }
}
