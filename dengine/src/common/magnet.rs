use url_encoder::url_encoder;

use super::info_hash::{InfoHash, InfoHashError};

const MAGNET_PREFIX: &str = "magnet:?";
const BTIH_PREFIX: &str = "urn:btih:";

/// Parsed `magnet:` URI.
///
/// Only `xt`, `dn` and `tr` are interpreted; unknown parameters are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magnet {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

/// Possible `Magnet` parsing errors.
#[derive(Debug, PartialEq)]
pub enum MagnetError {
    NotAMagnetUri,
    MissingInfoHash,
    InvalidInfoHash(InfoHashError),
    InvalidParameter,
}

impl Magnet {
    /// Parses a magnet URI string.
    ///
    /// It returns a `MagnetError` if:
    /// - The string does not start with `magnet:?`.
    /// - There is no `xt=urn:btih:` parameter.
    /// - The infohash is neither 40-char hex nor 32-char base32.
    pub fn parse(uri: &str) -> Result<Magnet, MagnetError> {
        let query = uri
            .strip_prefix(MAGNET_PREFIX)
            .ok_or(MagnetError::NotAMagnetUri)?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for param in query.split('&') {
            let (key, value) = match param.split_once('=') {
                Some(pair) => pair,
                None => continue,
            };
            match key {
                "xt" => {
                    let urn = value
                        .strip_prefix(BTIH_PREFIX)
                        .ok_or(MagnetError::MissingInfoHash)?;
                    info_hash = Some(Self::parse_btih(urn)?);
                }
                "dn" => {
                    let decoded = url_encoder::decode(value)
                        .map_err(|_| MagnetError::InvalidParameter)?;
                    display_name = String::from_utf8(decoded).ok();
                }
                "tr" => {
                    let decoded = url_encoder::decode(value)
                        .map_err(|_| MagnetError::InvalidParameter)?;
                    if let Ok(tracker) = String::from_utf8(decoded) {
                        trackers.push(tracker);
                    }
                }
                _ => {}
            }
        }

        Ok(Magnet {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            display_name,
            trackers,
        })
    }

    fn parse_btih(urn: &str) -> Result<InfoHash, MagnetError> {
        match urn.len() {
            40 => InfoHash::from_hex(urn).map_err(MagnetError::InvalidInfoHash),
            32 => InfoHash::from_base32(urn).map_err(MagnetError::InvalidInfoHash),
            _ => Err(MagnetError::InvalidInfoHash(InfoHashError::InvalidLength)),
        }
    }

    /// Reserializes the magnet as a URI, for persistence.
    pub fn to_uri(&self) -> String {
        let mut uri = format!("{}xt={}{}", MAGNET_PREFIX, BTIH_PREFIX, self.info_hash.to_hex());
        if let Some(name) = &self.display_name {
            uri.push_str("&dn=");
            uri.push_str(&url_encoder::encode(name.as_bytes()));
        }
        for tracker in &self.trackers {
            uri.push_str("&tr=");
            uri.push_str(&url_encoder::encode(tracker.as_bytes()));
        }
        uri
    }
}
