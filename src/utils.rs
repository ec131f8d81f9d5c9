use crate::peer::types::ServerConfig;
use rand::Rng;

/// Случайный идентификатор (16 hex-символов)
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Добавляет схему протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        return config.url.clone();
    }
    let scheme = if config.r#type == "turn" {
        "turn:"
    } else {
        "stun:"
    };
    format!("{}{}", scheme, config.url)
}
