use std::{collections::HashMap, fs};

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub database_url: String,
    pub room_id: i64,
    pub user_id: Option<i64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            database_url: "sqlite://./data/chat_client.db".into(),
            room_id: 1,
            user_id: None,
        }
    }
}

/// Defaults, overridden by `console.toml`, overridden by environment
/// variables. Command-line flags are applied on top by the caller.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("console.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_file_config(&mut settings, &file_cfg);
        }
    }

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_ROOM_ID") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.room_id = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_USER_ID") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.user_id = Some(parsed);
        }
    }

    settings
}

fn apply_file_config(settings: &mut Settings, file_cfg: &HashMap<String, String>) {
    if let Some(v) = file_cfg.get("server_url") {
        settings.server_url = v.clone();
    }
    if let Some(v) = file_cfg.get("database_url") {
        settings.database_url = v.clone();
    }
    if let Some(v) = file_cfg.get("room_id") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.room_id = parsed;
        }
    }
    if let Some(v) = file_cfg.get("user_id") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.user_id = Some(parsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_overrides_defaults() {
        let mut settings = Settings::default();
        let file_cfg: HashMap<String, String> = toml::from_str(
            r#"
            server_url = "http://chat.internal:9000"
            room_id = "4"
            "#,
        )
        .expect("parse");

        apply_file_config(&mut settings, &file_cfg);
        assert_eq!(settings.server_url, "http://chat.internal:9000");
        assert_eq!(settings.room_id, 4);
        // Untouched keys keep their defaults.
        assert_eq!(settings.database_url, "sqlite://./data/chat_client.db");
        assert_eq!(settings.user_id, None);
    }

    #[test]
    fn unparseable_numbers_are_ignored() {
        let mut settings = Settings::default();
        let mut file_cfg = HashMap::new();
        file_cfg.insert("room_id".to_string(), "not-a-number".to_string());

        apply_file_config(&mut settings, &file_cfg);
        assert_eq!(settings.room_id, 1);
    }
}
