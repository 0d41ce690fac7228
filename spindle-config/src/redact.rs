use crate::model::AppConfig;

const REDACTED: &str = "***";

/// Render `config` as JSON with [`crate::model::Secrets`] fields masked,
/// for `GET /config` (spec.md §6: "Redact API-key fields as `\"***\"`").
pub fn redacted_json(config: &AppConfig) -> anyhow::Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;
    if let Some(secrets) = value.pointer_mut("/secrets").and_then(|v| v.as_object_mut()) {
        for key in ["tmdb_api_key", "makemkv_key"] {
            if let Some(entry) = secrets.get_mut(key)
                && !entry.is_null()
            {
                *entry = serde_json::Value::String(REDACTED.to_string());
            }
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_only_secret_fields() {
        let mut config = AppConfig::default();
        config.secrets.tmdb_api_key = Some("sekrit".to_string());
        config.secrets.makemkv_key = Some("also-sekrit".to_string());

        let json = redacted_json(&config).unwrap();
        assert_eq!(json["secrets"]["tmdb_api_key"], "***");
        assert_eq!(json["secrets"]["makemkv_key"], "***");
        assert_eq!(json["max_concurrent_matches"], 2);
    }

    #[test]
    fn leaves_unset_secrets_null() {
        let config = AppConfig::default();
        let json = redacted_json(&config).unwrap();
        assert!(json["secrets"]["tmdb_api_key"].is_null());
    }
}
