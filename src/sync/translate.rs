//! Settings maps for kinds whose definitions keep connection details in the
//! `http` and `auth` sections instead of `settings`.

use serde_json::{Map, Value, json};

use crate::datasource::DatasourceInfo;

const RESERVED_KINDS: [&str; 2] = ["prometheus", "loki"];

/// Kinds served by other subsystems and never cached here.
pub fn is_reserved(kind: &str) -> bool {
    RESERVED_KINDS.contains(&kind)
}

/// Strips the `.logging` suffix and resolves `elasticsearch` to `es`.
pub fn normalize_kind(kind: &str) -> String {
    let kind = kind.replace(".logging", "");
    match kind.as_str() {
        "elasticsearch" => "es".to_string(),
        _ => kind,
    }
}

/// Settings map the registry decodes for `kind`.
pub fn settings_for(kind: &str, info: &DatasourceInfo) -> Map<String, Value> {
    match kind {
        "es" => search_settings("es", info),
        "opensearch" if !info.settings.contains_key("os.nodes") => search_settings("os", info),
        "tdengine" => tdengine_settings(info),
        _ => info.settings.clone(),
    }
}

fn nodes(info: &DatasourceInfo) -> Vec<String> {
    if info.http.urls.is_empty() {
        vec![info.http.url.clone()]
    } else {
        info.http.urls.clone()
    }
}

/// Copies `settings[from]` to `to` when present and not null.
fn copy_setting(info: &DatasourceInfo, settings: &mut Map<String, Value>, from: &str, to: String) {
    match info.settings.get(from) {
        None | Some(Value::Null) => {}
        Some(value) => {
            settings.insert(to, value.clone());
        }
    }
}

fn search_settings(prefix: &str, info: &DatasourceInfo) -> Map<String, Value> {
    let key = |name: &str| format!("{}.{}", prefix, name);
    let mut settings = Map::new();
    settings.insert(key("nodes"), json!(nodes(info)));
    settings.insert(key("timeout"), json!(info.http.timeout));
    settings.insert(
        key("basic"),
        json!({
            key("auth.enable"): info.auth.basic_auth,
            key("user"): info.auth.basic_auth_user,
            key("password"): info.auth.basic_auth_password,
        }),
    );
    settings.insert(
        key("tls"),
        json!({ key("tls.skip_tls_verify"): info.http.tls.skip_tls_verify }),
    );
    settings.insert(key("headers"), json!(info.http.headers));
    settings.insert(key("cluster_name"), json!(info.name));
    match info.settings.get("version") {
        Some(Value::String(version)) => {
            settings.insert(key("version"), json!(version));
        }
        Some(Value::Number(version)) => {
            settings.insert(key("version"), json!(version.to_string()));
        }
        _ => {}
    }
    copy_setting(info, &mut settings, "min_interval", key("min_interval"));
    copy_setting(info, &mut settings, "max_shard", key("max_shard"));
    settings
}

fn tdengine_settings(info: &DatasourceInfo) -> Map<String, Value> {
    let mut settings = Map::new();
    settings.insert("tdengine.cluster_name".to_string(), json!(info.name));
    settings.insert("tdengine.addr".to_string(), json!(info.http.url));
    settings.insert("tdengine.timeout".to_string(), json!(info.http.timeout));
    settings.insert("tdengine.dial_timeout".to_string(), json!(info.http.dial_timeout));
    settings.insert(
        "tdengine.max_idle_conns_per_host".to_string(),
        json!(info.http.max_idle_conns_per_host),
    );
    settings.insert("tdengine.headers".to_string(), json!(info.http.headers));
    settings.insert(
        "tdengine.skip_tls_verify".to_string(),
        json!(info.http.tls.skip_tls_verify),
    );
    settings.insert(
        "tdengine.basic".to_string(),
        json!({
            "tdengine.user": info.auth.basic_auth_user,
            "tdengine.password": info.auth.basic_auth_password,
        }),
    );
    settings
}
