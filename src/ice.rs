use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::config::{Config, IceServer};
use crate::store::Store;

const CACHE_KEY: &str = "sys:ice-servers";
const CACHE_TTL: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// ICE server list assembly
// ---------------------------------------------------------------------------

/// Build the ICE server list handed out with every issued token.
///
/// Without a managed TURN endpoint configured this is just the static list.
/// With one, ephemeral TURN credentials are fetched over HTTPS and cached in
/// the store for an hour; any failure falls back to the static list so that
/// room creation never depends on the credential vendor being up.
pub async fn ice_servers(
    config: &Config,
    store: &Arc<dyn Store>,
    http: &reqwest::Client,
) -> Vec<IceServer> {
    let (Some(url), Some(api_key)) = (&config.turn_credentials_url, &config.turn_api_key) else {
        return config.ice_servers.clone();
    };

    if let Ok(Some((cached, _))) = store.fetch(CACHE_KEY).await {
        if let Ok(servers) = serde_json::from_str::<Vec<IceServer>>(&cached) {
            return servers;
        }
    }

    match fetch_credentials(http, url, api_key).await {
        Ok(servers) if !servers.is_empty() => {
            if let Ok(raw) = serde_json::to_string(&servers) {
                let _ = store.insert(CACHE_KEY, &raw, CACHE_TTL).await;
            }
            servers
        }
        Ok(_) => config.ice_servers.clone(),
        Err(e) => {
            warn!(error = %e, "TURN credential fetch failed, using static ICE list");
            config.ice_servers.clone()
        }
    }
}

/// Wire shape of managed TURN credential endpoints: `urls` may be a single
/// string or an array per entry.
#[derive(Deserialize)]
struct WireIceServer {
    urls: UrlList,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UrlList {
    One(String),
    Many(Vec<String>),
}

impl From<WireIceServer> for IceServer {
    fn from(wire: WireIceServer) -> Self {
        IceServer {
            urls: match wire.urls {
                UrlList::One(url) => vec![url],
                UrlList::Many(urls) => urls,
            },
            username: wire.username,
            credential: wire.credential,
        }
    }
}

async fn fetch_credentials(
    http: &reqwest::Client,
    url: &str,
    api_key: &str,
) -> std::result::Result<Vec<IceServer>, reqwest::Error> {
    let wire: Vec<WireIceServer> = http
        .get(url)
        .query(&[("apiKey", api_key)])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(wire.into_iter().map(IceServer::from).collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::store::MemoryStore;

    #[test]
    fn wire_urls_accepts_string_and_array() {
        let raw = r#"[
            {"urls":"turn:a.example.com:3478","username":"u","credential":"c"},
            {"urls":["stun:b.example.com:3478","turn:b.example.com:3478"]}
        ]"#;
        let servers: Vec<IceServer> = serde_json::from_str::<Vec<WireIceServer>>(raw)
            .unwrap()
            .into_iter()
            .map(IceServer::from)
            .collect();

        assert_eq!(servers[0].urls, vec!["turn:a.example.com:3478"]);
        assert_eq!(servers[0].username.as_deref(), Some("u"));
        assert_eq!(servers[1].urls.len(), 2);
        assert!(servers[1].username.is_none());
    }

    #[tokio::test]
    async fn static_list_when_no_vendor_configured() {
        let config = test_config();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let servers = ice_servers(&config, &store, &reqwest::Client::new()).await;
        assert_eq!(servers, config.ice_servers);
    }

    #[tokio::test]
    async fn cached_credentials_win_over_vendor() {
        let mut config = test_config();
        config.turn_credentials_url = Some("https://unreachable.invalid/creds".into());
        config.turn_api_key = Some("k".into());

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let cached = vec![IceServer::stun("stun:cached.example.com:3478")];
        store
            .insert(CACHE_KEY, &serde_json::to_string(&cached).unwrap(), CACHE_TTL)
            .await
            .unwrap();

        let servers = ice_servers(&config, &store, &reqwest::Client::new()).await;
        assert_eq!(servers, cached);
    }
}
