/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Thin NMOS IS-04 Query API client: list RTP senders and resolve their SDP
//! manifests so a stream can be selected by label on the command line.

use crate::error::{NmosError, NmosResult};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_QUERY_VERSION: &str = "v1.3";

const RTP_TRANSPORT: &str = "urn:x-nmos:transport:rtp";

#[derive(Debug, Clone, Deserialize)]
pub struct SenderInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub manifest_href: Option<String>,
    #[serde(default)]
    pub flow_id: Option<String>,
}

pub struct NmosQueryClient {
    base_url: String,
    http: reqwest::Client,
}

impl NmosQueryClient {
    pub fn new(registry_url: &str) -> Self {
        let base_url = if registry_url.contains("://") {
            registry_url.trim_end_matches('/').to_owned()
        } else {
            format!("http://{}", registry_url.trim_end_matches('/'))
        };
        NmosQueryClient {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    /// Lists the registry's RTP senders that carry a manifest.
    pub async fn list_senders(&self, query_version: &str) -> NmosResult<Vec<SenderInfo>> {
        let url = format!("{}/x-nmos/query/{}/senders", self.base_url, query_version);
        debug!("GET {url}");
        let response = self.http.get(&url).send().await?.error_for_status()?;
        let json: Value = response.json().await?;

        // The Query API returns an array; some implementations wrap it in an
        // object with an `items` member.
        let items = match &json {
            Value::Array(items) => items.clone(),
            Value::Object(obj) => match obj.get("items") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        let mut senders = Vec::with_capacity(items.len());
        for item in items {
            let Ok(mut sender) = serde_json::from_value::<SenderInfo>(item) else {
                continue;
            };
            if sender.transport != RTP_TRANSPORT {
                continue;
            }
            if sender.manifest_href.as_deref().unwrap_or("").is_empty() {
                continue;
            }
            if sender.label.is_empty() {
                sender.label = sender.id.clone();
            }
            senders.push(sender);
        }
        Ok(senders)
    }

    /// Resolves a sender by label (exact match first, then substring) and
    /// fetches its SDP manifest.
    pub async fn fetch_sdp_by_label(
        &self,
        query_version: &str,
        label: &str,
    ) -> NmosResult<String> {
        let senders = self.list_senders(query_version).await?;
        let sender = senders
            .iter()
            .find(|s| s.label == label)
            .or_else(|| senders.iter().find(|s| s.label.contains(label)))
            .ok_or_else(|| NmosError::NoSuchSender(label.to_owned()))?;

        let manifest = sender
            .manifest_href
            .as_deref()
            .ok_or_else(|| NmosError::NoManifest(sender.id.clone()))?;
        self.fetch_text(manifest).await
    }

    pub async fn fetch_text(&self, url: &str) -> NmosResult<String> {
        debug!("GET {url}");
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_url_gets_a_scheme() {
        let client = NmosQueryClient::new("registry.local:8080");
        assert_eq!(client.base_url, "http://registry.local:8080");
        let client = NmosQueryClient::new("https://registry.local/");
        assert_eq!(client.base_url, "https://registry.local");
    }

    #[test]
    fn sender_info_deserializes_from_query_api_shape() {
        let json = serde_json::json!({
            "id": "a8500668-9218-4063-ba36-9f4900b0fb3b",
            "label": "Stage Box 8ch",
            "description": "",
            "transport": "urn:x-nmos:transport:rtp",
            "manifest_href": "http://node.local/sdp/stream.sdp",
            "flow_id": "0554b43a-ea7c-41d1-b00c-6b4474dc746e"
        });
        let sender: SenderInfo = serde_json::from_value(json).expect("valid sender");
        assert_eq!(sender.label, "Stage Box 8ch");
        assert_eq!(
            sender.manifest_href.as_deref(),
            Some("http://node.local/sdp/stream.sdp")
        );
    }
}
