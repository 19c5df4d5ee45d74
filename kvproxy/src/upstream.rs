//! HTTP client for the inference backend.
//!
//! The backend is a llama.cpp-style server: OpenAI-compatible completion
//! endpoints plus model-scoped slot management routes. Save and restore
//! address KV files by a `filename` in the JSON body; the slot pin on
//! completion requests is duplicated in the body root, in `options`, and
//! in the query string because different backend builds read different
//! places.

use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Which completion endpoint a request came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionRoute {
    Chat,
    Completion,
}

impl CompletionRoute {
    pub fn path(&self) -> &'static str {
        match self {
            CompletionRoute::Chat => "/v1/chat/completions",
            CompletionRoute::Completion => "/v1/completions",
        }
    }
}

pub struct UpstreamClient {
    client: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn forward_error(e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::GatewayTimeout(format!("backend request timed out: {e}"))
        } else {
            Error::BadGateway(format!("backend unreachable: {e}"))
        }
    }

    /// Snapshot of the backend's slot states for one model.
    pub async fn list_slots(&self, model: &str) -> Result<Response> {
        self.client
            .get(format!("{}/models/{}/slots", self.base_url, model))
            .send()
            .await
            .map_err(Self::forward_error)
    }

    /// Load the named saved KV file into a slot. Idempotent when the slot
    /// already holds that save.
    pub async fn restore_slot(&self, model: &str, slot_id: usize, save_id: &str) -> Result<()> {
        self.slot_action("restore", model, slot_id, save_id).await
    }

    /// Persist the slot's current KV state under `save_id`.
    pub async fn save_slot(&self, model: &str, slot_id: usize, save_id: &str) -> Result<()> {
        self.slot_action("save", model, slot_id, save_id).await
    }

    async fn slot_action(
        &self,
        action: &str,
        model: &str,
        slot_id: usize,
        save_id: &str,
    ) -> Result<()> {
        let resp = self
            .client
            .post(format!(
                "{}/models/{}/slots/{}",
                self.base_url, model, slot_id
            ))
            .query(&[("action", action)])
            .json(&json!({ "filename": save_id }))
            .send()
            .await
            .map_err(Self::forward_error)?;

        if !resp.status().is_success() {
            return Err(Error::BadGateway(format!(
                "slot {action} returned {} for slot {slot_id}",
                resp.status()
            )));
        }
        debug!(action, slot = slot_id, save_id, "slot action ok");
        Ok(())
    }

    /// Forward a completion request pinned to a slot, returning the raw
    /// response for the caller to stream.
    pub async fn forward_completion(
        &self,
        route: CompletionRoute,
        slot_id: usize,
        body: &Value,
    ) -> Result<Response> {
        self.client
            .post(format!("{}{}", self.base_url, route.path()))
            .query(&[("slot_id", slot_id), ("id_slot", slot_id)])
            .json(body)
            .send()
            .await
            .map_err(Self::forward_error)
    }

    /// Pass-through of the backend's model discovery endpoint.
    pub async fn models(&self) -> Result<Response> {
        self.client
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await
            .map_err(Self::forward_error)
    }
}

/// Duplicate the slot pin in every place a backend build may read it.
pub fn pin_slot(body: &mut Value, slot_id: usize) {
    if let Some(root) = body.as_object_mut() {
        root.insert("slot_id".to_string(), json!(slot_id));
        root.insert("id_slot".to_string(), json!(slot_id));

        let options = root
            .entry("options")
            .or_insert_with(|| json!({}));
        if let Some(options) = options.as_object_mut() {
            options.insert("slot_id".to_string(), json!(slot_id));
            options.insert("id_slot".to_string(), json!(slot_id));
        }
    }
}

/// Ask the backend to keep the prompt's KV state around for big requests.
pub fn set_cache_flags(body: &mut Value, cache_prompt: bool) {
    if let Some(root) = body.as_object_mut() {
        root.insert("cache_prompt".to_string(), json!(cache_prompt));
        root.insert("n_keep".to_string(), json!(-1));

        let options = root
            .entry("options")
            .or_insert_with(|| json!({}));
        if let Some(options) = options.as_object_mut() {
            options.insert("cache_prompt".to_string(), json!(cache_prompt));
            options.insert("n_keep".to_string(), json!(-1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_paths() {
        assert_eq!(CompletionRoute::Chat.path(), "/v1/chat/completions");
        assert_eq!(CompletionRoute::Completion.path(), "/v1/completions");
    }

    #[test]
    fn test_base_url_trimmed() {
        let client = UpstreamClient::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_pin_slot_everywhere() {
        let mut body = json!({ "model": "m", "messages": [] });
        pin_slot(&mut body, 3);

        assert_eq!(body["slot_id"], 3);
        assert_eq!(body["id_slot"], 3);
        assert_eq!(body["options"]["slot_id"], 3);
        assert_eq!(body["options"]["id_slot"], 3);
    }

    #[test]
    fn test_pin_slot_keeps_existing_options() {
        let mut body = json!({ "options": { "temperature": 0.5 } });
        pin_slot(&mut body, 1);

        assert_eq!(body["options"]["temperature"], 0.5);
        assert_eq!(body["options"]["slot_id"], 1);
    }

    #[test]
    fn test_cache_flags() {
        let mut body = json!({});
        set_cache_flags(&mut body, true);
        assert_eq!(body["cache_prompt"], true);
        assert_eq!(body["n_keep"], -1);
        assert_eq!(body["options"]["cache_prompt"], true);

        set_cache_flags(&mut body, false);
        assert_eq!(body["cache_prompt"], false);
    }
}
