//! End-to-end request orchestration.
//!
//! A completion request is fingerprinted, matched against the prefix
//! index, pinned to a slot, optionally restored, forwarded, and streamed
//! back verbatim. Once the full response has been relayed, big prompts
//! whose fingerprint taught us something new are saved on the backend and
//! admitted to the cache. The slot is released on every exit path,
//! including a client disconnect mid-stream, via a drop guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::fingerprint::{self, BlockSig, Fingerprint};
use crate::index::LcpIndex;
use crate::meta::{self, CacheEntry, MetaStore};
use crate::slots::SlotManager;
use crate::upstream::{self, CompletionRoute, UpstreamClient};
use crate::{Error, Result};

pub struct Coordinator {
    config: Config,
    index: Arc<LcpIndex>,
    meta: Arc<MetaStore>,
    slots: Arc<SlotManager>,
    upstream: Arc<UpstreamClient>,
    preamble: Option<String>,
    next_request: AtomicU64,
}

/// Deferred admission work, carried across the response stream.
struct AdmissionPlan {
    model: String,
    slot_id: usize,
    fingerprint: Fingerprint,
}

/// Releases the slot on drop unless the stream completed cleanly and
/// released it with a resident hint.
struct ReleaseGuard {
    slots: Arc<SlotManager>,
    slot_id: usize,
    armed: bool,
}

impl ReleaseGuard {
    fn new(slots: Arc<SlotManager>, slot_id: usize) -> Self {
        Self {
            slots,
            slot_id,
            armed: true,
        }
    }

    fn release_with(mut self, final_entry: Option<&str>) {
        self.armed = false;
        self.slots.release(self.slot_id, final_entry);
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.armed {
            self.slots.release(self.slot_id, None);
        }
    }
}

impl Coordinator {
    pub fn new(
        config: Config,
        index: Arc<LcpIndex>,
        meta: Arc<MetaStore>,
        slots: Arc<SlotManager>,
        upstream: Arc<UpstreamClient>,
    ) -> Result<Self> {
        let preamble = config.system_preamble()?;
        Ok(Self {
            config,
            index,
            meta,
            slots,
            upstream,
            preamble,
            next_request: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &LcpIndex {
        &self.index
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /// Handle one completion request end to end.
    pub async fn handle_completion(
        self: Arc<Self>,
        route: CompletionRoute,
        mut body: Value,
    ) -> Result<Response> {
        let deadline = Instant::now() + self.config.request_timeout();
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);

        let model = body
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadRequest("missing `model`".to_string()))?
            .to_string();
        let prompt = extract_prompt(route, &body, self.preamble.as_deref())?;

        let fp = fingerprint::fingerprint(&prompt, self.config.words_per_block);
        let big = fp.word_count >= self.config.big_threshold_words && !fp.is_empty();

        let mut reuse = if big {
            self.index.lookup(&model, &fp, self.config.lcp_threshold)
        } else {
            debug!(
                request = request_id,
                words = fp.word_count,
                "below caching threshold"
            );
            None
        };
        if let Some(m) = &reuse {
            info!(
                request = request_id,
                save_id = %m.entry.save_id,
                matched_blocks = m.matched_blocks,
                ratio = m.ratio,
                "prefix candidate"
            );
        } else if big {
            info!(
                request = request_id,
                blocks = fp.blocks(),
                "no prefix candidate"
            );
        }

        let preferred = reuse.as_ref().map(|m| m.entry.save_id.clone());
        let slot_id = self
            .slots
            .assign(request_id, preferred.as_deref(), deadline)
            .await?;
        let guard = ReleaseGuard::new(self.slots.clone(), slot_id);

        self.slots.mark_busy(slot_id);
        if let Some(m) = &reuse {
            match self
                .upstream
                .restore_slot(&model, slot_id, &m.entry.save_id)
                .await
            {
                Ok(()) => {
                    let now = meta::unix_now();
                    self.index.touch(&m.entry.save_id, now);
                    if let Err(e) = self.meta.touch(&m.entry.save_id, now) {
                        warn!(save_id = %m.entry.save_id, error = %e, "metadata touch failed");
                    }
                }
                Err(e) => {
                    // Degrade to a plain forward; the request must not fail.
                    warn!(
                        request = request_id,
                        save_id = %m.entry.save_id,
                        error = %e,
                        "restore failed, continuing without prefix reuse"
                    );
                    reuse = None;
                }
            }
        }

        upstream::pin_slot(&mut body, slot_id);
        upstream::set_cache_flags(&mut body, big);

        let resp = self
            .upstream
            .forward_completion(route, slot_id, &body)
            .await?;
        if !resp.status().is_success() {
            return Err(Error::BadGateway(format!(
                "backend returned {}",
                resp.status()
            )));
        }

        let admission = if big && learned_more(reuse.as_ref().map(|m| &m.entry), &fp) {
            Some(AdmissionPlan {
                model,
                slot_id,
                fingerprint: fp,
            })
        } else {
            None
        };
        let reused_id = reuse.map(|m| m.entry.save_id);

        Ok(self.relay(resp, guard, admission, reused_id))
    }

    /// Stream the backend response to the client; on clean completion run
    /// the deferred admission, then release the slot with the save id it
    /// now holds.
    fn relay(
        self: Arc<Self>,
        resp: reqwest::Response,
        guard: ReleaseGuard,
        admission: Option<AdmissionPlan>,
        reused: Option<String>,
    ) -> Response {
        let status =
            StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let coordinator = self;
        let mut upstream_body = resp.bytes_stream();
        let stream = async_stream::stream! {
            let guard = guard;
            let mut clean = true;
            while let Some(chunk) = upstream_body.next().await {
                match chunk {
                    Ok(bytes) => yield Ok::<Bytes, std::io::Error>(bytes),
                    Err(e) => {
                        warn!(error = %e, "upstream stream aborted");
                        clean = false;
                        break;
                    }
                }
            }
            if clean {
                let final_id = coordinator.admit(admission, reused).await;
                guard.release_with(final_id.as_deref());
            }
            // An aborted stream, or a dropped client, releases through the
            // guard without admission.
        };

        let mut builder = Response::builder().status(status);
        if let Some(ct) = content_type {
            builder = builder.header("content-type", ct);
        }
        match builder.body(Body::from_stream(stream)) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "failed to build relay response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    /// Save the slot's KV state under a fresh id and persist the entry.
    /// Any failure logs and skips the remaining steps; the janitor reaps
    /// whatever half-state is left behind.
    async fn admit(&self, admission: Option<AdmissionPlan>, reused: Option<String>) -> Option<String> {
        let Some(plan) = admission else {
            return reused;
        };

        let save_id = Uuid::new_v4().simple().to_string();
        if let Err(e) = self
            .upstream
            .save_slot(&plan.model, plan.slot_id, &save_id)
            .await
        {
            warn!(%save_id, error = %e, "slot save failed, skipping admission");
            return reused;
        }

        let now = meta::unix_now();
        let entry = CacheEntry {
            save_id: save_id.clone(),
            model: plan.model,
            signatures: plan.fingerprint.signatures,
            word_count: plan.fingerprint.word_count,
            created_at: now,
            last_used_at: now,
            bytes_on_disk: self.kv_file_size(&save_id),
        };
        if let Err(e) = self.meta.write(&entry) {
            warn!(%save_id, error = %e, "metadata write failed, skipping admission");
            return reused;
        }
        self.index.insert(entry);
        info!(%save_id, "cache entry admitted");
        Some(save_id)
    }

    /// Best-effort size of the backend's KV file for a save id.
    fn kv_file_size(&self, save_id: &str) -> Option<u64> {
        let dir = std::fs::read_dir(&self.config.cache_dir).ok()?;
        for dirent in dir.flatten() {
            let path = dirent.path();
            let name = path.file_name().and_then(|s| s.to_str());
            let stem = path.file_stem().and_then(|s| s.to_str());
            if name == Some(save_id) || stem == Some(save_id) {
                return dirent.metadata().ok().map(|m| m.len());
            }
        }
        None
    }
}

/// Admission only happens when the response extends what the cache knows:
/// no candidate at all, or a candidate whose fingerprint is a strict
/// prefix of the new one.
fn learned_more(prior: Option<&CacheEntry>, fp: &Fingerprint) -> bool {
    match prior {
        None => true,
        Some(entry) => is_strict_prefix(&entry.signatures, &fp.signatures),
    }
}

fn is_strict_prefix(prior: &[BlockSig], current: &[BlockSig]) -> bool {
    prior.len() < current.len() && current[..prior.len()] == *prior
}

/// Pull the prompt text out of a request body, in the order the backend
/// would see it.
fn extract_prompt(
    route: CompletionRoute,
    body: &Value,
    preamble: Option<&str>,
) -> Result<String> {
    let parts: Vec<String> = match route {
        CompletionRoute::Chat => {
            let messages = body
                .get("messages")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::BadRequest("missing `messages`".to_string()))?;
            messages
                .iter()
                .map(|message| content_text(message.get("content")))
                .collect()
        }
        CompletionRoute::Completion => match body.get("prompt") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items.iter().map(|v| content_text(Some(v))).collect(),
            _ => return Err(Error::BadRequest("missing `prompt`".to_string())),
        },
    };

    let text = fingerprint::raw_prompt(parts.iter().map(String::as_str), preamble);
    if text.is_empty() {
        return Err(Error::BadRequest("empty prompt".to_string()));
    }
    Ok(text)
}

fn content_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        // Structured content (e.g. multi-part messages) fingerprints as its
        // JSON text; the backend sees the same bytes either way.
        Some(other) => other.to_string(),
    }
}
