//! Media attachment materialisation.
//!
//! Adapters describe media they found in an inbound update as
//! [`MediaSource`] records; a [`MediaFetcher`] turns them into concrete
//! [`Attachment`]s. Fetch failures degrade to "no attachment" so a dead
//! CDN link never drops the message text.

use crate::ChannelContext;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use berth_core::message::Attachment;

/// Hard cap on attachments per inbound message.
pub const MAX_ATTACHMENTS: usize = 8;

/// Inline data above this size is kept as a remote URL instead of a
/// data URL.
const MAX_INLINE_BYTES: usize = 512 * 1024;

/// A media reference found while decoding an inbound update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    /// Coarse kind: `image`, `audio`, `video`, `document`.
    pub kind: String,
    /// Either a direct URL, or a provider file reference the fetcher
    /// must resolve first (Telegram file ids).
    pub reference: MediaRef,
    pub mime_hint: Option<String>,
    pub file_name: Option<String>,
    pub duration: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRef {
    Url(String),
    TelegramFileId(String),
}

/// Resolves media sources into attachments. Implementations must never
/// error: unresolvable media returns `None`.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn materialise(&self, source: MediaSource, ctx: &ChannelContext) -> Option<Attachment>;
}

/// reqwest-backed fetcher: resolves provider references, downloads small
/// payloads into data URLs, and falls back to the remote URL for large
/// ones.
pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        HttpMediaFetcher { client }
    }

    async fn resolve_url(&self, reference: &MediaRef, ctx: &ChannelContext) -> Option<String> {
        match reference {
            MediaRef::Url(url) => Some(url.clone()),
            MediaRef::TelegramFileId(file_id) => {
                let token = ctx.token.as_deref()?;
                let base = ctx
                    .api_base
                    .as_deref()
                    .unwrap_or("https://api.telegram.org");
                let response = self
                    .client
                    .get(format!("{base}/bot{token}/getFile"))
                    .query(&[("file_id", file_id)])
                    .send()
                    .await
                    .ok()?;
                let body: serde_json::Value = response.json().await.ok()?;
                let file_path = body["result"]["file_path"].as_str()?;
                Some(format!("{base}/file/bot{token}/{file_path}"))
            }
        }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn materialise(&self, source: MediaSource, ctx: &ChannelContext) -> Option<Attachment> {
        let url = match self.resolve_url(&source.reference, ctx).await {
            Some(url) => url,
            None => {
                log::debug!("media fetch: could not resolve {:?}", source.reference);
                return None;
            }
        };

        let mime_type = source
            .mime_hint
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());

        // Small payloads are inlined so downstream consumers need no
        // further provider auth; anything else keeps the remote URL.
        let final_url = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.bytes().await {
                    Ok(bytes) if bytes.len() <= MAX_INLINE_BYTES => {
                        format!("data:{};base64,{}", mime_type, BASE64.encode(&bytes))
                    }
                    Ok(_) => url,
                    Err(e) => {
                        log::debug!("media fetch: body read failed for {url}: {e}");
                        url
                    }
                }
            }
            Ok(response) => {
                log::debug!("media fetch: {url} returned {}", response.status());
                return None;
            }
            Err(e) => {
                log::debug!("media fetch: {url} failed: {e}");
                return None;
            }
        };

        Some(Attachment {
            kind: source.kind,
            url: final_url,
            mime_type,
            file_name: source.file_name,
            duration: source.duration,
        })
    }
}

/// Materialise a bounded set of sources, dropping failures.
pub async fn materialise_all(
    fetcher: &dyn MediaFetcher,
    sources: Vec<MediaSource>,
    ctx: &ChannelContext,
) -> Vec<Attachment> {
    let mut attachments = Vec::new();
    for source in sources.into_iter().take(MAX_ATTACHMENTS) {
        if let Some(attachment) = fetcher.materialise(source, ctx).await {
            attachments.push(attachment);
        }
    }
    attachments
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Fetcher that resolves every source without touching the network.
    pub struct StubFetcher;

    #[async_trait]
    impl MediaFetcher for StubFetcher {
        async fn materialise(
            &self,
            source: MediaSource,
            _ctx: &ChannelContext,
        ) -> Option<Attachment> {
            let url = match source.reference {
                MediaRef::Url(url) => url,
                MediaRef::TelegramFileId(id) => format!("stub://telegram/{id}"),
            };
            Some(Attachment {
                kind: source.kind,
                url,
                mime_type: source
                    .mime_hint
                    .unwrap_or_else(|| "application/octet-stream".into()),
                file_name: source.file_name,
                duration: source.duration,
            })
        }
    }

    /// Fetcher that fails every source, for degradation tests.
    pub struct FailingFetcher;

    #[async_trait]
    impl MediaFetcher for FailingFetcher {
        async fn materialise(
            &self,
            _source: MediaSource,
            _ctx: &ChannelContext,
        ) -> Option<Attachment> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn image(reference: MediaRef) -> MediaSource {
        MediaSource {
            kind: "image".into(),
            reference,
            mime_hint: Some("image/jpeg".into()),
            file_name: None,
            duration: None,
        }
    }

    #[tokio::test]
    async fn materialise_all_caps_the_set() {
        let sources: Vec<MediaSource> = (0..20)
            .map(|i| image(MediaRef::Url(format!("https://x/{i}"))))
            .collect();
        let attachments =
            materialise_all(&StubFetcher, sources, &ChannelContext::default()).await;
        assert_eq!(attachments.len(), MAX_ATTACHMENTS);
    }

    #[tokio::test]
    async fn failures_degrade_to_empty() {
        let sources = vec![image(MediaRef::Url("https://x/1".into()))];
        let attachments =
            materialise_all(&FailingFetcher, sources, &ChannelContext::default()).await;
        assert!(attachments.is_empty());
    }
}
