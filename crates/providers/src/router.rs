//! Capability-driven LLM router.
//!
//! The router selects providers and models based on role requirements
//! (JSON mode, streaming) and handles automatic fallback when the primary
//! model fails with a timeout or 5xx error.

use crate::registry::ProviderRegistry;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use ra_domain::capability::LlmCapabilities;
use ra_domain::config::{LlmConfig, RoleConfig};
use ra_domain::error::{Error, Result};
use ra_domain::stream::{BoxStream, StreamEvent};
use ra_domain::trace::TraceEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A capability-driven router that selects providers per role (e.g.
/// "planner", "executor", "summarizer") and handles fallback on transient
/// failures.
pub struct LlmRouter {
    registry: ProviderRegistry,
    role_configs: HashMap<String, RoleConfig>,
    default_timeout_ms: u64,
}

impl LlmRouter {
    /// Construct the router from the full LLM config.
    pub fn from_config(llm_config: &LlmConfig) -> Result<Self> {
        let registry = ProviderRegistry::from_config(llm_config)?;
        let role_configs: HashMap<String, RoleConfig> = llm_config.roles.clone();

        Ok(Self {
            registry,
            role_configs,
            default_timeout_ms: llm_config.default_timeout_ms,
        })
    }

    /// Build from an already-constructed registry (useful for testing).
    pub fn new(
        registry: ProviderRegistry,
        role_configs: HashMap<String, RoleConfig>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            registry,
            role_configs,
            default_timeout_ms,
        }
    }

    /// Get a reference to the underlying registry.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    // ── Public routing API ─────────────────────────────────────────

    /// Send a chat request for a given model role. The router:
    ///
    /// 1. Resolves the primary model from the role config.
    /// 2. Validates that the provider satisfies the required capabilities.
    /// 3. Sends the request.
    /// 4. On timeout or provider error, falls back to the next configured
    ///    fallback model.
    /// 5. Emits [`TraceEvent::ProviderCall`] for every attempt that reaches
    ///    a provider.
    pub async fn chat_for_role(&self, role: &str, mut req: ChatRequest) -> Result<ChatResponse> {
        let role_cfg = self
            .role_configs
            .get(role)
            .ok_or_else(|| Error::Config(format!("no role config for '{}'", role)))?;

        // Attempt primary model.
        let (provider_id, model_name) = resolve_model(&role_cfg.model);
        if let Some(provider) = self.registry.get(provider_id) {
            if Self::check_capabilities(provider.capabilities(), role_cfg) {
                req.model = Some(model_name.to_string());

                let result = self.try_chat(&provider, &req, provider_id, model_name).await;
                match &result {
                    Ok(_) => return result,
                    Err(e) if Self::is_retriable(e) => {
                        tracing::warn!(
                            provider = %provider_id,
                            model = %model_name,
                            error = %e,
                            "primary model failed, trying fallbacks"
                        );
                    }
                    Err(_) => return result,
                }
            } else {
                tracing::warn!(
                    provider = %provider_id,
                    model = %model_name,
                    "primary model does not satisfy required capabilities, trying fallbacks"
                );
            }
        } else {
            tracing::warn!(
                provider = %provider_id,
                "primary provider not found in registry, trying fallbacks"
            );
        }

        // Attempt fallbacks.
        for fallback in &role_cfg.fallbacks {
            let (fb_provider_id, fb_model_name) = resolve_model(&fallback.model);
            let fb_provider = match self.registry.get(fb_provider_id) {
                Some(p) => p,
                None => {
                    tracing::warn!(
                        provider = %fb_provider_id,
                        "fallback provider not found, skipping"
                    );
                    continue;
                }
            };

            if fallback.require_json && !fb_provider.capabilities().supports_json_mode {
                tracing::warn!(
                    provider = %fb_provider_id,
                    "fallback does not support JSON mode, skipping"
                );
                continue;
            }

            tracing::info!(
                from_provider = %provider_id,
                from_model = %model_name,
                to_provider = %fb_provider_id,
                to_model = %fb_model_name,
                "falling back to next configured model"
            );

            req.model = Some(fb_model_name.to_string());
            let result = self
                .try_chat(&fb_provider, &req, fb_provider_id, fb_model_name)
                .await;
            match &result {
                Ok(_) => return result,
                Err(e) if Self::is_retriable(e) => {
                    tracing::warn!(
                        provider = %fb_provider_id,
                        model = %fb_model_name,
                        error = %e,
                        "fallback model failed, trying next"
                    );
                    continue;
                }
                Err(_) => return result,
            }
        }

        Err(Error::Provider {
            provider: "router".into(),
            message: format!("all models for role '{}' failed or were unavailable", role),
        })
    }

    /// Streaming counterpart of [`LlmRouter::chat_for_role`].
    ///
    /// Fallback only covers provider/model *selection* — once a provider
    /// accepts the request and starts yielding stream events, a
    /// mid-stream error is surfaced to the caller rather than silently
    /// restarted on a fallback model (the responder node already has
    /// partial content committed to the Stream Pipeline by then).
    pub async fn chat_stream_for_role(
        &self,
        role: &str,
        mut req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let role_cfg = self
            .role_configs
            .get(role)
            .ok_or_else(|| Error::Config(format!("no role config for '{}'", role)))?;

        let mut candidates: Vec<(&str, &str, bool)> = Vec::new();
        let (provider_id, model_name) = resolve_model(&role_cfg.model);
        candidates.push((provider_id, model_name, role_cfg.require_json));
        for fallback in &role_cfg.fallbacks {
            let (fb_provider_id, fb_model_name) = resolve_model(&fallback.model);
            candidates.push((fb_provider_id, fb_model_name, fallback.require_json));
        }

        let mut last_error = Error::Provider {
            provider: "router".into(),
            message: format!("no models configured for role '{}'", role),
        };

        for (provider_id, model_name, require_json) in candidates {
            let provider = match self.registry.get(provider_id) {
                Some(p) => p,
                None => continue,
            };
            if !provider.capabilities().supports_streaming {
                continue;
            }
            if require_json && !provider.capabilities().supports_json_mode {
                continue;
            }

            req.model = Some(model_name.to_string());
            match provider.chat_stream(&req).await {
                Ok(stream) => {
                    TraceEvent::ProviderCall {
                        provider: provider_id.to_string(),
                        model: model_name.to_string(),
                        streaming: true,
                        duration_ms: 0,
                        prompt_tokens: None,
                        completion_tokens: None,
                    }
                    .emit();
                    return Ok(stream);
                }
                Err(error) => {
                    tracing::warn!(provider = %provider_id, model = %model_name, %error, "streaming model failed to start, trying next");
                    last_error = error;
                }
            }
        }

        Err(last_error)
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// Send a chat request with a timeout wrapper, emitting a trace event
    /// on completion (success or failure alike).
    async fn try_chat(
        &self,
        provider: &Arc<dyn LlmProvider>,
        req: &ChatRequest,
        provider_id: &str,
        model_name: &str,
    ) -> Result<ChatResponse> {
        let timeout = std::time::Duration::from_millis(self.default_timeout_ms);
        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, provider.chat(req)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "provider '{}' timed out after {}ms",
                provider.provider_id(),
                self.default_timeout_ms
            ))),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        TraceEvent::ProviderCall {
            provider: provider_id.to_string(),
            model: model_name.to_string(),
            streaming: false,
            duration_ms,
            prompt_tokens: result
                .as_ref()
                .ok()
                .and_then(|r| r.usage.as_ref())
                .map(|u| u.prompt_tokens),
            completion_tokens: result
                .as_ref()
                .ok()
                .and_then(|r| r.usage.as_ref())
                .map(|u| u.completion_tokens),
        }
        .emit();

        result
    }

    /// Check whether a provider's capabilities satisfy a role config's requirements.
    fn check_capabilities(cap: &LlmCapabilities, role_cfg: &RoleConfig) -> bool {
        if role_cfg.require_json && !cap.supports_json_mode {
            return false;
        }
        if role_cfg.require_streaming && !cap.supports_streaming {
            return false;
        }
        true
    }

    /// Determine if an error is retriable (timeout or 5xx-like provider errors).
    fn is_retriable(err: &Error) -> bool {
        match err {
            Error::Timeout(_) => true,
            Error::Http(_) => true,
            Error::Provider { message, .. } => {
                // Treat 5xx as retriable.
                message.contains("HTTP 5")
                    || message.contains("HTTP 502")
                    || message.contains("HTTP 503")
                    || message.contains("HTTP 504")
                    || message.contains("HTTP 500")
                    || message.contains("HTTP 529")
            }
            _ => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Split a `"provider_id/model_name"` string into its two components.
///
/// If there is no `/`, the entire string is treated as the provider id
/// and an empty model name is returned (the provider's default will be used).
pub fn resolve_model(model_str: &str) -> (&str, &str) {
    match model_str.split_once('/') {
        Some((provider, model)) => (provider, model),
        None => (model_str, ""),
    }
}
