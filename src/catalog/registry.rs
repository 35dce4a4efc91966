//! Logical model -> upstream deployment bindings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};

use crate::config::{ApiKey, Config, ConfigError, ProviderConfig};
use crate::error::Error;

/// A configured upstream provider, shared by every binding that targets it.
#[derive(Debug)]
pub struct ProviderEndpoint {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<ApiKey>,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub num_retries: u32,
}

impl ProviderEndpoint {
    fn from_config(
        provider: &ProviderConfig,
        default_timeout: Duration,
        default_retries: u32,
    ) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &provider.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ConfigError::Validation(format!(
                    "Provider '{}' has invalid header name '{}': {}",
                    provider.name, name, e
                ))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                ConfigError::Validation(format!(
                    "Provider '{}' has invalid value for header '{}': {}",
                    provider.name, name, e
                ))
            })?;
            headers.insert(name, value);
        }

        Ok(Self {
            name: provider.name.clone(),
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            api_key: provider.api_key.clone(),
            headers,
            timeout: provider
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
            num_retries: provider.num_retries.unwrap_or(default_retries),
        })
    }

    /// Full URL of the chat completions endpoint.
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// One concrete target for a logical model.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub provider: Arc<ProviderEndpoint>,
    pub upstream_model: String,
}

/// Ordered deployments for one logical model; the first is the primary.
#[derive(Debug)]
pub struct ProviderBinding {
    pub model: String,
    pub deployments: Vec<Deployment>,
    pub context_length: Option<u32>,
    /// Default generation parameters merged under the client's
    pub params: Map<String, Value>,
}

impl ProviderBinding {
    pub fn primary(&self) -> &Deployment {
        &self.deployments[0]
    }
}

/// Immutable view of every logical model and provider.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    bindings: HashMap<String, Arc<ProviderBinding>>,
    /// Model names in configuration order, for listings.
    order: Vec<String>,
    providers: Vec<Arc<ProviderEndpoint>>,
}

impl ProviderRegistry {
    /// Build the registry from an already validated configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let default_timeout = Duration::from_secs(config.gateway.timeout_secs);
        let default_retries = config.gateway.num_retries;

        let providers = config
            .providers
            .iter()
            .map(|p| {
                ProviderEndpoint::from_config(p, default_timeout, default_retries).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let by_name: HashMap<&str, &Arc<ProviderEndpoint>> =
            providers.iter().map(|p| (p.name.as_str(), p)).collect();

        let lookup = |model: &str, provider: &str| {
            by_name
                .get(provider)
                .map(|p| Arc::clone(*p))
                .ok_or_else(|| ConfigError::UnknownProvider {
                    model: model.to_string(),
                    provider: provider.to_string(),
                })
        };

        let mut bindings = HashMap::with_capacity(config.models.len());
        let mut order = Vec::with_capacity(config.models.len());
        for model in &config.models {
            let mut deployments = vec![Deployment {
                provider: lookup(&model.name, &model.provider)?,
                upstream_model: model.upstream_model().to_string(),
            }];
            for fallback in &model.fallbacks {
                deployments.push(Deployment {
                    provider: lookup(&model.name, &fallback.provider)?,
                    upstream_model: fallback
                        .upstream_model
                        .clone()
                        .unwrap_or_else(|| model.upstream_model().to_string()),
                });
            }

            let binding = ProviderBinding {
                model: model.name.clone(),
                deployments,
                context_length: model.context_length,
                params: model.params.clone(),
            };
            if bindings
                .insert(model.name.clone(), Arc::new(binding))
                .is_some()
            {
                return Err(ConfigError::DuplicateModel(model.name.clone()));
            }
            order.push(model.name.clone());
        }

        Ok(Self {
            bindings,
            order,
            providers,
        })
    }

    /// Look up a logical model.
    pub fn resolve(&self, model: &str) -> Result<Arc<ProviderBinding>, Error> {
        self.bindings
            .get(model)
            .cloned()
            .ok_or_else(|| Error::UnknownModel {
                model: model.to_string(),
                available: self.available_models(),
            })
    }

    /// Sorted logical model names.
    pub fn available_models(&self) -> Vec<String> {
        let mut names = self.order.clone();
        names.sort();
        names
    }

    /// Bindings in configuration order.
    pub fn bindings(&self) -> impl Iterator<Item = &ProviderBinding> {
        self.order
            .iter()
            .filter_map(|name| self.bindings.get(name).map(Arc::as_ref))
    }

    pub fn providers(&self) -> &[Arc<ProviderEndpoint>] {
        &self.providers
    }

    pub fn models_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn providers_count(&self) -> usize {
        self.providers.len()
    }
}
