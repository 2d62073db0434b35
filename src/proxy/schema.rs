//! Schema source proxy: module text from the owner, cached locally.

use super::ProxySet;
use crate::channel::wire::Request;
use crate::device::SourceId;
use crate::error::{ClusterError, MountError};
use crate::session::schema::SchemaSourceCache;
use log::warn;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct ProxySchemaSourceProvider {
    proxies: ProxySet,
    cache: Arc<SchemaSourceCache>,
}

impl ProxySchemaSourceProvider {
    pub(crate) fn new(proxies: ProxySet, cache: Arc<SchemaSourceCache>) -> Self {
        Self { proxies, cache }
    }

    pub async fn get(&self, id: &SourceId) -> Result<String, MountError> {
        if let Some(text) = self.cache.get(id) {
            return Ok(text);
        }
        let payload = self
            .proxies
            .ask_value(Request::GetSchemaSource { source: id.clone() })
            .await?;
        let text = match payload {
            Some(Value::String(text)) => text,
            other => {
                return Err(ClusterError::Codec(format!(
                    "schema source {id} arrived as {other:?}"
                ))
                .into())
            }
        };
        if let Err(err) = self.cache.insert(id, &text) {
            warn!("event=schema_cache_write_failed source={} error={}", id, err);
        }
        Ok(text)
    }
}
