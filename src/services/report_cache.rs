use std::future::Future;

use serde::{de::DeserializeOwned, Serialize};

use crate::core::redis::RedisHandle;
use crate::services::errors::GradingError;

/// All reports of a template live in one hash so a single DEL drops them.
pub(crate) fn cache_key(template_id: &str) -> String {
    format!("reports:{template_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReportKind {
    Summary,
    Questions,
    Distribution(usize),
}

impl ReportKind {
    pub(crate) fn field(self) -> String {
        match self {
            ReportKind::Summary => "summary".to_string(),
            ReportKind::Questions => "questions".to_string(),
            ReportKind::Distribution(buckets) => format!("distribution:{buckets}"),
        }
    }
}

/// Serves a cached report unless `refresh` is set; Redis failures fall back
/// to computing the report directly.
pub(crate) async fn cached_or_compute<T, F, Fut>(
    redis: &RedisHandle,
    ttl_seconds: u64,
    template_id: &str,
    kind: ReportKind,
    refresh: bool,
    compute: F,
) -> Result<T, GradingError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, GradingError>>,
{
    let key = cache_key(template_id);
    let field = kind.field();

    if !refresh {
        match redis.get_field_json::<T>(&key, &field).await {
            Ok(Some(report)) => {
                tracing::debug!(template_id, field = %field, "Report served from cache");
                return Ok(report);
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(template_id, error = %err, "Report cache read failed"),
        }
    }

    let report = compute().await?;
    if let Err(err) = redis.set_field_json(&key, &field, &report, ttl_seconds).await {
        tracing::warn!(template_id, error = %err, "Report cache write failed");
    }
    Ok(report)
}

pub(crate) async fn invalidate(redis: &RedisHandle, template_id: &str) {
    if let Err(err) = redis.delete(&[cache_key(template_id)]).await {
        tracing::warn!(template_id, error = %err, "Report cache invalidation failed");
    }
}
