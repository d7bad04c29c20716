use crate::review::{append_json_line, ReviewError, ReviewQueue};
use crate::util::{format_utc_timestamp, parse_utc_timestamp, stable_id, system_clock, Clock};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("idempotency_key is required")]
    IdempotencyKeyRequired,
    #[error("variant_id is required")]
    VariantRequired,
    #[error("locale is required")]
    LocaleRequired,
    #[error("localized_script is required")]
    ScriptRequired,
    #[error("human approval is required before publish")]
    HumanApprovalRequired,
    #[error("timestamp must be UTC ISO-8601 with trailing Z (got {0:?})")]
    TimestampInvalid(String),
    #[error("targets must be a non-empty list")]
    TargetsInvalid,
    #[error("unsupported platform: {0}")]
    PlatformUnsupported(String),
    #[error("missing platform controls for {0}")]
    PlatformControlMissing(Platform),
    #[error("{0}")]
    WindowConfigInvalid(&'static str),
    #[error("{0} publish window is closed for scheduled timestamp")]
    WindowClosed(Platform),
    #[error("max_publishes_per_hour must be greater than zero")]
    RateLimitConfigInvalid,
    #[error("rate limit exceeded for {platform} in {hour_bucket}")]
    RateLimited { platform: Platform, hour_bucket: String },
    #[error("adapter not configured for {0}")]
    AdapterNotConfigured(Platform),
    #[error("retryable upstream failure from {0}")]
    PlatformRetryable(Platform),
    #[error("terminal upstream failure from {0}")]
    PlatformTerminal(Platform),
    #[error("platform response must include platform_post_id")]
    ResponseInvalid,
    #[error("failed to write receipt log: {0}")]
    ReceiptLog(String),
    #[error(transparent)]
    Review(#[from] ReviewError),
}

impl PublishError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::IdempotencyKeyRequired => "PUBLISH_IDEMPOTENCY_KEY_REQUIRED",
            Self::VariantRequired => "PUBLISH_VARIANT_REQUIRED",
            Self::LocaleRequired => "PUBLISH_LOCALE_REQUIRED",
            Self::ScriptRequired => "PUBLISH_SCRIPT_REQUIRED",
            Self::HumanApprovalRequired => "HUMAN_APPROVAL_REQUIRED",
            Self::TimestampInvalid(_) => "PUBLISH_TIMESTAMP_INVALID",
            Self::TargetsInvalid => "PUBLISH_TARGETS_INVALID",
            Self::PlatformUnsupported(_) => "PUBLISH_PLATFORM_UNSUPPORTED",
            Self::PlatformControlMissing(_) => "PUBLISH_PLATFORM_CONTROL_MISSING",
            Self::WindowConfigInvalid(_) => "PUBLISH_WINDOW_CONFIG_INVALID",
            Self::WindowClosed(_) => "PUBLISH_WINDOW_CLOSED",
            Self::RateLimitConfigInvalid => "PUBLISH_RATE_LIMIT_CONFIG_INVALID",
            Self::RateLimited { .. } => "PUBLISH_RATE_LIMIT_BACKOFF_REQUIRED",
            Self::AdapterNotConfigured(_) => "PUBLISH_ADAPTER_NOT_CONFIGURED",
            Self::PlatformRetryable(_) => "PUBLISH_PLATFORM_RETRYABLE_FAILURE",
            Self::PlatformTerminal(_) => "PUBLISH_PLATFORM_TERMINAL_FAILURE",
            Self::ResponseInvalid => "PUBLISH_PLATFORM_RESPONSE_INVALID",
            Self::ReceiptLog(_) => "PUBLISH_RECEIPT_LOG_FAILED",
            Self::Review(error) => error.code(),
        }
    }

    /// Adapter failures that a later publish with a new key may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PlatformRetryable(_) | Self::RateLimited { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Tiktok,
}

impl Platform {
    pub const SUPPORTED: [Platform; 2] = [Platform::Youtube, Platform::Tiktok];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Tiktok => "tiktok",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = PublishError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "youtube" => Ok(Self::Youtube),
            "tiktok" => Ok(Self::Tiktok),
            _ => Err(PublishError::PlatformUnsupported(normalized)),
        }
    }
}

/// Publish window `[start, end)` in UTC hours plus an hourly cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformControls {
    pub window_start_hour_utc: u32,
    pub window_end_hour_utc: u32,
    pub max_publishes_per_hour: u32,
}

impl PlatformControls {
    pub fn defaults_for(platform: Platform) -> Self {
        match platform {
            Platform::Youtube => Self {
                window_start_hour_utc: 8,
                window_end_hour_utc: 23,
                max_publishes_per_hour: 3,
            },
            Platform::Tiktok => Self {
                window_start_hour_utc: 6,
                window_end_hour_utc: 22,
                max_publishes_per_hour: 2,
            },
        }
    }

    fn ensure_open(&self, platform: Platform, scheduled_for: DateTime<Utc>) -> Result<(), PublishError> {
        if self.window_start_hour_utc > 23 || !(1..=24).contains(&self.window_end_hour_utc) {
            return Err(PublishError::WindowConfigInvalid(
                "window hours must be in UTC hour range",
            ));
        }
        if self.window_start_hour_utc >= self.window_end_hour_utc {
            return Err(PublishError::WindowConfigInvalid(
                "window_start_hour_utc must be less than window_end_hour_utc",
            ));
        }
        let hour = scheduled_for.hour();
        if hour < self.window_start_hour_utc || hour >= self.window_end_hour_utc {
            return Err(PublishError::WindowClosed(platform));
        }
        Ok(())
    }
}

/// Approved content handed to [`PublisherService::publish`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishPayload {
    pub variant_id: String,
    pub locale: String,
    pub localized_script: String,
    pub review_status: String,
    pub scheduled_for: Option<String>,
    /// `None` publishes to every supported platform.
    pub targets: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishRequest {
    pub variant_id: String,
    pub locale: String,
    pub localized_script: String,
    pub idempotency_key: String,
    pub scheduled_for: String,
    pub targets: Vec<Platform>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformPublishRequest {
    pub platform: Platform,
    pub variant_id: String,
    pub locale: String,
    pub localized_script: String,
    pub scheduled_for: String,
    pub idempotency_key: String,
    pub platform_submission_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformPost {
    pub platform_post_id: String,
}

/// Per-platform upload adapter.
pub trait PlatformPublisher {
    fn platform(&self) -> Platform;
    fn publish(&mut self, request: &PlatformPublishRequest) -> Result<PlatformPost, PublishError>;
}

/// Offline adapter that succeeds with a derived post id unless the
/// idempotency key is listed as a retryable or terminal failure.
#[derive(Debug, Clone)]
pub struct DeterministicPublisher {
    platform: Platform,
    retryable_failure_keys: HashSet<String>,
    terminal_failure_keys: HashSet<String>,
    calls: Arc<AtomicUsize>,
}

impl DeterministicPublisher {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            retryable_failure_keys: HashSet::new(),
            terminal_failure_keys: HashSet::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_retryable_for(mut self, idempotency_key: impl Into<String>) -> Self {
        self.retryable_failure_keys.insert(idempotency_key.into());
        self
    }

    pub fn fail_terminal_for(mut self, idempotency_key: impl Into<String>) -> Self {
        self.terminal_failure_keys.insert(idempotency_key.into());
        self
    }

    /// Shared counter that stays readable after the adapter is boxed.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PlatformPublisher for DeterministicPublisher {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn publish(&mut self, request: &PlatformPublishRequest) -> Result<PlatformPost, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.retryable_failure_keys.contains(&request.idempotency_key) {
            return Err(PublishError::PlatformRetryable(self.platform));
        }
        if self.terminal_failure_keys.contains(&request.idempotency_key) {
            return Err(PublishError::PlatformTerminal(self.platform));
        }
        Ok(PlatformPost {
            platform_post_id: stable_id(
                &format!("{}-post", self.platform),
                &[
                    &request.variant_id,
                    &request.idempotency_key,
                    &request.platform_submission_id,
                ],
            ),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    FailedRetryable,
    FailedTerminal,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub receipt_id: String,
    pub variant_id: String,
    pub platform: Platform,
    pub publish_status: ReceiptStatus,
    pub platform_post_id: String,
    pub idempotency_key: String,
    pub published_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Published,
    PublishPartialRetryable,
    PublishFailedTerminal,
}

impl PublishStatus {
    pub fn result_code(&self) -> &'static str {
        match self {
            Self::Published => "PASS",
            Self::PublishPartialRetryable => "PUBLISH_PARTIAL_RETRYABLE",
            Self::PublishFailedTerminal => "PUBLISH_FAILED_TERMINAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub status: PublishStatus,
    pub result_code: String,
    pub variant_id: String,
    pub idempotency_key: String,
    pub scheduled_for: String,
    pub platform_receipts: Vec<PublishReceipt>,
}

/// Validates an approved payload into a normalized request. `now` fills in
/// a missing schedule.
pub fn build_publish_request(
    payload: &PublishPayload,
    idempotency_key: &str,
    scheduled_for: Option<&str>,
    now: DateTime<Utc>,
) -> Result<PublishRequest, PublishError> {
    let idempotency_key = idempotency_key.trim();
    if idempotency_key.is_empty() {
        return Err(PublishError::IdempotencyKeyRequired);
    }
    let variant_id = required(&payload.variant_id, PublishError::VariantRequired)?;
    let locale = required(&payload.locale, PublishError::LocaleRequired)?;
    let localized_script = required(&payload.localized_script, PublishError::ScriptRequired)?;
    if !payload.review_status.trim().eq_ignore_ascii_case("approved") {
        return Err(PublishError::HumanApprovalRequired);
    }

    let scheduled_for = scheduled_for
        .or(payload.scheduled_for.as_deref())
        .map(str::to_string)
        .unwrap_or_else(|| format_utc_timestamp(now));
    parse_schedule(&scheduled_for)?;

    Ok(PublishRequest {
        variant_id,
        locale,
        localized_script,
        idempotency_key: idempotency_key.to_string(),
        scheduled_for,
        targets: normalize_targets(payload.targets.as_deref())?,
    })
}

fn required(value: &str, missing: PublishError) -> Result<String, PublishError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(missing)
    } else {
        Ok(trimmed.to_string())
    }
}

fn parse_schedule(raw: &str) -> Result<DateTime<Utc>, PublishError> {
    parse_utc_timestamp(raw).ok_or_else(|| PublishError::TimestampInvalid(raw.to_string()))
}

fn normalize_targets(raw: Option<&[String]>) -> Result<Vec<Platform>, PublishError> {
    let Some(raw) = raw else {
        return Ok(Platform::SUPPORTED.to_vec());
    };
    if raw.is_empty() {
        return Err(PublishError::TargetsInvalid);
    }
    let mut targets = Vec::new();
    for value in raw {
        let platform: Platform = value.parse()?;
        if !targets.contains(&platform) {
            targets.push(platform);
        }
    }
    Ok(targets)
}

/// Fans an approved variant out to its target platforms.
///
/// A repeated idempotency key returns the stored response without touching
/// adapters, rate limits, or receipts. Window and rate-limit violations
/// abort the whole call; adapter failures become receipts.
pub struct PublisherService {
    review_queue: Option<ReviewQueue>,
    adapters: HashMap<Platform, Box<dyn PlatformPublisher>>,
    controls: HashMap<Platform, PlatformControls>,
    clock: Clock,
    receipt_log_path: Option<PathBuf>,
    receipts: Vec<PublishReceipt>,
    responses_by_key: HashMap<String, PublishResponse>,
    publishes_by_hour: HashMap<(Platform, String), u32>,
}

impl Default for PublisherService {
    fn default() -> Self {
        Self::new()
    }
}

impl PublisherService {
    /// Deterministic adapters and default controls for every platform.
    pub fn new() -> Self {
        let mut service = Self {
            review_queue: None,
            adapters: HashMap::new(),
            controls: HashMap::new(),
            clock: system_clock(),
            receipt_log_path: None,
            receipts: Vec::new(),
            responses_by_key: HashMap::new(),
            publishes_by_hour: HashMap::new(),
        };
        for platform in Platform::SUPPORTED {
            service.adapters.insert(platform, Box::new(DeterministicPublisher::new(platform)));
            service.controls.insert(platform, PlatformControls::defaults_for(platform));
        }
        service
    }

    pub fn with_review_queue(mut self, queue: ReviewQueue) -> Self {
        self.review_queue = Some(queue);
        self
    }

    pub fn with_adapter(mut self, adapter: impl PlatformPublisher + 'static) -> Self {
        self.adapters.insert(adapter.platform(), Box::new(adapter));
        self
    }

    pub fn with_controls(mut self, platform: Platform, controls: PlatformControls) -> Self {
        self.controls.insert(platform, controls);
        self
    }

    pub fn without_controls(mut self, platform: Platform) -> Self {
        self.controls.remove(&platform);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_receipt_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.receipt_log_path = Some(path.into());
        self
    }

    pub fn review_queue_mut(&mut self) -> Option<&mut ReviewQueue> {
        self.review_queue.as_mut()
    }

    pub fn receipts(&self) -> &[PublishReceipt] {
        &self.receipts
    }

    pub fn publish(
        &mut self,
        payload: &PublishPayload,
        idempotency_key: &str,
        scheduled_for: Option<&str>,
    ) -> Result<PublishResponse, PublishError> {
        let idempotency_key = idempotency_key.trim();
        if let Some(stored) = self.responses_by_key.get(idempotency_key) {
            info!(idempotency_key, "publish replayed from idempotency cache");
            return Ok(stored.clone());
        }

        let now = (self.clock)();
        let request = build_publish_request(payload, idempotency_key, scheduled_for, now)?;
        if let Some(queue) = self.review_queue.as_mut() {
            queue.check_publish_eligibility(&request.variant_id, Some(&request.scheduled_for))?;
        }

        let scheduled = parse_schedule(&request.scheduled_for)?;
        let published_at = format_utc_timestamp(now);
        let hour_bucket = scheduled.format("%Y%m%d-%H").to_string();
        // Every target must clear its window and hourly limit before any adapter runs.
        for platform in &request.targets {
            let controls = self
                .controls
                .get(platform)
                .copied()
                .ok_or(PublishError::PlatformControlMissing(*platform))?;
            controls.ensure_open(*platform, scheduled)?;
            self.ensure_hourly_capacity(*platform, &controls, &hour_bucket)?;
            if !self.adapters.contains_key(platform) {
                return Err(PublishError::AdapterNotConfigured(*platform));
            }
        }

        let mut receipts = Vec::with_capacity(request.targets.len());
        for platform in &request.targets {
            *self
                .publishes_by_hour
                .entry((*platform, hour_bucket.clone()))
                .or_insert(0) += 1;
            receipts.push(self.publish_to_platform(&request, *platform, &published_at)?);
        }

        let status = if receipts
            .iter()
            .any(|receipt| receipt.publish_status == ReceiptStatus::FailedTerminal)
        {
            PublishStatus::PublishFailedTerminal
        } else if receipts
            .iter()
            .any(|receipt| receipt.publish_status == ReceiptStatus::FailedRetryable)
        {
            PublishStatus::PublishPartialRetryable
        } else {
            PublishStatus::Published
        };

        let response = PublishResponse {
            status,
            result_code: status.result_code().to_string(),
            variant_id: request.variant_id,
            idempotency_key: request.idempotency_key,
            scheduled_for: request.scheduled_for,
            platform_receipts: receipts,
        };
        info!(
            variant_id = %response.variant_id,
            idempotency_key = %response.idempotency_key,
            result_code = %response.result_code,
            "publish finished"
        );
        self.responses_by_key
            .insert(response.idempotency_key.clone(), response.clone());
        Ok(response)
    }

    fn ensure_hourly_capacity(
        &self,
        platform: Platform,
        controls: &PlatformControls,
        hour_bucket: &str,
    ) -> Result<(), PublishError> {
        if controls.max_publishes_per_hour == 0 {
            return Err(PublishError::RateLimitConfigInvalid);
        }
        let used = self
            .publishes_by_hour
            .get(&(platform, hour_bucket.to_string()))
            .copied()
            .unwrap_or(0);
        if used >= controls.max_publishes_per_hour {
            warn!(platform = %platform, hour_bucket, "publish rate limit reached");
            return Err(PublishError::RateLimited {
                platform,
                hour_bucket: hour_bucket.to_string(),
            });
        }
        Ok(())
    }

    fn publish_to_platform(
        &mut self,
        request: &PublishRequest,
        platform: Platform,
        published_at: &str,
    ) -> Result<PublishReceipt, PublishError> {
        let adapter = self
            .adapters
            .get_mut(&platform)
            .ok_or(PublishError::AdapterNotConfigured(platform))?;
        let platform_request = PlatformPublishRequest {
            platform,
            variant_id: request.variant_id.clone(),
            locale: request.locale.clone(),
            localized_script: request.localized_script.clone(),
            scheduled_for: request.scheduled_for.clone(),
            idempotency_key: request.idempotency_key.clone(),
            platform_submission_id: stable_id(
                "submission",
                &[&request.variant_id, platform.as_str(), &request.idempotency_key],
            ),
        };

        let outcome = adapter.publish(&platform_request).and_then(|post| {
            let post_id = post.platform_post_id.trim().to_string();
            if post_id.is_empty() {
                Err(PublishError::ResponseInvalid)
            } else {
                Ok(post_id)
            }
        });
        let (publish_status, platform_post_id) = match outcome {
            Ok(post_id) => (ReceiptStatus::Success, post_id),
            Err(error) => {
                let status = if error.is_retryable() {
                    ReceiptStatus::FailedRetryable
                } else {
                    ReceiptStatus::FailedTerminal
                };
                warn!(
                    platform = %platform,
                    variant_id = %request.variant_id,
                    code = error.code(),
                    "platform publish failed"
                );
                let placeholder = stable_id(
                    &format!("{platform}-receipt"),
                    &[&request.variant_id, &request.idempotency_key, status.as_str()],
                );
                (status, placeholder)
            }
        };

        let receipt = PublishReceipt {
            receipt_id: stable_id(
                "receipt",
                &[&request.variant_id, platform.as_str(), &request.idempotency_key],
            ),
            variant_id: request.variant_id.clone(),
            platform,
            publish_status,
            platform_post_id,
            idempotency_key: request.idempotency_key.clone(),
            published_at: published_at.to_string(),
        };
        if let Some(path) = &self.receipt_log_path {
            append_json_line(path, &receipt).map_err(PublishError::ReceiptLog)?;
        }
        self.receipts.push(receipt.clone());
        Ok(receipt)
    }
}
