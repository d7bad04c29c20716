use crate::util::{
    format_utc_timestamp, parse_utc_timestamp, round_usd, stable_id, system_clock, Clock,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_REVIEW_SLA_SECONDS: i64 = 24 * 60 * 60;
pub const APPROVED_MANUAL_REVIEW_CODE: &str = "APPROVED_MANUAL_REVIEW";
pub const REJECTED_POLICY_CODE: &str = "REJECTED_POLICY";
pub const REJECTED_ORIGINALITY_CODE: &str = "REJECTED_ORIGINALITY";
pub const EXPIRED_SLA_CODE: &str = "EXPIRED_SLA";
pub const SLA_GUARD_REVIEWER: &str = "system-sla-guard";

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("sla_seconds must be greater than zero")]
    SlaInvalid,
    #[error("variant_id is required")]
    VariantRequired,
    #[error("variant is already queued")]
    VariantAlreadyQueued,
    #[error("timestamp must be UTC ISO-8601 with trailing Z (got {0:?})")]
    TimestampInvalid(String),
    #[error("review item was not found")]
    ItemNotFound,
    #[error("review item expired and cannot be decided")]
    ItemExpired,
    #[error("review decision is immutable once recorded")]
    DecisionImmutable,
    #[error("reviewer_id is required")]
    ReviewerRequired,
    #[error("decision must be approved or rejected")]
    DecisionInvalid,
    #[error("rejected decisions must use REJECTED_POLICY or REJECTED_ORIGINALITY")]
    DecisionCodeInvalid,
    #[error("human approval is required before publish")]
    HumanApprovalRequired,
    #[error("failed to write decision log: {0}")]
    DecisionLog(String),
}

impl ReviewError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SlaInvalid => "REVIEW_SLA_INVALID",
            Self::VariantRequired => "REVIEW_VARIANT_REQUIRED",
            Self::VariantAlreadyQueued => "REVIEW_VARIANT_ALREADY_QUEUED",
            Self::TimestampInvalid(_) => "REVIEW_TIMESTAMP_INVALID",
            Self::ItemNotFound => "REVIEW_ITEM_NOT_FOUND",
            Self::ItemExpired => "REVIEW_ITEM_EXPIRED",
            Self::DecisionImmutable => "REVIEW_DECISION_IMMUTABLE",
            Self::ReviewerRequired => "REVIEW_REVIEWER_REQUIRED",
            Self::DecisionInvalid => "REVIEW_DECISION_INVALID",
            Self::DecisionCodeInvalid => "REVIEW_DECISION_CODE_INVALID",
            Self::HumanApprovalRequired => "HUMAN_APPROVAL_REQUIRED",
            Self::DecisionLog(_) => "REVIEW_DECISION_LOG_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Rejected,
    Expired,
}

impl ReviewDecision {
    fn status(self) -> ReviewStatus {
        match self {
            Self::Approved => ReviewStatus::Approved,
            Self::Rejected => ReviewStatus::Rejected,
            Self::Expired => ReviewStatus::Expired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub result_code: String,
    pub policy_code: String,
}

impl Default for PolicySummary {
    fn default() -> Self {
        Self {
            result_code: "PASS".to_string(),
            policy_code: "PASS".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalitySummary {
    pub similarity_score: f64,
    pub threshold: f64,
    pub result_code: String,
}

impl Default for OriginalitySummary {
    fn default() -> Self {
        Self {
            similarity_score: 0.0,
            threshold: 1.0,
            result_code: "PASS".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub estimated_usd: f64,
    pub currency: String,
}

impl Default for CostSummary {
    fn default() -> Self {
        Self {
            estimated_usd: 0.0,
            currency: "USD".to_string(),
        }
    }
}

/// Input for [`ReviewQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct NewReviewItem {
    pub variant_id: String,
    pub locale: String,
    pub policy: PolicySummary,
    pub originality: OriginalitySummary,
    pub cost: CostSummary,
    pub queued_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub review_item_id: String,
    pub variant_id: String,
    pub locale: String,
    pub policy: PolicySummary,
    pub originality: OriginalitySummary,
    pub cost: CostSummary,
    pub status: ReviewStatus,
    pub publish_eligible: bool,
    pub queued_at: String,
    pub expires_at: String,
    pub updated_at: String,
    pub decision_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub decision_id: String,
    pub variant_id: String,
    pub decision: ReviewDecision,
    pub decision_code: String,
    pub reviewer_id: String,
    pub reviewed_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionOutcome {
    pub item: ReviewItem,
    pub decision: DecisionEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishEligibility {
    pub variant_id: String,
    pub review_status: ReviewStatus,
}

struct QueuedItem {
    item: ReviewItem,
    expires_at: DateTime<Utc>,
}

/// Human review gate between localization and publish.
///
/// Items expire once their SLA elapses; expiry is applied lazily at the
/// start of every read or decision, and writes a system decision to the
/// log. Decisions are final.
pub struct ReviewQueue {
    sla_seconds: i64,
    clock: Clock,
    decision_log_path: Option<PathBuf>,
    items: BTreeMap<String, QueuedItem>,
    decisions: Vec<DecisionEntry>,
}

impl ReviewQueue {
    pub fn new(sla_seconds: i64) -> Result<Self, ReviewError> {
        if sla_seconds <= 0 {
            return Err(ReviewError::SlaInvalid);
        }
        Ok(Self {
            sla_seconds,
            clock: system_clock(),
            decision_log_path: None,
            items: BTreeMap::new(),
            decisions: Vec::new(),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Mirrors every decision to `path` as one JSON object per line.
    pub fn with_decision_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.decision_log_path = Some(path.into());
        self
    }

    pub fn sla_seconds(&self) -> i64 {
        self.sla_seconds
    }

    pub fn enqueue(&mut self, new_item: NewReviewItem) -> Result<ReviewItem, ReviewError> {
        let variant_id = new_item.variant_id.trim().to_string();
        if variant_id.is_empty() {
            return Err(ReviewError::VariantRequired);
        }
        if self.items.contains_key(&variant_id) {
            return Err(ReviewError::VariantAlreadyQueued);
        }

        let (queued_at, queued_label) = self.resolve_timestamp(new_item.queued_at.as_deref())?;
        let expires_at = queued_at + Duration::seconds(self.sla_seconds);
        let item = ReviewItem {
            review_item_id: stable_id("review", &[&variant_id, &queued_label]),
            variant_id: variant_id.clone(),
            locale: new_item.locale,
            policy: new_item.policy,
            originality: OriginalitySummary {
                similarity_score: round_usd(new_item.originality.similarity_score),
                threshold: round_usd(new_item.originality.threshold),
                result_code: new_item.originality.result_code,
            },
            cost: CostSummary {
                estimated_usd: round_usd(new_item.cost.estimated_usd),
                currency: new_item.cost.currency,
            },
            status: ReviewStatus::Pending,
            publish_eligible: false,
            queued_at: queued_label.clone(),
            expires_at: format_utc_timestamp(expires_at),
            updated_at: queued_label,
            decision_id: None,
        };

        info!(variant_id = %variant_id, expires_at = %item.expires_at, "review item queued");
        self.items.insert(
            variant_id,
            QueuedItem {
                item: item.clone(),
                expires_at,
            },
        );
        Ok(item)
    }

    /// Pending items ordered by variant id.
    pub fn list_pending(&mut self, now: Option<&str>) -> Result<Vec<ReviewItem>, ReviewError> {
        self.expire_items(now)?;
        Ok(self
            .items
            .values()
            .filter(|queued| queued.item.status == ReviewStatus::Pending)
            .map(|queued| queued.item.clone())
            .collect())
    }

    pub fn get_item(&mut self, variant_id: &str, now: Option<&str>) -> Result<ReviewItem, ReviewError> {
        self.expire_items(now)?;
        self.items
            .get(variant_id.trim())
            .map(|queued| queued.item.clone())
            .ok_or(ReviewError::ItemNotFound)
    }

    pub fn record_decision(
        &mut self,
        variant_id: &str,
        decision: &str,
        reviewer_id: &str,
        reviewed_at: Option<&str>,
        decision_code: Option<&str>,
    ) -> Result<DecisionOutcome, ReviewError> {
        let variant_id = variant_id.trim();
        if !self.items.contains_key(variant_id) {
            return Err(ReviewError::ItemNotFound);
        }

        let (_, reviewed_label) = self.resolve_timestamp(reviewed_at)?;
        self.expire_items(Some(&reviewed_label))?;

        match self.items.get(variant_id).map(|queued| queued.item.status) {
            Some(ReviewStatus::Pending) => {}
            Some(ReviewStatus::Expired) => return Err(ReviewError::ItemExpired),
            Some(_) => return Err(ReviewError::DecisionImmutable),
            None => return Err(ReviewError::ItemNotFound),
        }

        let reviewer_id = reviewer_id.trim();
        if reviewer_id.is_empty() {
            return Err(ReviewError::ReviewerRequired);
        }
        let decision = match decision.trim().to_ascii_lowercase().as_str() {
            "approved" => ReviewDecision::Approved,
            "rejected" => ReviewDecision::Rejected,
            _ => return Err(ReviewError::DecisionInvalid),
        };
        let decision_code = match decision {
            ReviewDecision::Approved => APPROVED_MANUAL_REVIEW_CODE,
            _ => match decision_code.map(str::trim).filter(|code| !code.is_empty()) {
                None | Some(REJECTED_POLICY_CODE) => REJECTED_POLICY_CODE,
                Some(REJECTED_ORIGINALITY_CODE) => REJECTED_ORIGINALITY_CODE,
                Some(_) => return Err(ReviewError::DecisionCodeInvalid),
            },
        };

        let entry = self.append_decision(variant_id, decision, decision_code, reviewer_id, &reviewed_label)?;
        let queued = self.items.get_mut(variant_id).ok_or(ReviewError::ItemNotFound)?;
        queued.item.status = decision.status();
        queued.item.publish_eligible = decision == ReviewDecision::Approved;
        queued.item.updated_at = reviewed_label;
        queued.item.decision_id = Some(entry.decision_id.clone());

        info!(
            variant_id = %variant_id,
            decision = decision.status().as_str(),
            decision_code,
            reviewer_id = %reviewer_id,
            "review decision recorded"
        );
        Ok(DecisionOutcome {
            item: queued.item.clone(),
            decision: entry,
        })
    }

    pub fn decisions(&self) -> &[DecisionEntry] {
        &self.decisions
    }

    pub fn check_publish_eligibility(
        &mut self,
        variant_id: &str,
        now: Option<&str>,
    ) -> Result<PublishEligibility, ReviewError> {
        self.expire_items(now)?;
        let queued = self
            .items
            .get(variant_id.trim())
            .ok_or(ReviewError::ItemNotFound)?;
        if queued.item.status != ReviewStatus::Approved {
            return Err(ReviewError::HumanApprovalRequired);
        }
        Ok(PublishEligibility {
            variant_id: queued.item.variant_id.clone(),
            review_status: queued.item.status,
        })
    }

    fn resolve_timestamp(&self, raw: Option<&str>) -> Result<(DateTime<Utc>, String), ReviewError> {
        match raw {
            Some(raw) => {
                let parsed = parse_utc_timestamp(raw)
                    .ok_or_else(|| ReviewError::TimestampInvalid(raw.to_string()))?;
                Ok((parsed, raw.trim().to_string()))
            }
            None => {
                let now = (self.clock)();
                Ok((now, format_utc_timestamp(now)))
            }
        }
    }

    fn expire_items(&mut self, now: Option<&str>) -> Result<(), ReviewError> {
        let (now, now_label) = self.resolve_timestamp(now)?;
        let expired: Vec<String> = self
            .items
            .iter()
            .filter(|(_, queued)| queued.item.status == ReviewStatus::Pending && now >= queued.expires_at)
            .map(|(variant_id, _)| variant_id.clone())
            .collect();

        for variant_id in expired {
            let entry = self.append_decision(
                &variant_id,
                ReviewDecision::Expired,
                EXPIRED_SLA_CODE,
                SLA_GUARD_REVIEWER,
                &now_label,
            )?;
            if let Some(queued) = self.items.get_mut(&variant_id) {
                queued.item.status = ReviewStatus::Expired;
                queued.item.publish_eligible = false;
                queued.item.updated_at = now_label.clone();
                queued.item.decision_id = Some(entry.decision_id);
            }
            warn!(variant_id = %variant_id, "review item expired past SLA");
        }
        Ok(())
    }

    fn append_decision(
        &mut self,
        variant_id: &str,
        decision: ReviewDecision,
        decision_code: &str,
        reviewer_id: &str,
        reviewed_at: &str,
    ) -> Result<DecisionEntry, ReviewError> {
        let decision_label = decision.status().as_str();
        let entry = DecisionEntry {
            decision_id: stable_id(
                "decision",
                &[variant_id, decision_label, decision_code, reviewer_id, reviewed_at],
            ),
            variant_id: variant_id.to_string(),
            decision,
            decision_code: decision_code.to_string(),
            reviewer_id: reviewer_id.to_string(),
            reviewed_at: reviewed_at.to_string(),
        };

        if let Some(path) = &self.decision_log_path {
            append_json_line(path, &entry).map_err(ReviewError::DecisionLog)?;
        }
        self.decisions.push(entry.clone());
        Ok(entry)
    }
}

pub(crate) fn append_json_line<T: Serialize>(path: &std::path::Path, value: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
    }
    let line = serde_json::to_string(value).map_err(|e| e.to_string())?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| e.to_string())?;
    writeln!(file, "{line}").map_err(|e| e.to_string())
}
