//! Action configuration: template defaults and instance-level overrides.
//!
//! Decoded once at the configuration boundary; the engine only ever sees
//! the merged [`ActionSettings`].

use serde::{Deserialize, Serialize};

use pulse_core::error::{PulseError, Result};
use pulse_core::types::{AllocationMethod, ModuleId, RecipientSpec};

use crate::record::ActionType;
use crate::recurrence::{BaseDateMode, Delay, RecurrenceSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressOperator {
    /// Every listed module must be complete.
    #[default]
    All,
    /// Any listed module is enough.
    Any,
}

/// Stop conditions that retire a user's schedule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SuppressRule {
    /// Stop once the user completes the course.
    #[serde(default)]
    pub course: bool,
    #[serde(default)]
    pub modules: Vec<ModuleId>,
    #[serde(default)]
    pub operator: SuppressOperator,
}

impl SuppressRule {
    pub fn is_configured(&self) -> bool {
        self.course || !self.modules.is_empty()
    }
}

/// What the action delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionContent {
    Credits {
        credits: f64,
        #[serde(default)]
        allocation_method: AllocationMethod,
    },
    Notification {
        subject: String,
        #[serde(default)]
        body: String,
    },
}

fn bool_true() -> bool { true }

/// Fully resolved configuration of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSettings {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub recipients: Vec<RecipientSpec>,
    #[serde(default)]
    pub interval: RecurrenceSpec,
    #[serde(default)]
    pub base_date: BaseDateMode,
    #[serde(default)]
    pub delay: Delay,
    #[serde(default)]
    pub suppress: SuppressRule,
    /// Maximum completed occurrences per user; 0 means unlimited.
    #[serde(default)]
    pub notify_limit: u32,
    pub content: ActionContent,
}

impl ActionSettings {
    pub fn credits(amount: f64, method: AllocationMethod) -> Self {
        Self::with_content(ActionContent::Credits { credits: amount, allocation_method: method })
    }

    pub fn notification(subject: &str, body: &str) -> Self {
        Self::with_content(ActionContent::Notification {
            subject: subject.to_string(),
            body: body.to_string(),
        })
    }

    fn with_content(content: ActionContent) -> Self {
        Self {
            enabled: true,
            recipients: Vec::new(),
            interval: RecurrenceSpec::Once,
            base_date: BaseDateMode::Now,
            delay: Delay::None,
            suppress: SuppressRule::default(),
            notify_limit: 0,
            content,
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self.content {
            ActionContent::Credits { .. } => ActionType::Credits,
            ActionContent::Notification { .. } => ActionType::Notification,
        }
    }

    pub fn credit_amount(&self) -> Option<(f64, AllocationMethod)> {
        match self.content {
            ActionContent::Credits { credits, allocation_method } => Some((credits, allocation_method)),
            ActionContent::Notification { .. } => None,
        }
    }

    /// Reject invalid input before anything is saved or scheduled.
    pub fn validate(&self, max_digits: usize) -> Result<()> {
        if let Some((credits, _)) = self.credit_amount() {
            validate_credits(credits, max_digits)?;
        }
        self.interval.validate()?;
        self.delay.validate()?;
        if let BaseDateMode::Fixed(ts) = self.base_date {
            if ts < 0 {
                return Err(PulseError::validation(format!("fixed base date must not be negative, got {ts}")));
            }
        }
        for recipient in &self.recipients {
            if let RecipientSpec::Email(email) = recipient {
                email
                    .parse::<lettre::Address>()
                    .map_err(|e| PulseError::validation(format!("Invalid recipient email '{email}': {e}")))?;
            }
        }
        Ok(())
    }
}

/// Credit amounts must be non-negative, finite and at most `max_digits` long once rounded.
pub fn validate_credits(amount: f64, max_digits: usize) -> Result<()> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(PulseError::validation(format!("credits must be a non-negative number, got {amount}")));
    }
    let digits = format!("{}", amount.round() as u64).len();
    if digits > max_digits {
        return Err(PulseError::validation(format!(
            "credits {amount} exceed the maximum of {max_digits} digits"
        )));
    }
    Ok(())
}

/// Instance-level overrides. `None` inherits the template value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<RecipientSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<RecurrenceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_date: Option<BaseDateMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Delay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress: Option<SuppressRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_method: Option<AllocationMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ActionOverrides {
    /// Field-by-field merge on top of `base`.
    pub fn apply(&self, base: &ActionSettings) -> ActionSettings {
        let mut merged = base.clone();
        if let Some(enabled) = self.enabled {
            merged.enabled = enabled;
        }
        if let Some(recipients) = &self.recipients {
            merged.recipients = recipients.clone();
        }
        if let Some(interval) = &self.interval {
            merged.interval = interval.clone();
        }
        if let Some(base_date) = self.base_date {
            merged.base_date = base_date;
        }
        if let Some(delay) = self.delay {
            merged.delay = delay;
        }
        if let Some(suppress) = &self.suppress {
            merged.suppress = suppress.clone();
        }
        if let Some(limit) = self.notify_limit {
            merged.notify_limit = limit;
        }
        match &mut merged.content {
            ActionContent::Credits { credits, allocation_method } => {
                if let Some(amount) = self.credits {
                    *credits = amount;
                }
                if let Some(method) = self.allocation_method {
                    *allocation_method = method;
                }
            }
            ActionContent::Notification { subject, body } => {
                if let Some(s) = &self.subject {
                    *subject = s.clone();
                }
                if let Some(b) = &self.body {
                    *body = b.clone();
                }
            }
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
