//! Automation templates and their per-course instances.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use pulse_core::error::Result;
use pulse_core::types::{ConditionContext, ConditionSetting, CourseId, InstanceId};

use crate::action::{ActionOverrides, ActionSettings};
use crate::record::ActionType;

/// Site-level automation definition shared by many instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationTemplate {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub conditions: BTreeMap<String, ConditionSetting>,
    #[serde(default)]
    pub actions: BTreeMap<ActionType, ActionSettings>,
}

/// Values an instance replaces on top of its template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceOverrides {
    /// Replaces the template entry with the same name.
    #[serde(default)]
    pub conditions: BTreeMap<String, ConditionSetting>,
    #[serde(default)]
    pub actions: BTreeMap<ActionType, ActionOverrides>,
}

/// A template applied to one course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationInstance {
    pub id: InstanceId,
    pub course_id: CourseId,
    #[serde(default)]
    pub enabled: bool,
    /// How many restart cycles a user may go through; 0 means unlimited.
    #[serde(default)]
    pub frequency_limit: u32,
    pub template: AutomationTemplate,
    #[serde(default)]
    pub overrides: InstanceOverrides,
}

impl AutomationInstance {
    pub fn new(id: InstanceId, course_id: CourseId, template: AutomationTemplate) -> Self {
        Self {
            id,
            course_id,
            enabled: true,
            frequency_limit: 0,
            template,
            overrides: InstanceOverrides::default(),
        }
    }

    /// Template conditions with instance replacements applied.
    pub fn conditions(&self) -> BTreeMap<String, ConditionSetting> {
        let mut merged = self.template.conditions.clone();
        for (name, setting) in &self.overrides.conditions {
            merged.insert(name.clone(), setting.clone());
        }
        merged
    }

    pub fn has_enabled_condition(&self) -> bool {
        self.conditions().values().any(|c| c.enabled)
    }

    pub fn condition_context(&self) -> ConditionContext {
        ConditionContext {
            instance_id: self.id,
            course_id: self.course_id,
            conditions: self.conditions(),
        }
    }

    /// Action kinds configured on the template.
    pub fn action_types(&self) -> Vec<ActionType> {
        self.template.actions.keys().copied().collect()
    }

    /// Merged settings for one action kind, if the template defines it.
    pub fn action_settings(&self, action: ActionType) -> Option<ActionSettings> {
        let base = self.template.actions.get(&action)?;
        Some(match self.overrides.actions.get(&action) {
            Some(overrides) => overrides.apply(base),
            None => base.clone(),
        })
    }

    /// Validate every merged action before the instance is stored.
    pub fn validate(&self, max_digits: usize) -> Result<()> {
        for action in self.action_types() {
            if let Some(settings) = self.action_settings(action) {
                settings.validate(max_digits)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::types::AllocationMethod;

    fn template() -> AutomationTemplate {
        let mut conditions = BTreeMap::new();
        conditions.insert("enrolment".to_string(), ConditionSetting::enabled());
        conditions.insert(
            "activity".to_string(),
            ConditionSetting { enabled: false, settings: serde_json::json!({"modules": [3]}) },
        );
        let mut actions = BTreeMap::new();
        actions.insert(ActionType::Credits, ActionSettings::credits(100.0, AllocationMethod::Add));
        AutomationTemplate { id: 1, title: "Welcome credits".into(), conditions, actions }
    }

    #[test]
    fn test_instance_condition_override() {
        let mut instance = AutomationInstance::new(7, 3, template());
        assert!(instance.has_enabled_condition());

        instance.overrides.conditions.insert(
            "enrolment".into(),
            ConditionSetting { enabled: false, settings: serde_json::Value::Null },
        );
        assert!(!instance.has_enabled_condition());

        let ctx = instance.condition_context();
        assert_eq!(ctx.instance_id, 7);
        assert_eq!(ctx.course_id, 3);
        assert_eq!(ctx.conditions.len(), 2);
    }

    #[test]
    fn test_action_settings_merge() {
        let mut instance = AutomationInstance::new(7, 3, template());
        instance.overrides.actions.insert(
            ActionType::Credits,
            ActionOverrides { credits: Some(30.0), ..Default::default() },
        );
        let settings = instance.action_settings(ActionType::Credits).unwrap();
        assert_eq!(settings.credit_amount(), Some((30.0, AllocationMethod::Add)));
        assert!(instance.action_settings(ActionType::Notification).is_none());
        assert_eq!(instance.action_types(), vec![ActionType::Credits]);
    }

    #[test]
    fn test_validate_rejects_bad_override() {
        let mut instance = AutomationInstance::new(7, 3, template());
        assert!(instance.validate(8).is_ok());
        instance.overrides.actions.insert(
            ActionType::Credits,
            ActionOverrides { credits: Some(-5.0), ..Default::default() },
        );
        assert!(instance.validate(8).is_err());
    }

    #[test]
    fn test_instance_json_roundtrip() {
        let instance = AutomationInstance::new(7, 3, template());
        let json = serde_json::to_string(&instance).unwrap();
        let back: AutomationInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, instance);
    }
}
