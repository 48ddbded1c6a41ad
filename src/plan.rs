//! Plans and plan intake.
//!
//! A [`Plan`] is validated once when it is built and never changes afterwards.
//! The executor reads it through [`PlanSource`]; [`PlanStore`] is the
//! in-memory intake used by the binary and the tests.

use crate::error::PlanError;
use crate::state::SharedStateStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

/// One pick -> test -> place step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanItem {
    /// Component identifier, upper case
    pub part: String,
    /// Target pad label, upper case
    pub target_pad: String,
}

impl PlanItem {
    /// Item with normalized identifiers.
    pub fn new(part: impl AsRef<str>, target_pad: impl AsRef<str>) -> Self {
        Self {
            part: normalize(part.as_ref()),
            target_pad: normalize(target_pad.as_ref()),
        }
    }
}

fn normalize(id: &str) -> String {
    id.trim().to_uppercase()
}

/// Validated, non-empty, ordered list of plan items with unique parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    items: Vec<PlanItem>,
    received_at: DateTime<Utc>,
}

impl Plan {
    /// Normalize and validate `items`.
    pub fn new(items: impl IntoIterator<Item = PlanItem>) -> Result<Self, PlanError> {
        let items: Vec<PlanItem> = items
            .into_iter()
            .map(|item| PlanItem::new(&item.part, &item.target_pad))
            .collect();

        if items.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut seen = HashSet::new();
        for (index, item) in items.iter().enumerate() {
            if item.part.is_empty() {
                return Err(PlanError::BlankField {
                    index,
                    field: "part",
                });
            }
            if item.target_pad.is_empty() {
                return Err(PlanError::BlankField {
                    index,
                    field: "targetPad",
                });
            }
            if !seen.insert(item.part.clone()) {
                return Err(PlanError::DuplicatePart(item.part.clone()));
            }
        }

        Ok(Self {
            items,
            received_at: Utc::now(),
        })
    }

    /// Decode a JSON array of `{part, targetPad}` objects and validate it.
    pub fn from_json(json: &str) -> crate::error::AppResult<Self> {
        let items: Vec<PlanItem> = serde_json::from_str(json)?;
        Ok(Self::new(items)?)
    }

    /// Items in execution order.
    pub fn items(&self) -> &[PlanItem] {
        &self.items
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always false for a constructed plan.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// When the plan was accepted.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// Read-only access to the plan to execute.
pub trait PlanSource: Send + Sync {
    /// The current plan, if one was accepted.
    fn current_plan(&self) -> Option<Plan>;
}

/// In-memory plan intake. Plans do not survive a restart.
#[derive(Debug, Default)]
pub struct PlanStore {
    current: RwLock<Option<Plan>>,
    store: Option<SharedStateStore>,
}

impl PlanStore {
    /// Intake that does not log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intake that writes `Plan received: N steps` to the operator log.
    pub fn with_store(store: SharedStateStore) -> Self {
        Self {
            current: RwLock::new(None),
            store: Some(store),
        }
    }

    /// Validate and accept `items`, replacing any previous plan.
    pub fn submit(&self, items: Vec<PlanItem>) -> Result<Plan, PlanError> {
        let plan = Plan::new(items)?;
        self.accept(plan.clone());
        Ok(plan)
    }

    /// Accept an already validated plan.
    pub fn accept(&self, plan: Plan) {
        let message = format!("Plan received: {} steps", plan.len());
        info!("{}", message);
        if let Some(store) = &self.store {
            store.log(&message);
        }
        *self.current.write() = Some(plan);
    }

    /// Forget the current plan.
    pub fn clear(&self) {
        *self.current.write() = None;
    }
}

impl PlanSource for PlanStore {
    fn current_plan(&self) -> Option<Plan> {
        self.current.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_are_normalized() {
        let plan = Plan::new(vec![PlanItem::new(" r1 ", "a"), PlanItem::new("d1", "b")]).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.items()[0], PlanItem::new("R1", "A"));
        assert_eq!(plan.items()[1].target_pad, "B");
    }

    #[test]
    fn test_validation_errors() {
        assert_eq!(Plan::new(vec![]).unwrap_err(), PlanError::Empty);
        assert_eq!(
            Plan::new(vec![PlanItem::new("R1", "A"), PlanItem::new("r1", "B")]).unwrap_err(),
            PlanError::DuplicatePart("R1".into())
        );
        assert_eq!(
            Plan::new(vec![PlanItem::new("R1", "A"), PlanItem::new("R2", "  ")]).unwrap_err(),
            PlanError::BlankField {
                index: 1,
                field: "targetPad"
            }
        );
    }

    #[test]
    fn test_from_json() {
        let plan = Plan::from_json(r#"[{"part":"r1","targetPad":"a"}]"#).unwrap();
        assert_eq!(plan.items()[0].part, "R1");
        assert!(Plan::from_json("[]").is_err());
        assert!(Plan::from_json("{").is_err());
    }

    #[test]
    fn test_store_submit_logs_and_clears() {
        let state = SharedStateStore::new();
        let plans = PlanStore::with_store(state.clone());
        assert!(plans.current_plan().is_none());

        plans
            .submit(vec![PlanItem::new("R1", "A"), PlanItem::new("D1", "B")])
            .unwrap();
        assert_eq!(plans.current_plan().unwrap().len(), 2);
        assert!(state.logs()[0].ends_with("Plan received: 2 steps"));

        assert!(plans.submit(vec![]).is_err());
        assert_eq!(plans.current_plan().unwrap().len(), 2);

        plans.clear();
        assert!(plans.current_plan().is_none());
    }
}
