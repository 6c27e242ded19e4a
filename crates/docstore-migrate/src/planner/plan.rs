//! Declarative mutation plans.
//!
//! A [`MutationPlan`] replaces a hand-written script: which collection to
//! scan, which documents qualify, and the ordered op templates to apply.
//!
//! ```yaml
//! name: rename-display-name
//! collection: users
//! filter: { field: status, equals: active }
//! when:
//!   - exists: displayName
//! ops:
//!   - rename_field: { from: displayName, to: display_name }
//!   - copy_field: { from: bio, target: "publicProfiles/{id}", mode: merge }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::MutationPlanner;
use crate::core::{CollectionPath, Document, DocumentPath, FieldPath, FieldWrite, MutationOp};
use crate::error::{MigrateError, Result};
use crate::store::EqualityFilter;

/// Predicate evaluated against a scanned document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Exists(FieldPath),
    Missing(FieldPath),
    Equals { field: FieldPath, value: Value },
    NotEquals { field: FieldPath, value: Value },
}

impl Condition {
    pub fn holds(&self, doc: &Document) -> bool {
        match self {
            Condition::Exists(field) => doc.contains(field),
            Condition::Missing(field) => !doc.contains(field),
            Condition::Equals { field, value } => doc.get(field) == Some(value),
            Condition::NotEquals { field, value } => doc.get(field) != Some(value),
        }
    }
}

/// Deterministic sampling of documents.
///
/// Membership depends only on `seed` and the document path, so reruns with
/// the same seed select the same documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    /// Fraction of documents to select, in `0.0..=1.0`.
    pub rate: f64,
    pub seed: u64,
}

impl Sampling {
    pub fn selects(&self, path: &DocumentPath) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_be_bytes());
        hasher.update(path.as_str().as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let position = u64::from_be_bytes(bytes) as f64 / u64::MAX as f64;
        position < self.rate
    }
}

/// How a cross-document write treats a missing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Update an existing document; the commit fails if it is missing.
    Update,
    /// Create the document if needed, merging into it otherwise.
    Merge,
}

/// One op in a plan. `target` is an optional document path template; when
/// omitted the op applies to the scanned document.
///
/// Template placeholders: `{id}` (document id), `{path}` (document path),
/// `{collection}` (collection path), `{parent}` (owning document path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpTemplate {
    SetField {
        field: FieldPath,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    DeleteField {
        field: FieldPath,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    RenameField {
        from: FieldPath,
        to: FieldPath,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    MergeFields {
        #[serde(default)]
        set: BTreeMap<FieldPath, Value>,
        #[serde(default)]
        delete: Vec<FieldPath>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Copy a field of the scanned document to another document.
    CopyField {
        from: FieldPath,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<FieldPath>,
        target: String,
        mode: WriteMode,
    },
    DeleteDocument {
        #[serde(default)]
        recursive: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
}

impl OpTemplate {
    fn target(&self) -> Option<&str> {
        match self {
            OpTemplate::SetField { target, .. }
            | OpTemplate::DeleteField { target, .. }
            | OpTemplate::RenameField { target, .. }
            | OpTemplate::MergeFields { target, .. }
            | OpTemplate::DeleteDocument { target, .. } => target.as_deref(),
            OpTemplate::CopyField { target, .. } => Some(target),
        }
    }

    fn targets_self(&self) -> bool {
        self.target().map_or(true, |t| t == "{path}")
    }
}

/// A complete declarative migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationPlan {
    /// Migration name, used in logs and the result.
    pub name: String,

    /// Collection to scan.
    pub collection: CollectionPath,

    /// When set, each document of `collection` is a parent and the plan runs
    /// over `{parent}/{fan_out_subcollection}` instead, one worker per parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_out_subcollection: Option<String>,

    /// Equality filter pushed down to the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<EqualityFilter>,

    /// All must hold for a document to be mutated.
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub when: Vec<Condition>,

    /// Fields every scanned document must have; a missing one is a per-document error.
    #[serde(default)]
    pub require: Vec<FieldPath>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Sampling>,

    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub ops: Vec<OpTemplate>,
}

impl MutationPlan {
    /// Check the plan is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MigrateError::Config("plan.name is required".into()));
        }
        if self.ops.is_empty() {
            return Err(MigrateError::Config(format!(
                "plan '{}' must contain at least one op",
                self.name
            )));
        }
        if let Some(sub) = &self.fan_out_subcollection {
            crate::core::path::validate_segment(sub).map_err(|_| {
                MigrateError::Config(format!(
                    "plan.fan_out_subcollection {:?} is not a valid collection id",
                    sub
                ))
            })?;
        }
        if let Some(sample) = &self.sample {
            if !(0.0..=1.0).contains(&sample.rate) {
                return Err(MigrateError::Config(format!(
                    "plan.sample.rate must be within 0.0..=1.0, got {}",
                    sample.rate
                )));
            }
        }

        let mut self_deleted = false;
        for (i, op) in self.ops.iter().enumerate() {
            if self_deleted && op.targets_self() {
                return Err(MigrateError::Config(format!(
                    "plan '{}': op #{} writes to the document after it was deleted",
                    self.name,
                    i + 1
                )));
            }
            match op {
                OpTemplate::RenameField { from, to, .. }
                    if from.starts_with(to) || to.starts_with(from) =>
                {
                    return Err(MigrateError::Config(format!(
                        "plan '{}': cannot rename '{}' to '{}'",
                        self.name, from, to
                    )));
                }
                OpTemplate::MergeFields { set, delete, .. } if set.is_empty() && delete.is_empty() => {
                    return Err(MigrateError::Config(format!(
                        "plan '{}': merge_fields op #{} is empty",
                        self.name,
                        i + 1
                    )));
                }
                OpTemplate::CopyField { target, .. } if target == "{path}" => {
                    return Err(MigrateError::Config(format!(
                        "plan '{}': copy_field must target another document",
                        self.name
                    )));
                }
                OpTemplate::DeleteDocument { .. } if op.targets_self() => self_deleted = true,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Planner evaluating a [`MutationPlan`].
#[derive(Debug, Clone)]
pub struct DeclarativePlanner {
    plan: MutationPlan,
}

impl DeclarativePlanner {
    pub fn new(plan: MutationPlan) -> Result<Self> {
        plan.validate()?;
        Ok(Self { plan })
    }

    pub fn plan_definition(&self) -> &MutationPlan {
        &self.plan
    }

    fn render_target(template: Option<&str>, doc: &Document) -> Result<DocumentPath> {
        let Some(template) = template else {
            return Ok(doc.path().clone());
        };

        let mut rendered = template
            .replace("{path}", doc.path().as_str())
            .replace("{collection}", doc.path().collection().as_str())
            .replace("{id}", doc.id());
        if rendered.contains("{parent}") {
            let parent = doc.path().collection().parent().ok_or_else(|| {
                MigrateError::validation(
                    doc.path().as_str(),
                    format!("target '{}' uses {{parent}} on a root collection", template),
                )
            })?;
            rendered = rendered.replace("{parent}", parent.as_str());
        }

        DocumentPath::parse(&rendered).map_err(|_| {
            MigrateError::validation(
                doc.path().as_str(),
                format!("target '{}' renders to invalid path '{}'", template, rendered),
            )
        })
    }

    fn render_op(template: &OpTemplate, doc: &Document) -> Result<Option<MutationOp>> {
        let path = Self::render_target(template.target(), doc)?;
        let op = match template {
            OpTemplate::SetField { field, value, .. } => MutationOp::SetField {
                path,
                field: field.clone(),
                value: value.clone(),
            },
            OpTemplate::DeleteField { field, .. } => MutationOp::DeleteField {
                path,
                field: field.clone(),
            },
            OpTemplate::RenameField { from, to, .. } => MutationOp::RenameField {
                path,
                from: from.clone(),
                to: to.clone(),
            },
            OpTemplate::MergeFields { set, delete, .. } => {
                let mut fields: BTreeMap<FieldPath, FieldWrite> = set
                    .iter()
                    .map(|(k, v)| (k.clone(), FieldWrite::Set(v.clone())))
                    .collect();
                for field in delete {
                    fields.insert(field.clone(), FieldWrite::Delete);
                }
                MutationOp::MergeFields { path, fields }
            }
            OpTemplate::CopyField { from, to, mode, .. } => {
                let Some(value) = doc.get(from) else {
                    return Ok(None);
                };
                let field = to.clone().unwrap_or_else(|| from.clone());
                match mode {
                    WriteMode::Update => MutationOp::SetField {
                        path,
                        field,
                        value: value.clone(),
                    },
                    WriteMode::Merge => MutationOp::MergeFields {
                        path,
                        fields: BTreeMap::from([(field, FieldWrite::Set(value.clone()))]),
                    },
                }
            }
            OpTemplate::DeleteDocument { recursive, .. } => MutationOp::DeleteDocument {
                path,
                recursive: *recursive,
            },
        };
        Ok(Some(op))
    }
}

impl MutationPlanner for DeclarativePlanner {
    fn plan(&self, doc: &Document) -> Result<Vec<MutationOp>> {
        for field in &self.plan.require {
            if !doc.contains(field) {
                return Err(MigrateError::validation(
                    doc.path().as_str(),
                    format!("required field '{}' is missing", field),
                ));
            }
        }
        if !self.plan.when.iter().all(|c| c.holds(doc)) {
            return Ok(Vec::new());
        }
        if let Some(sample) = &self.plan.sample {
            if !sample.selects(doc.path()) {
                return Ok(Vec::new());
            }
        }

        // Later templates see the effect of earlier ones on the scanned document.
        let mut working = doc.clone();
        let mut ops = Vec::new();
        for template in &self.plan.ops {
            let Some(op) = Self::render_op(template, &working)? else {
                continue;
            };
            op.validate()?;
            if op.path() == working.path() {
                if op.is_noop_for(&working) {
                    continue;
                }
                op.apply_to(&mut working);
            }
            ops.push(op);
        }
        Ok(ops)
    }

    fn name(&self) -> &str {
        &self.plan.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(path: &str, fields: Value) -> Document {
        Document::from_json(DocumentPath::parse(path).unwrap(), fields)
    }

    fn plan_from_yaml(yaml: &str) -> MutationPlan {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn rename_plan() -> MutationPlan {
        plan_from_yaml(
            r#"
name: rename
collection: users
ops:
  - rename_field: { from: old, to: new }
"#,
        )
    }

    #[test]
    fn test_rename_plan_emits_op_when_source_present() {
        let planner = DeclarativePlanner::new(rename_plan()).unwrap();
        let ops = planner.plan(&doc("users/u1", json!({"old": 7}))).unwrap();
        assert_eq!(
            ops,
            vec![MutationOp::RenameField {
                path: DocumentPath::parse("users/u1").unwrap(),
                from: FieldPath::parse("old").unwrap(),
                to: FieldPath::parse("new").unwrap(),
            }]
        );
    }

    #[test]
    fn test_rename_plan_is_noop_without_source() {
        let planner = DeclarativePlanner::new(rename_plan()).unwrap();
        assert!(planner.plan(&doc("users/u1", json!({"new": 7}))).unwrap().is_empty());
    }

    #[test]
    fn test_planning_is_deterministic() {
        let planner = DeclarativePlanner::new(rename_plan()).unwrap();
        let d = doc("users/u1", json!({"old": [1, 2, 3]}));
        assert_eq!(planner.plan(&d).unwrap(), planner.plan(&d).unwrap());
    }

    #[test]
    fn test_conditions_gate_ops() {
        let plan = plan_from_yaml(
            r#"
name: fix-category
collection: products
when:
  - equals: { field: category, value: "shoe" }
  - missing: fixed
ops:
  - set_field: { field: category, value: "shoes" }
  - set_field: { field: fixed, value: true }
"#,
        );
        let planner = DeclarativePlanner::new(plan).unwrap();
        assert_eq!(
            planner
                .plan(&doc("products/p1", json!({"category": "shoe"})))
                .unwrap()
                .len(),
            2
        );
        assert!(planner
            .plan(&doc("products/p2", json!({"category": "hat"})))
            .unwrap()
            .is_empty());
        assert!(planner
            .plan(&doc("products/p3", json!({"category": "shoe", "fixed": true})))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_ops_already_satisfied_are_dropped() {
        let plan = plan_from_yaml(
            r#"
name: normalize
collection: users
ops:
  - set_field: { field: version, value: 2 }
  - delete_field: { field: legacy }
"#,
        );
        let planner = DeclarativePlanner::new(plan).unwrap();
        let ops = planner
            .plan(&doc("users/u1", json!({"version": 2, "legacy": "x"})))
            .unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind(), "delete_field");

        assert!(planner
            .plan(&doc("users/u1", json!({"version": 2})))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_required_field_missing_is_validation_error() {
        let plan = plan_from_yaml(
            r#"
name: needs-email
collection: users
require: [email]
ops:
  - set_field: { field: checked, value: true }
"#,
        );
        let planner = DeclarativePlanner::new(plan).unwrap();
        let err = planner.plan(&doc("users/u1", json!({}))).unwrap_err();
        assert!(err.is_document_scoped());
    }

    #[test]
    fn test_copy_field_to_sibling_collection() {
        let plan = plan_from_yaml(
            r#"
name: publish-bio
collection: users
ops:
  - copy_field: { from: bio, target: "publicProfiles/{id}", mode: merge }
  - delete_field: { field: bio }
"#,
        );
        let planner = DeclarativePlanner::new(plan).unwrap();
        let ops = planner.plan(&doc("users/u7", json!({"bio": "hello"}))).unwrap();
        assert_eq!(ops.len(), 2);
        match &ops[0] {
            MutationOp::MergeFields { path, fields } => {
                assert_eq!(path.as_str(), "publicProfiles/u7");
                assert_eq!(
                    fields.get(&FieldPath::parse("bio").unwrap()),
                    Some(&FieldWrite::Set(json!("hello")))
                );
            }
            other => panic!("unexpected op {:?}", other),
        }

        // Already moved: nothing to copy, nothing to delete.
        assert!(planner.plan(&doc("users/u7", json!({}))).unwrap().is_empty());
    }

    #[test]
    fn test_parent_placeholder() {
        let plan = plan_from_yaml(
            r#"
name: child-count
collection: users
fan_out_subcollection: children
ops:
  - set_field: { field: has_children, value: true, target: "{parent}" }
"#,
        );
        let planner = DeclarativePlanner::new(plan).unwrap();
        let ops = planner.plan(&doc("users/u1/children/c1", json!({}))).unwrap();
        assert_eq!(ops[0].path().as_str(), "users/u1");

        let err = planner.plan(&doc("users/u1", json!({}))).unwrap_err();
        assert!(err.is_document_scoped());
    }

    #[test]
    fn test_sampling_is_seeded() {
        let sample = Sampling { rate: 0.3, seed: 42 };
        let paths: Vec<DocumentPath> = (0..1000)
            .map(|i| DocumentPath::parse(&format!("users/u{}", i)).unwrap())
            .collect();
        let first: Vec<bool> = paths.iter().map(|p| sample.selects(p)).collect();
        let second: Vec<bool> = paths.iter().map(|p| sample.selects(p)).collect();
        assert_eq!(first, second);

        let selected = first.iter().filter(|s| **s).count();
        assert!((200..400).contains(&selected), "selected {}", selected);

        let other_seed = Sampling { rate: 0.3, seed: 7 };
        let third: Vec<bool> = paths.iter().map(|p| other_seed.selects(p)).collect();
        assert_ne!(first, third);
    }

    #[test]
    fn test_plan_validation() {
        let mut plan = rename_plan();
        plan.ops.clear();
        assert!(plan.validate().is_err());

        let after_delete = plan_from_yaml(
            r#"
name: bad
collection: users
ops:
  - delete_document: {}
  - set_field: { field: x, value: 1 }
"#,
        );
        assert!(after_delete.validate().is_err());

        let bad_rate = plan_from_yaml(
            r#"
name: bad
collection: users
sample: { rate: 1.5, seed: 1 }
ops:
  - delete_field: { field: x }
"#,
        );
        assert!(bad_rate.validate().is_err());
    }
}
