//! Constraint-driven model resolution.
//!
//! The router filters the available [`ModelRecord`]s against the policy
//! constraints (tool support, vision, cost ceiling) and then honors the
//! preferred-model list in order, falling back to the first candidate.

use drover_domain::{Error, Result};

use crate::types::ModelRecord;

#[derive(Debug, Clone, Default)]
pub struct ModelConstraints {
    pub require_tools: bool,
    pub require_vision: bool,
    /// Ceiling on input cost per million tokens. Records with unknown cost
    /// pass the filter.
    pub max_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolutionRequest {
    pub constraints: ModelConstraints,
    pub preferred_models: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRouter;

impl ModelRouter {
    pub fn new() -> Self {
        Self
    }

    /// Pick the model for a turn. Errors when no record satisfies the
    /// constraints.
    pub fn resolve(
        &self,
        records: &[ModelRecord],
        req: &ResolutionRequest,
    ) -> Result<ModelRecord> {
        let candidates: Vec<&ModelRecord> = records
            .iter()
            .filter(|r| Self::satisfies(r, &req.constraints))
            .collect();

        if candidates.is_empty() {
            return Err(Error::NotFound(
                "no model satisfies the policy constraints".into(),
            ));
        }

        for preferred in &req.preferred_models {
            if let Some(hit) = candidates
                .iter()
                .find(|r| &r.id == preferred || &r.provider_model_id == preferred)
            {
                return Ok((*hit).clone());
            }
        }

        Ok(candidates[0].clone())
    }

    fn satisfies(record: &ModelRecord, constraints: &ModelConstraints) -> bool {
        if constraints.require_tools && !record.supports_tools {
            return false;
        }
        if constraints.require_vision && !record.supports_vision {
            return false;
        }
        if let (Some(ceiling), Some(cost)) = (constraints.max_cost_usd, record.input_cost_per_mtok)
        {
            if cost > ceiling {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, tools: bool, vision: bool, cost: Option<f64>) -> ModelRecord {
        ModelRecord {
            id: format!("test/{id}"),
            provider: "test".into(),
            provider_model_id: id.into(),
            supports_tools: tools,
            supports_vision: vision,
            input_cost_per_mtok: cost,
            output_cost_per_mtok: cost,
        }
    }

    #[test]
    fn filters_on_capabilities() {
        let records = vec![record("a", false, false, None), record("b", true, true, None)];
        let req = ResolutionRequest {
            constraints: ModelConstraints {
                require_tools: true,
                ..Default::default()
            },
            preferred_models: vec![],
        };
        let resolved = ModelRouter::new().resolve(&records, &req).unwrap();
        assert_eq!(resolved.provider_model_id, "b");
    }

    #[test]
    fn prefers_listed_models_in_order() {
        let records = vec![
            record("a", true, false, None),
            record("b", true, false, None),
            record("c", true, false, None),
        ];
        let req = ResolutionRequest {
            constraints: ModelConstraints::default(),
            preferred_models: vec!["missing".into(), "c".into(), "b".into()],
        };
        let resolved = ModelRouter::new().resolve(&records, &req).unwrap();
        assert_eq!(resolved.provider_model_id, "c");
    }

    #[test]
    fn cost_ceiling_excludes_expensive_models() {
        let records = vec![record("cheap", true, false, Some(0.5)), record("pricey", true, false, Some(30.0))];
        let req = ResolutionRequest {
            constraints: ModelConstraints {
                max_cost_usd: Some(5.0),
                ..Default::default()
            },
            preferred_models: vec!["pricey".into()],
        };
        let resolved = ModelRouter::new().resolve(&records, &req).unwrap();
        assert_eq!(resolved.provider_model_id, "cheap");
    }

    #[test]
    fn errors_when_nothing_qualifies() {
        let records = vec![record("a", false, false, None)];
        let req = ResolutionRequest {
            constraints: ModelConstraints {
                require_vision: true,
                ..Default::default()
            },
            preferred_models: vec![],
        };
        assert!(ModelRouter::new().resolve(&records, &req).is_err());
    }
}
