//! The target-acquisition pipeline.
//!
//! Five roles take a market-targeting brief from market dynamics to a final
//! decision on which prospects to pursue:
//!
//! ```text
//! market_dynamics_task ─► hpt_criteria_task ─► prospect_search_task
//!          │                      │                     │
//!          │                      └──────────┬──────────┘
//!          │                                 ▼
//!          └──────────────────────► outreach_plan_task
//!                                            │
//!                                            ▼
//!                                   final_decision_task
//! ```

use std::collections::HashMap;

use serde_json::json;

use crate::project::{ConfigError, CrewBase};
use crate::schema::{FieldSpec, FieldType, OutputSchema, SchemaRegistry};

pub const AGENTS_YAML: &str = include_str!("../../config/agents.yaml");
pub const TASKS_YAML: &str = include_str!("../../config/tasks.yaml");

/// Task whose artifact is the pipeline's result.
pub const TERMINAL_TASK: &str = "final_decision_task";

/// Inputs of the reference run.
pub fn default_inputs() -> HashMap<String, String> {
    [
        ("industry", "Marine Engineering and Industrial Manufacturing"),
        ("sector", "Marine propulsion and thruster systems"),
        ("geography", "Europe and Asia-Pacific"),
        ("time_horizon", "12-24 months"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// The embedded agents and tasks.
pub fn project() -> Result<CrewBase, ConfigError> {
    CrewBase::from_yaml(AGENTS_YAML, TASKS_YAML)
}

fn string() -> FieldType {
    FieldType::String
}

fn string_list() -> FieldType {
    FieldType::list(FieldType::String)
}

pub fn market_dynamics_report() -> OutputSchema {
    OutputSchema::new(
        "MarketDynamicsReport",
        vec![
            FieldSpec::required("industry", string()),
            FieldSpec::required("sector", string()),
            FieldSpec::required("geography", string()),
            FieldSpec::required("time_horizon", string()),
            FieldSpec::optional("opportunity_zones", string_list())
                .with_default(json!([]))
                .with_description("Opportunity zones or themes"),
            FieldSpec::optional("risk_areas", string_list())
                .with_default(json!([]))
                .with_description("Risks or vulnerabilities"),
            FieldSpec::optional("timing_windows", string()).with_description("Recommended timing or cadence"),
            FieldSpec::optional("implications_for_target_definition", string())
                .with_description("How market dynamics should shape the target profile"),
        ],
    )
}

pub fn hpt_criteria() -> OutputSchema {
    OutputSchema::new(
        "HPTCriteria",
        vec![
            FieldSpec::required("industry", string()),
            FieldSpec::required("sector", string()),
            FieldSpec::required("icp_description", string()).with_description("Human-readable ideal customer profile"),
            FieldSpec::optional("qualification_criteria", FieldType::map(string()))
                .with_default(json!({}))
                .with_description("Named criteria and short descriptions"),
            FieldSpec::optional("scoring_weights", FieldType::map(FieldType::number_in(0.0, 1.0)))
                .with_default(json!({}))
                .with_description("Weights for scoring prospects"),
            FieldSpec::optional("rationale", string()),
        ],
    )
}

pub fn prospect_list() -> OutputSchema {
    let prospect = FieldType::object(vec![
        FieldSpec::required("name", string()),
        FieldSpec::optional("domain", string()),
        FieldSpec::optional("city", string()),
        FieldSpec::optional("country", string()),
        FieldSpec::optional("primary_industry", string()),
        FieldSpec::optional("reason_matched", string()),
        FieldSpec::optional("match_score", FieldType::number()),
        FieldSpec::optional("notes", string()),
    ]);
    OutputSchema::new(
        "ProspectList",
        vec![
            FieldSpec::required("industry", string()),
            FieldSpec::required("sector", string()),
            FieldSpec::optional("prospects", FieldType::list(prospect)).with_default(json!([])),
        ],
    )
    .with_entities("prospects", "name", "prospect")
}

pub fn outreach_plan() -> OutputSchema {
    let target = FieldType::object(vec![
        FieldSpec::required("rank", FieldType::integer_at_least(1)),
        FieldSpec::required("prospect", string()),
        FieldSpec::required("priority_score", FieldType::number_in(0.0, 1.0)),
        FieldSpec::required("approach", string()),
        FieldSpec::required("key_message", string()),
        FieldSpec::optional("channel", string()),
    ]);
    OutputSchema::new(
        "OutreachPlan",
        vec![
            FieldSpec::required("industry", string()),
            FieldSpec::required("sector", string()),
            FieldSpec::required("ranked_targets", FieldType::list(target)),
            FieldSpec::optional("cadence", string()),
            FieldSpec::optional("success_metrics", string_list()).with_default(json!([])),
        ],
    )
}

pub fn final_decision() -> OutputSchema {
    OutputSchema::new(
        "FinalDecision",
        vec![
            FieldSpec::required("recommended_targets", string_list()),
            FieldSpec::required("decision_summary", string()),
            FieldSpec::required("confidence", FieldType::number_in(0.0, 1.0)),
            FieldSpec::optional("next_steps", string_list()).with_default(json!([])),
            FieldSpec::optional("supporting_evidence", FieldType::map(FieldType::Any)).with_default(json!({})),
        ],
    )
}

/// A registry holding every pipeline schema. Tasks are bound when the crew
/// starts.
pub fn schema_registry() -> SchemaRegistry {
    SchemaRegistry::new()
        .with_schema(market_dynamics_report())
        .with_schema(hpt_criteria())
        .with_schema(prospect_list())
        .with_schema(outreach_plan())
        .with_schema(final_decision())
}
