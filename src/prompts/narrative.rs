//! Narrative prompt: execution results in, stakeholder summary out.

use serde::Serialize;

use super::{to_pretty_json, Prompt};

const NARRATIVE_SYSTEM_PROMPT: &str = "You are a senior data analyst writing a report \
for stakeholders. You only state what the results support. You reply with JSON only.";

/// What the narrator gets to see.
#[derive(Debug, Clone, Serialize)]
pub struct NarrativeInput {
    pub dataset_description: String,
    /// Parsed stdout document, or `{"raw_output": ...}` when it did not parse.
    pub results: serde_json::Value,
    pub succeeded: Vec<String>,
    pub dropped: Vec<String>,
    pub chart_count: usize,
    pub warnings: Vec<String>,
}

/// Build the narrative prompt.
pub fn build_narrative_prompt(input: &NarrativeInput) -> Prompt {
    let partial_note = if input.dropped.is_empty() && input.warnings.is_empty() {
        String::new()
    } else {
        "\nSome analyses failed or produced no result (listed under \"dropped\"). \
Do not invent findings for them; mention briefly that they could not be completed.\n"
            .to_string()
    };

    let user = format!(
        r#"Below are the raw results of an automated analysis.
{partial_note}
Write:
1. An executive summary of 3 or 4 sentences with the most important takeaway.
2. Key findings: one bullet per completed analysis.
3. Recommendations: 2 or 3 actionable next steps based on the data.

Reply with ONLY a JSON object of this shape:
{{
  "executive_summary": "string",
  "key_findings": ["finding 1", "finding 2"],
  "recommendations": ["recommendation 1", "recommendation 2"]
}}

Analysis results:
{results}"#,
        partial_note = partial_note,
        results = to_pretty_json(input),
    );

    Prompt::new(NARRATIVE_SYSTEM_PROMPT, user)
}
