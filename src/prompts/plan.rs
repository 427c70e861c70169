//! Planning prompt: the profile goes in, an analysis plan comes out.

use super::{to_pretty_json, Prompt};
use crate::profile::DatasetProfile;

const PLAN_SYSTEM_PROMPT: &str = "You are a senior data analyst. You design focused, \
answerable analyses for a dataset you only know through its profile. You reply with JSON only.";

/// Build the planning prompt for a profile.
pub fn build_plan_prompt(profile: &DatasetProfile) -> Prompt {
    let user = format!(
        r#"Below is the profile of a tabular dataset: schema, per-column statistics and sample rows.

Do the following:
1. Work out what the dataset represents (domain and purpose).
2. Pick the 4 or 5 most interesting questions the data can answer.
3. For each question give the exact columns to use, the kind of analysis
   (correlation, distribution, comparison, trend, anomaly detection), the best
   chart type (bar, scatter, histogram, box, heatmap, line, violin, pie) and a
   short hint of the insight to look for.
4. List the cleaning steps the data needs:
   - For every column with missing values, say explicitly whether to drop those
     rows or fill them, and with what (mean, median, mode, "Unknown", a constant).
   - String columns that encode numbers (durations, counts with units) must be
     converted with tolerant parsing; empty and unexpected values must not crash.
   - Null handling comes before any other operation on a column.

Use only column names that appear in the profile.

Reply with ONLY a JSON object of this shape:
{{
  "dataset_description": "string",
  "cleaning_steps": ["step 1", "step 2"],
  "analyses": [
    {{
      "question": "string",
      "columns": ["col1", "col2"],
      "analysis_type": "string",
      "chart_type": "string",
      "insight_hint": "string"
    }}
  ]
}}

Data profile:
{}"#,
        to_pretty_json(profile)
    );

    Prompt::new(PLAN_SYSTEM_PROMPT, user)
}
